//! Periodic jobs.
//!
//! Each [`Job`] runs in its own [`Cron`] loop. A run first takes the job's
//! KV mutex, so across all instances at most one runs a job at a time, and
//! records when it ran, how long it took and what it did in
//! `cron_stats:{name}`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use mailroom_models::{ContactFire, FireType, SESSION_FIRE_TYPES};
use tracing::{debug, error, info, warn};

use crate::queues;
use crate::runtime::Runtime;
use crate::tasks::{ContactTask, SessionExpired, TaskResult, WaitExpired, WaitTimeout};
use crate::{campaigns, ivr, webhooks};

/// Session timer fires looked at per run.
pub const TIMER_SCAN_LIMIT: usize = 10_000;

/// What a run did, by name.
pub type Counts = BTreeMap<&'static str, usize>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    CampaignFires,
    SessionTimers,
    RetryCalls,
    ThrottledCalls,
    EndWebhookIncidents,
}

pub const ALL_JOBS: [Job; 5] = [
    Job::CampaignFires,
    Job::SessionTimers,
    Job::RetryCalls,
    Job::ThrottledCalls,
    Job::EndWebhookIncidents,
];

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CampaignFires => "fire_campaign_events",
            Self::SessionTimers => "fire_session_timers",
            Self::RetryCalls => "retry_errored_calls",
            Self::ThrottledCalls => "reconcile_throttled_calls",
            Self::EndWebhookIncidents => "end_webhook_incidents",
        }
    }

    pub fn interval(&self) -> Duration {
        match self {
            Self::CampaignFires | Self::RetryCalls | Self::EndWebhookIncidents => {
                Duration::from_secs(60)
            }
            Self::SessionTimers | Self::ThrottledCalls => Duration::from_secs(15),
        }
    }

    async fn perform(&self, rt: &Runtime, now: DateTime<Utc>) -> TaskResult<Counts> {
        let (key, count) = match self {
            Self::CampaignFires => ("queued", campaigns::fire_due(rt, now).await?),
            Self::SessionTimers => ("queued", fire_session_timers(rt, now).await?),
            Self::RetryCalls => ("retried", ivr::retry_calls(rt, now).await?),
            Self::ThrottledCalls => ("placed", ivr::reconcile_throttled(rt).await?),
            Self::EndWebhookIncidents => ("ended", webhooks::end_healthy_incidents(rt).await?),
        };
        Ok(Counts::from([(key, count)]))
    }
}

pub fn lock_key(job: Job) -> String {
    format!("cron:{}", job.name())
}

pub fn stats_key(job: Job) -> String {
    format!("cron_stats:{}", job.name())
}

/// Run a job once if no other instance is running it. Returns `None` when
/// the job was locked elsewhere.
pub async fn run_once(rt: &Runtime, job: Job, now: DateTime<Utc>) -> TaskResult<Option<Counts>> {
    let key = lock_key(job);
    let owner = rt.config.instance_id.as_str();
    // held for several intervals so a slow run isn't joined by a second
    if !rt.kv.set_nx(&key, owner, job.interval() * 5).await? {
        debug!(cron = job.name(), "cron running elsewhere, skipping");
        return Ok(None);
    }

    let started = Instant::now();
    let result = job.perform(rt, now).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    if let Err(err) = rt.kv.delete_if_equals(&key, owner).await {
        warn!(cron = job.name(), error = %err, "failed to release cron lock");
    }
    let counts = result?;
    record_stats(rt, job, now, elapsed_ms, &counts).await;

    if counts.values().any(|n| *n > 0) {
        info!(cron = job.name(), elapsed_ms, ?counts, "cron run complete");
    } else {
        debug!(cron = job.name(), elapsed_ms, "cron run complete");
    }
    Ok(Some(counts))
}

async fn record_stats(rt: &Runtime, job: Job, now: DateTime<Utc>, elapsed_ms: u64, counts: &Counts) {
    let key = stats_key(job);
    let mut fields = vec![
        ("last_start", now.to_rfc3339()),
        ("elapsed_ms", elapsed_ms.to_string()),
    ];
    fields.extend(counts.iter().map(|(name, n)| (*name, n.to_string())));
    for (field, value) in fields {
        if let Err(err) = rt.kv.hash_set(&key, field, &value).await {
            warn!(cron = job.name(), error = %err, "failed to record cron stats");
            return;
        }
    }
}

/// Queue the contact task for each due session timer, then delete the
/// fires. Returns how many tasks were queued.
pub async fn fire_session_timers(rt: &Runtime, now: DateTime<Utc>) -> TaskResult<usize> {
    let fires = rt
        .db
        .load_due_fires(&SESSION_FIRE_TYPES, now, TIMER_SCAN_LIMIT)
        .await?;
    if fires.is_empty() {
        return Ok(0);
    }

    let mut queued = 0;
    let mut done = Vec::with_capacity(fires.len());
    for fire in &fires {
        match timer_task(fire) {
            Some(task) => {
                queues::queue_contact_task(rt.kv.as_ref(), fire.org_id, fire.contact_id, &task, false)
                    .await?;
                queued += 1;
            }
            None => warn!(fire_id = %fire.id, scope = %fire.scope, "session timer missing its session, dropping"),
        }
        done.push(fire.id);
    }

    let mut tx = rt.db.begin().await?;
    tx.delete_fires(&done).await?;
    tx.commit().await?;
    Ok(queued)
}

fn timer_task(fire: &ContactFire) -> Option<ContactTask> {
    let session_uuid = fire.session_uuid?;
    Some(match fire.fire_type {
        FireType::WaitExpires => ContactTask::WaitExpired(WaitExpired {
            session_uuid,
            sprint_uuid: fire.sprint_uuid?,
        }),
        FireType::WaitTimeout => ContactTask::WaitTimeout(WaitTimeout {
            session_uuid,
            sprint_uuid: fire.sprint_uuid?,
        }),
        FireType::SessionExpires => ContactTask::SessionExpired(SessionExpired { session_uuid }),
        FireType::Campaign => return None,
    })
}

/// Loop running one job every interval until shutdown.
pub struct Cron {
    pub rt: Arc<Runtime>,
    pub job: Job,
}

impl Cron {
    pub async fn run(self, shutdown: tokio_util::sync::WaitForCancellationFutureOwned) {
        info!(
            cron = self.job.name(),
            interval_ms = self.job.interval().as_millis() as u64,
            "cron started"
        );

        let mut shutdown = std::pin::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(cron = self.job.name(), "cron shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.job.interval()) => {
                    if let Err(e) = run_once(&self.rt, self.job, Utc::now()).await {
                        error!(cron = self.job.name(), error = ?e, "cron run failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use mailroom_kv_backend::KvBackend;

    use super::*;
    use crate::queues::contact_queue_key;
    use crate::test_support::{self, ANN, ORG};

    #[tokio::test]
    async fn test_session_timers_queue_contact_tasks() {
        let fx = test_support::fixture().await;
        fx.start_favorites(ANN).await;
        let fires = fx.mem.fires();
        assert!(!fires.is_empty());

        // nothing is due yet
        assert_eq!(fire_session_timers(&fx.rt, Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::days(60);
        assert_eq!(fire_session_timers(&fx.rt, later).await.unwrap(), fires.len());
        assert!(fx.mem.fires().is_empty());

        let queued = fx.rt.kv.list_range(&contact_queue_key(ORG, ANN)).await.unwrap();
        assert_eq!(queued.len(), fires.len());
        assert!(queued.iter().any(|raw| raw.contains("wait_timeout")));
    }

    #[tokio::test]
    async fn test_run_records_stats_and_releases_lock() {
        let fx = test_support::fixture().await;
        let counts = run_once(&fx.rt, Job::SessionTimers, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counts["queued"], 0);

        let stats = fx.rt.kv.hash_get_all(&stats_key(Job::SessionTimers)).await.unwrap();
        assert!(stats.contains_key("last_start"));
        assert!(stats.contains_key("elapsed_ms"));
        assert_eq!(stats["queued"], "0");
        assert!(fx.rt.kv.get(&lock_key(Job::SessionTimers)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_locked_job_is_skipped() {
        let fx = test_support::fixture().await;
        fx.rt
            .kv
            .set_nx(&lock_key(Job::RetryCalls), "other-instance", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(run_once(&fx.rt, Job::RetryCalls, Utc::now()).await.unwrap().is_none());
        assert_eq!(
            fx.rt.kv.get(&lock_key(Job::RetryCalls)).await.unwrap().as_deref(),
            Some("other-instance")
        );
    }

    #[test]
    fn test_job_names_are_unique() {
        let mut names: Vec<_> = ALL_JOBS.iter().map(Job::name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), ALL_JOBS.len());
    }
}
