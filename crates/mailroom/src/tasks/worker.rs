//! Queue workers.
//!
//! A [`Foreman`] owns one fair queue. Every poll it hands tasks to idle
//! workers until either runs out, then sleeps. On shutdown it stops taking
//! new tasks and waits for in-flight ones to finish.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mailroom_models::OrgID;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::OrgTask;
use crate::queues;
use crate::runtime::Runtime;

#[derive(Debug, Clone)]
pub struct ForemanConfig {
    pub queue: &'static str,
    pub workers: usize,
    /// How long to sleep once the queue is drained.
    pub poll_interval: Duration,
}

impl ForemanConfig {
    pub fn new(queue: &'static str, workers: usize) -> Self {
        Self {
            queue,
            workers: workers.max(1),
            poll_interval: Duration::from_millis(50),
        }
    }
}

pub struct Foreman {
    pub rt: Arc<Runtime>,
    pub config: ForemanConfig,
}

impl Foreman {
    pub async fn run(self, shutdown: tokio_util::sync::WaitForCancellationFutureOwned) {
        info!(
            queue = self.config.queue,
            workers = self.config.workers,
            "foreman started"
        );

        let permits = Arc::new(Semaphore::new(self.config.workers));
        let mut workers = JoinSet::new();
        let mut shutdown = std::pin::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(queue = self.config.queue, "foreman shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    while workers.try_join_next().is_some() {}
                    if let Err(e) = self.dispatch(&permits, &mut workers).await {
                        error!(queue = self.config.queue, error = ?e, "failed to pop task");
                    }
                }
            }
        }

        let in_flight = workers.len();
        if in_flight > 0 {
            info!(queue = self.config.queue, in_flight, "waiting for workers to finish");
        }
        while workers.join_next().await.is_some() {}
    }

    /// Hand queued tasks to idle workers.
    async fn dispatch(
        &self,
        permits: &Arc<Semaphore>,
        workers: &mut JoinSet<()>,
    ) -> Result<(), mailroom_kv_backend::KvError> {
        loop {
            let Ok(permit) = permits.clone().try_acquire_owned() else {
                return Ok(());
            };
            let Some((owner, raw)) = self.rt.kv.queue_pop(self.config.queue).await? else {
                return Ok(());
            };
            let rt = self.rt.clone();
            let queue = self.config.queue;
            workers.spawn(async move {
                perform_task(&rt, queue, &owner, &raw).await;
                drop(permit);
            });
        }
    }
}

/// Decode and run a task popped from a queue, then tell the queue the
/// owner's task is done. Org tasks aren't retried; their failures are logged.
pub async fn perform_task(rt: &Runtime, queue: &str, owner: &str, raw: &str) {
    match owner.parse::<i64>() {
        Ok(org_id) => run_org_task(rt, queue, OrgID(org_id), raw).await,
        Err(_) => error!(queue, owner, "task owner isn't an org id, dropping"),
    }
    if let Err(err) = rt.kv.queue_done(queue, owner).await {
        warn!(queue, owner, error = %err, "failed to mark task done");
    }
}

async fn run_org_task(rt: &Runtime, queue: &str, org_id: OrgID, raw: &str) {
    let queued = match queues::decode::<OrgTask>(raw) {
        Ok(queued) => queued,
        Err(err) => {
            error!(queue, %org_id, error = %err, "undecodable task, dropping");
            return;
        }
    };
    let task_type = queued.task.type_name();
    let latency_ms = (chrono::Utc::now() - queued.queued_on).num_milliseconds();
    debug!(queue, %org_id, task_type, latency_ms, "performing task");

    let started = Instant::now();
    let result = queued.task.perform(rt, org_id).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(()) => debug!(queue, %org_id, task_type, elapsed_ms, "task complete"),
        Err(err) if err.is_not_found() => {
            warn!(queue, %org_id, task_type, error = %err, "task target not found, dropping")
        }
        Err(err) => error!(queue, %org_id, task_type, elapsed_ms, error = %err, "task failed"),
    }
}
