//! Campaign points: scheduling fires for a point's contacts, firing due
//! fires in batches, and running a fired batch.
//!
//! A point's `fire_version` is what makes a fire valid. Scheduling always
//! writes fires with the point's current version, and anything carrying an
//! older one is dropped when fired or triggered.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mailroom_flows::{FlowContact, FlowRef, Trigger};
use mailroom_kv_backend::Priority;
use mailroom_models::{
    Broadcast, BroadcastID, BroadcastUUID, CampaignPoint, ContactFire, ContactID, Exclusions,
    FireID, FireType, FlowType, Org, OrgID, PointAction, PointID, PointStatus, StartMode,
    parse_timezone,
};
use tracing::{debug, info, warn};

use crate::assets::{OrgAssets, Refresh};
use crate::locker::START_LOCK_WAIT;
use crate::queues::{self, BATCH};
use crate::runner;
use crate::runtime::Runtime;
use crate::scene::flow_contact;
use crate::tasks::{BulkCampaignTrigger, OrgTask, SendBroadcast, TaskError, TaskResult};

/// Contacts per `bulk_campaign_trigger` task.
pub const TRIGGER_BATCH_SIZE: usize = 100;
/// Due fires looked at per cron run.
pub const FIRE_SCAN_LIMIT: usize = 10_000;

const SCHEDULE_LOCK_TTL: Duration = Duration::from_secs(60 * 60);
const SCHEDULE_LOAD_BATCH: usize = 500;

const RECENT_FIRES_CAP: usize = 10;
const RECENT_FIRES_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub fn schedule_lock_key(point_id: PointID) -> String {
    format!("lock:campaign_point:{point_id}")
}

pub fn recent_fires_key(point_id: PointID) -> String {
    format!("recent_campaign_fires:{point_id}")
}

/// When a point fires for a contact, or `None` if the contact has no value
/// for the point's relative-to field or the time has passed.
pub fn fire_time(
    org: &Org,
    point: &CampaignPoint,
    contact: &FlowContact,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let start = match point.relative_to.as_str() {
        "created_on" => Some(contact.created_on),
        "last_seen_on" => contact.last_seen_on,
        key => contact.fields.get(key).and_then(|v| v.datetime),
    }?;
    let tz = contact
        .timezone
        .as_deref()
        .and_then(parse_timezone)
        .unwrap_or_else(|| org.tz());
    point.schedule_for(tz, now, start)
}

/// Org assets that know about the point, reloading campaigns once when the
/// cached snapshot predates it.
async fn assets_with_point(
    rt: &Runtime,
    org_id: OrgID,
    point_id: PointID,
) -> TaskResult<Arc<OrgAssets>> {
    let assets = rt.org_assets(org_id).await?;
    if assets.point_by_id(point_id).is_some() {
        return Ok(assets);
    }
    debug!(%point_id, "point not in cached assets, refreshing campaigns");
    Ok(rt
        .assets
        .get_with_refresh(rt.db.as_ref(), org_id, Refresh::CAMPAIGNS)
        .await?)
}

/// Recreate all fires of a point for the members of its campaign's group.
/// Returns how many fires were created, or `None` when another scheduling
/// run for the point holds the lock.
pub async fn schedule_point(
    rt: &Runtime,
    org_id: OrgID,
    point_id: PointID,
) -> TaskResult<Option<usize>> {
    let lock_key = schedule_lock_key(point_id);
    let lock_value = uuid::Uuid::new_v4().to_string();
    if !rt.kv.set_nx(&lock_key, &lock_value, SCHEDULE_LOCK_TTL).await? {
        info!(%point_id, "campaign point already being scheduled");
        return Ok(None);
    }

    let result = schedule_locked(rt, org_id, point_id).await;
    if let Err(err) = rt.kv.delete_if_equals(&lock_key, &lock_value).await {
        warn!(%point_id, error = %err, "failed to release campaign point lock");
    }
    result.map(Some)
}

async fn schedule_locked(rt: &Runtime, org_id: OrgID, point_id: PointID) -> TaskResult<usize> {
    let point = rt
        .db
        .load_campaign_point(org_id, point_id)
        .await?
        .ok_or_else(|| TaskError::NotFound(format!("campaign point {point_id}")))?;
    let assets = assets_with_point(rt, org_id, point_id).await?;
    let Some((campaign, _)) = assets.point_by_id(point_id) else {
        return Err(TaskError::NotFound(format!("campaign of point {point_id}")));
    };
    let group_id = campaign.group_id;

    let mut tx = rt.db.begin().await?;
    tx.update_point_status(point_id, PointStatus::Scheduling).await?;
    tx.commit().await?;

    let started = std::time::Instant::now();
    let now = Utc::now();
    let member_ids = rt.db.load_group_contact_ids(org_id, group_id).await?;
    let mut fires = Vec::new();
    for chunk in member_ids.chunks(SCHEDULE_LOAD_BATCH) {
        for contact in rt.db.load_contacts(org_id, chunk).await? {
            let view = flow_contact(&assets, &contact, &[]);
            if let Some(fire_on) = fire_time(assets.org(), &point, &view, now) {
                fires.push(ContactFire::new_campaign(
                    org_id,
                    contact.id,
                    point_id,
                    point.fire_version,
                    fire_on,
                ));
            }
        }
    }

    let mut tx = rt.db.begin().await?;
    tx.delete_point_fires(point_id).await?;
    if !fires.is_empty() {
        tx.insert_fires(&fires).await?;
    }
    tx.update_point_status(point_id, PointStatus::Ready).await?;
    tx.commit().await?;
    rt.assets.invalidate(org_id);

    info!(
        %point_id,
        members = member_ids.len(),
        fires = fires.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "campaign point scheduled"
    );
    Ok(fires.len())
}

/// Queue triggers for every due campaign fire and delete the fires. Fires
/// whose stored point is gone or has moved to another version are just
/// deleted. Returns the number of fires queued.
pub async fn fire_due(rt: &Runtime, now: DateTime<Utc>) -> TaskResult<usize> {
    let due = rt
        .db
        .load_due_fires(&[FireType::Campaign], now, FIRE_SCAN_LIMIT)
        .await?;
    if due.is_empty() {
        return Ok(0);
    }

    let mut batches: BTreeMap<(OrgID, PointID, i32), Vec<&ContactFire>> = BTreeMap::new();
    let mut dropped: Vec<FireID> = Vec::new();
    for fire in &due {
        match fire.campaign_point() {
            Some((point_id, version)) => batches
                .entry((fire.org_id, point_id, version))
                .or_default()
                .push(fire),
            None => {
                warn!(fire_id = %fire.id, scope = %fire.scope, "campaign fire with bad scope");
                dropped.push(fire.id);
            }
        }
    }

    let mut queued = 0;
    for ((org_id, point_id, version), fires) in batches {
        let current = rt
            .db
            .load_campaign_point(org_id, point_id)
            .await?
            .map(|p| p.fire_version);
        if current != Some(version) {
            debug!(%point_id, version, ?current, fires = fires.len(), "dropping stale campaign fires");
            dropped.extend(fires.iter().map(|f| f.id));
            continue;
        }

        for chunk in fires.chunks(TRIGGER_BATCH_SIZE) {
            let task = OrgTask::BulkCampaignTrigger(BulkCampaignTrigger {
                point_id,
                fire_version: version,
                contact_ids: chunk.iter().map(|f| f.contact_id).collect(),
            });
            queues::queue_org_task(rt.kv.as_ref(), BATCH, org_id, &task, Priority::Default)
                .await?;

            // a batch's fires go once the batch is queued
            let ids: Vec<FireID> = chunk.iter().map(|f| f.id).collect();
            let mut tx = rt.db.begin().await?;
            tx.delete_fires(&ids).await?;
            tx.commit().await?;
            queued += ids.len();
        }
    }

    if !dropped.is_empty() {
        let mut tx = rt.db.begin().await?;
        tx.delete_fires(&dropped).await?;
        tx.commit().await?;
    }
    Ok(queued)
}

/// What running a fired batch did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerOutcome {
    pub started: Vec<ContactID>,
    pub bypassed: Vec<ContactID>,
    pub calls: usize,
    pub broadcast: Option<BroadcastID>,
}

/// Run a point's action for a batch of fired contacts. A point that's gone,
/// or has moved on to another version, does nothing.
pub async fn bulk_trigger(
    rt: &Runtime,
    org_id: OrgID,
    task: &BulkCampaignTrigger,
) -> TaskResult<TriggerOutcome> {
    let mut outcome = TriggerOutcome::default();
    let Some(point) = rt.db.load_campaign_point(org_id, task.point_id).await? else {
        debug!(point_id = %task.point_id, "campaign point gone, ignoring trigger");
        return Ok(outcome);
    };
    if point.fire_version != task.fire_version {
        debug!(
            point_id = %point.id,
            task_version = task.fire_version,
            point_version = point.fire_version,
            "stale campaign trigger, ignoring"
        );
        return Ok(outcome);
    }
    let assets = assets_with_point(rt, org_id, point.id).await?;
    let Some((campaign, _)) = assets.point_by_id(point.id) else {
        return Ok(outcome);
    };

    match &point.action {
        PointAction::Flow { flow_id } => {
            let Some(flow) = assets.flow_by_id(*flow_id).filter(|f| f.is_active) else {
                warn!(point_id = %point.id, %flow_id, "campaign flow gone, ignoring trigger");
                return Ok(outcome);
            };
            let flow_ref = FlowRef::from(flow);
            let campaign_uuid = campaign.uuid;
            let point_uuid = point.uuid;
            let build_trigger = move |_: &FlowContact| Trigger::Campaign {
                flow: flow_ref.clone(),
                campaign: campaign_uuid,
                point: point_uuid,
            };

            if flow.flow_type == FlowType::Voice {
                let mut contact_ids = task.contact_ids.clone();
                if point.start_mode == StartMode::Skip {
                    let contacts = rt.db.load_contacts(org_id, &contact_ids).await?;
                    outcome.bypassed = contacts
                        .iter()
                        .filter(|c| c.is_waiting())
                        .map(|c| c.id)
                        .collect();
                    contact_ids.retain(|id| !outcome.bypassed.contains(id));
                }
                let calls =
                    crate::ivr::request_calls(rt, &assets, &contact_ids, flow, build_trigger)
                        .await?;
                outcome.calls = calls.len();
                outcome.started = calls.iter().map(|c| c.contact_id).collect();
            } else {
                let result = runner::start_with_lock(
                    rt,
                    &assets,
                    &task.contact_ids,
                    build_trigger,
                    point.start_mode,
                    START_LOCK_WAIT,
                )
                .await?;
                if !result.skipped.is_empty() {
                    warn!(point_id = %point.id, skipped = result.skipped.len(), "requeueing locked contacts");
                    let retry = OrgTask::BulkCampaignTrigger(BulkCampaignTrigger {
                        point_id: point.id,
                        fire_version: point.fire_version,
                        contact_ids: result.skipped.clone(),
                    });
                    queues::queue_org_task(rt.kv.as_ref(), BATCH, org_id, &retry, Priority::Default)
                        .await?;
                }
                outcome.started = result.sessions.iter().map(|(id, _)| *id).collect();
                outcome.bypassed = result.bypassed;
            }
        }
        PointAction::Broadcast {
            translations,
            base_language,
        } => {
            let broadcast = Broadcast {
                id: BroadcastID(0),
                uuid: BroadcastUUID::new(),
                org_id,
                translations: translations.clone(),
                base_language: base_language.clone(),
                optin_id: None,
                contact_ids: task.contact_ids.clone(),
                group_ids: vec![],
                urns: vec![],
                query: None,
                exclusions: Exclusions::default(),
                created_by_id: None,
                created_on: Utc::now(),
            };
            let mut tx = rt.db.begin().await?;
            let broadcast_id = tx.insert_broadcast(&broadcast).await?;
            tx.commit().await?;
            queues::queue_org_task(
                rt.kv.as_ref(),
                BATCH,
                org_id,
                &OrgTask::SendBroadcast(SendBroadcast { broadcast_id }),
                Priority::Default,
            )
            .await?;
            outcome.broadcast = Some(broadcast_id);
            outcome.started = task.contact_ids.clone();
        }
    }

    record_recent_fires(rt, point.id, &outcome.started).await;
    debug!(
        point_id = %point.id,
        started = outcome.started.len(),
        bypassed = outcome.bypassed.len(),
        "campaign trigger complete"
    );
    Ok(outcome)
}

async fn record_recent_fires(rt: &Runtime, point_id: PointID, contact_ids: &[ContactID]) {
    let key = recent_fires_key(point_id);
    let score = Utc::now().timestamp_nanos_opt().unwrap_or_default() as f64;
    for contact_id in contact_ids {
        let member = crate::stats::recent_contact_member(*contact_id, None);
        if let Err(err) = rt
            .kv
            .zset_add_capped(&key, &member, score, RECENT_FIRES_CAP, RECENT_FIRES_TTL)
            .await
        {
            warn!(%point_id, error = %err, "failed to record recent campaign fire");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use mailroom_kv_backend::KvBackend;
    use mailroom_models::{BroadcastTranslation, FieldValue};

    use super::*;
    use crate::queues::decode;
    use crate::test_support::{self, ANN, BOB, CAT, DOCTORS, JOINED_POINT, ORG, REMINDER_POINT};

    fn set_joined(fx: &test_support::Fixture, contact_id: ContactID, at: DateTime<Utc>) {
        fx.mem.seed(|store| {
            let contact = store.contacts.get_mut(&contact_id).unwrap();
            contact.fields.insert(
                "joined".to_string(),
                FieldValue {
                    text: at.to_rfc3339(),
                    number: None,
                    datetime: Some(at),
                },
            );
        });
    }

    fn add_to_doctors(fx: &test_support::Fixture, contact_id: ContactID) {
        fx.mem.seed(|store| {
            let contact = store.contacts.get_mut(&contact_id).unwrap();
            if !contact.group_ids.contains(&DOCTORS) {
                contact.group_ids.push(DOCTORS);
            }
        });
    }

    fn bump_version(fx: &test_support::Fixture, point_id: PointID) -> i32 {
        let version = fx.mem.seed(|store| {
            let point = store.campaign_point_mut(point_id).unwrap();
            point.fire_version += 1;
            point.fire_version
        });
        fx.rt.assets.flush();
        version
    }

    async fn point(fx: &test_support::Fixture, point_id: PointID) -> CampaignPoint {
        fx.rt.db.load_campaign_point(ORG, point_id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_fire_time_uses_contact_timezone() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let joined = Utc::now() + ChronoDuration::days(3);
        set_joined(&fx, CAT, joined);
        let contact = fx.mem.contact(CAT).unwrap();
        let mut view = flow_contact(&assets, &contact, &[]);
        let point = point(&fx, JOINED_POINT).await;

        let utc = fire_time(assets.org(), &point, &view, Utc::now()).unwrap();
        assert!(utc > joined);

        view.timezone = Some("Asia/Kolkata".to_string());
        let kolkata = fire_time(assets.org(), &point, &view, Utc::now()).unwrap();
        assert_eq!(
            point.schedule_for(parse_timezone("Asia/Kolkata").unwrap(), Utc::now(), joined),
            Some(kolkata)
        );

        view.fields.remove("joined");
        assert_eq!(fire_time(assets.org(), &point, &view, Utc::now()), None);
    }

    #[tokio::test]
    async fn test_schedule_point_replaces_fires() {
        let fx = test_support::fixture().await;
        set_joined(&fx, ANN, Utc::now() + ChronoDuration::days(2));
        add_to_doctors(&fx, CAT);
        fx.rt.assets.flush();

        let created = schedule_point(&fx.rt, ORG, JOINED_POINT).await.unwrap();
        assert_eq!(created, Some(2));
        assert_eq!(point(&fx, JOINED_POINT).await.status, PointStatus::Ready);

        // a new version replaces the old fires rather than adding to them
        let version = bump_version(&fx, JOINED_POINT);
        schedule_point(&fx.rt, ORG, JOINED_POINT).await.unwrap();
        let fires: Vec<_> = fx
            .mem
            .fires()
            .into_iter()
            .filter_map(|f| f.campaign_point())
            .filter(|(p, _)| *p == JOINED_POINT)
            .collect();
        assert_eq!(fires, vec![(JOINED_POINT, version), (JOINED_POINT, version)]);
    }

    #[tokio::test]
    async fn test_schedule_point_added_after_assets_cached() {
        let fx = test_support::fixture().await;
        set_joined(&fx, ANN, Utc::now() + ChronoDuration::days(2));
        fx.rt.org_assets(ORG).await.unwrap();

        let added = PointID(20000);
        fx.mem.seed(|store| {
            let joined = store.campaign_point_mut(JOINED_POINT).unwrap().clone();
            let campaign = store
                .org_rows(ORG)
                .campaigns
                .iter_mut()
                .find(|c| c.points.iter().any(|p| p.id == JOINED_POINT))
                .unwrap();
            campaign.points.push(CampaignPoint {
                id: added,
                uuid: mailroom_models::PointUUID::new(),
                ..joined
            });
        });

        let created = schedule_point(&fx.rt, ORG, added).await.unwrap().unwrap();
        assert!(created >= 1);
        assert!(fx.rt.org_assets(ORG).await.unwrap().point_by_id(added).is_some());
    }

    #[tokio::test]
    async fn test_schedule_point_skips_when_locked() {
        let fx = test_support::fixture().await;
        fx.rt
            .kv
            .set_nx(&schedule_lock_key(JOINED_POINT), "other", SCHEDULE_LOCK_TTL)
            .await
            .unwrap();
        assert_eq!(schedule_point(&fx.rt, ORG, JOINED_POINT).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_due_fires_are_queued_in_batches() {
        let fx = test_support::fixture().await;
        let version = point(&fx, JOINED_POINT).await.fire_version;
        let past = Utc::now() - ChronoDuration::minutes(1);
        let mut fires: Vec<ContactFire> = [ANN, BOB]
            .into_iter()
            .map(|id| ContactFire::new_campaign(ORG, id, JOINED_POINT, version, past))
            .collect();
        // a fire from before the point was last edited
        fires.push(ContactFire::new_campaign(ORG, CAT, JOINED_POINT, version - 1, past));
        let mut tx = fx.rt.db.begin().await.unwrap();
        tx.insert_fires(&fires).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(fire_due(&fx.rt, Utc::now()).await.unwrap(), 2);
        assert!(fx.mem.fires().iter().all(|f| f.fire_type != FireType::Campaign));

        let (_, raw) = fx.rt.kv.queue_pop(BATCH).await.unwrap().unwrap();
        match decode::<OrgTask>(&raw).unwrap().task {
            OrgTask::BulkCampaignTrigger(task) => {
                assert_eq!(task.point_id, JOINED_POINT);
                assert_eq!(task.fire_version, version);
                assert_eq!(task.contact_ids, vec![ANN, BOB]);
            }
            other => panic!("unexpected task {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_due_fires_checked_against_stored_version() {
        let fx = test_support::fixture().await;
        let cached = fx.rt.org_assets(ORG).await.unwrap();
        let version = fx.mem.seed(|store| {
            let point = store.campaign_point_mut(JOINED_POINT).unwrap();
            point.fire_version += 1;
            point.fire_version
        });
        assert_ne!(
            cached.point_by_id(JOINED_POINT).map(|(_, p)| p.fire_version),
            Some(version)
        );

        let past = Utc::now() - ChronoDuration::minutes(1);
        let fires = vec![
            ContactFire::new_campaign(ORG, ANN, JOINED_POINT, version, past),
            ContactFire::new_campaign(ORG, BOB, JOINED_POINT, version - 1, past),
        ];
        let mut tx = fx.rt.db.begin().await.unwrap();
        tx.insert_fires(&fires).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(fire_due(&fx.rt, Utc::now()).await.unwrap(), 1);
        assert!(fx.mem.fires().iter().all(|f| f.fire_type != FireType::Campaign));
        let (_, raw) = fx.rt.kv.queue_pop(BATCH).await.unwrap().unwrap();
        match decode::<OrgTask>(&raw).unwrap().task {
            OrgTask::BulkCampaignTrigger(task) => {
                assert_eq!(task.fire_version, version);
                assert_eq!(task.contact_ids, vec![ANN]);
            }
            other => panic!("unexpected task {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_skip_mode_leaves_waiting_contacts_alone() {
        let fx = test_support::fixture().await;
        fx.start_favorites(ANN).await;
        let ann_session = fx.mem.contact(ANN).unwrap().current_session_uuid;
        let version = point(&fx, JOINED_POINT).await.fire_version;

        let outcome = bulk_trigger(
            &fx.rt,
            ORG,
            &BulkCampaignTrigger {
                point_id: JOINED_POINT,
                fire_version: version,
                contact_ids: vec![ANN, BOB, CAT],
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.bypassed, vec![ANN]);
        assert_eq!(outcome.started, vec![BOB, CAT]);
        assert_eq!(fx.mem.contact(ANN).unwrap().current_session_uuid, ann_session);
        assert!(fx.mem.contact(BOB).unwrap().current_session_uuid.is_some());

        let recent = fx.rt.kv.zset_members(&recent_fires_key(JOINED_POINT)).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().any(|(m, _)| m.ends_with(&format!("|{BOB}|"))));
    }

    #[tokio::test]
    async fn test_stale_trigger_starts_nothing() {
        let fx = test_support::fixture().await;
        let old = point(&fx, JOINED_POINT).await.fire_version;
        bump_version(&fx, JOINED_POINT);

        let outcome = bulk_trigger(
            &fx.rt,
            ORG,
            &BulkCampaignTrigger {
                point_id: JOINED_POINT,
                fire_version: old,
                contact_ids: vec![BOB],
            },
        )
        .await
        .unwrap();
        assert_eq!(outcome, TriggerOutcome::default());
        assert!(fx.mem.contact(BOB).unwrap().current_session_uuid.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_point_queues_a_broadcast() {
        let fx = test_support::fixture().await;
        let point = point(&fx, REMINDER_POINT).await;
        assert!(matches!(point.action, PointAction::Broadcast { .. }));

        let outcome = bulk_trigger(
            &fx.rt,
            ORG,
            &BulkCampaignTrigger {
                point_id: REMINDER_POINT,
                fire_version: point.fire_version,
                contact_ids: vec![ANN],
            },
        )
        .await
        .unwrap();

        let broadcast_id = outcome.broadcast.unwrap();
        let broadcast = fx.mem.snapshot().broadcasts[&broadcast_id].clone();
        assert_eq!(broadcast.contact_ids, vec![ANN]);
        assert!(broadcast.translations.values().any(|t: &BroadcastTranslation| !t.text.is_empty()));

        let (_, raw) = fx.rt.kv.queue_pop(BATCH).await.unwrap().unwrap();
        assert!(matches!(
            decode::<OrgTask>(&raw).unwrap().task,
            OrgTask::SendBroadcast(SendBroadcast { broadcast_id: id }) if id == broadcast_id
        ));
    }
}
