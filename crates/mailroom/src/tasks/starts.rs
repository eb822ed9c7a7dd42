//! Flow starts: resolve the contacts of a start, then start them in batches.

use mailroom_flows::{FlowRef, Trigger, UserRef};
use mailroom_kv_backend::Priority;
use mailroom_models::{FlowStart, FlowType, OrgID, StartID, StartMode, StartStatus};
use tracing::{debug, info, warn};

use super::{OrgTask, StartFlowBatch, TaskError, TaskResult};
use crate::assets::OrgAssets;
use crate::locker::START_LOCK_WAIT;
use crate::queues::{self, THROTTLED};
use crate::recipients::{self, Recipients};
use crate::runner;
use crate::runtime::Runtime;

/// Contacts per `start_flow_batch` task.
pub const START_BATCH_SIZE: usize = 100;

async fn load_start(rt: &Runtime, org_id: OrgID, start_id: StartID) -> TaskResult<FlowStart> {
    rt.db
        .load_flow_start(org_id, start_id)
        .await?
        .ok_or_else(|| TaskError::NotFound(format!("flow start {start_id}")))
}

async fn set_status(
    rt: &Runtime,
    start_id: StartID,
    status: StartStatus,
    contact_count: Option<i64>,
) -> TaskResult<()> {
    let mut tx = rt.db.begin().await?;
    tx.update_flow_start(start_id, status, contact_count).await?;
    tx.commit().await?;
    Ok(())
}

/// Resolve a start's contacts and queue them in batches on the throttled queue.
pub async fn start_flow(rt: &Runtime, org_id: OrgID, start_id: StartID) -> TaskResult<()> {
    let assets = rt.org_assets(org_id).await?;
    let start = load_start(rt, org_id, start_id).await?;
    if !matches!(start.status, StartStatus::Pending | StartStatus::Queued) {
        debug!(%start_id, status = start.status.as_str(), "flow start already handled");
        return Ok(());
    }

    if !assets.flow_by_id(start.flow_id).is_some_and(|f| f.is_active) {
        warn!(%start_id, flow_id = %start.flow_id, "flow start for missing flow, failing it");
        return set_status(rt, start_id, StartStatus::Failed, None).await;
    }

    let contact_ids = match recipients::resolve(
        rt,
        &assets,
        &Recipients::for_start(&start),
        Some(start.flow_id),
    )
    .await
    {
        Ok(ids) => ids,
        Err(err) if recipients::is_bad_query(&err) => {
            warn!(%start_id, error = %err, "flow start has an invalid query, failing it");
            return set_status(rt, start_id, StartStatus::Failed, None).await;
        }
        Err(err) => return Err(err),
    };

    let count = contact_ids.len();
    if count == 0 {
        info!(%start_id, "flow start has no contacts");
        return set_status(rt, start_id, StartStatus::Completed, Some(0)).await;
    }
    set_status(rt, start_id, StartStatus::Started, Some(count as i64)).await?;

    let batches: Vec<_> = contact_ids.chunks(START_BATCH_SIZE).collect();
    let last = batches.len() - 1;
    for (i, batch) in batches.into_iter().enumerate() {
        let task = OrgTask::StartFlowBatch(StartFlowBatch {
            start_id,
            contact_ids: batch.to_vec(),
            is_last: i == last,
        });
        queues::queue_org_task(rt.kv.as_ref(), THROTTLED, org_id, &task, Priority::Default)
            .await?;
    }
    info!(%start_id, contacts = count, batches = last + 1, "flow start queued");
    Ok(())
}

/// Start one batch of a flow start. Contacts that were locked go back on
/// the queue as a batch of their own.
pub async fn start_flow_batch(rt: &Runtime, org_id: OrgID, task: StartFlowBatch) -> TaskResult<()> {
    let assets = rt.org_assets(org_id).await?;
    let start = load_start(rt, org_id, task.start_id).await?;
    if matches!(start.status, StartStatus::Interrupted | StartStatus::Failed) {
        debug!(start_id = %start.id, "flow start stopped, skipping batch");
        return Ok(());
    }
    let Some(flow) = assets.flow_by_id(start.flow_id).filter(|f| f.is_active) else {
        warn!(start_id = %start.id, "flow gone, skipping batch");
        return Ok(());
    };

    let build_trigger = trigger_builder(&assets, &start, FlowRef::from(flow));
    let skipped = if flow.flow_type == FlowType::Voice {
        let calls = crate::ivr::request_calls(rt, &assets, &task.contact_ids, flow, build_trigger)
            .await?;
        debug!(start_id = %start.id, calls = calls.len(), "calls requested");
        Vec::new()
    } else {
        let result = runner::start_with_lock(
            rt,
            &assets,
            &task.contact_ids,
            build_trigger,
            StartMode::Interrupt,
            START_LOCK_WAIT,
        )
        .await?;
        debug!(
            start_id = %start.id,
            started = result.sessions.len(),
            failed = result.failed.len(),
            "flow start batch complete"
        );
        result.skipped
    };

    if !skipped.is_empty() {
        warn!(start_id = %start.id, skipped = skipped.len(), "requeueing locked contacts");
        let retry = OrgTask::StartFlowBatch(StartFlowBatch {
            start_id: task.start_id,
            contact_ids: skipped,
            is_last: task.is_last,
        });
        queues::queue_org_task(rt.kv.as_ref(), THROTTLED, org_id, &retry, Priority::Default)
            .await?;
        return Ok(());
    }

    if task.is_last {
        set_status(rt, start.id, StartStatus::Completed, None).await?;
    }
    Ok(())
}

fn trigger_builder(
    assets: &OrgAssets,
    start: &FlowStart,
    flow: FlowRef,
) -> impl Fn(&mailroom_flows::FlowContact) -> Trigger + use<> {
    let user = start
        .created_by_id
        .and_then(|id| assets.user_by_id(id))
        .map(|u| UserRef {
            uuid: u.uuid,
            name: u.name.clone(),
        });
    let params = start.params.clone();
    move |_| Trigger::Manual {
        flow: flow.clone(),
        params: params.clone(),
        user: user.clone(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use mailroom_kv_backend::KvBackend;
    use mailroom_models::{Exclusions, StartType, StartUUID};

    use super::*;
    use crate::locker;
    use crate::queues::decode;
    use crate::test_support::{self, ADMIN, ANN, BOB, CAT, FAVORITES, ORG};

    fn flow_start(fx: &test_support::Fixture, id: i64, contact_ids: Vec<mailroom_models::ContactID>) -> StartID {
        let start_id = StartID(id);
        fx.mem.seed(|store| {
            store.flow_starts.insert(
                start_id,
                FlowStart {
                    id: start_id,
                    uuid: StartUUID::new(),
                    org_id: ORG,
                    flow_id: FAVORITES,
                    start_type: StartType::Manual,
                    status: StartStatus::Pending,
                    exclusions: Exclusions::default(),
                    contact_ids,
                    group_ids: vec![],
                    urns: vec![],
                    query: None,
                    created_by_id: Some(ADMIN),
                    params: Some(serde_json::json!({"source": "test"})),
                    parent_summary: None,
                    session_history: None,
                    contact_count: 0,
                    created_on: Utc::now(),
                    modified_on: Utc::now(),
                },
            );
        });
        start_id
    }

    async fn pop_batch(fx: &test_support::Fixture) -> StartFlowBatch {
        let (_, raw) = fx.rt.kv.queue_pop(THROTTLED).await.unwrap().unwrap();
        match decode::<OrgTask>(&raw).unwrap().task {
            OrgTask::StartFlowBatch(batch) => batch,
            other => panic!("unexpected task {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_start_is_split_and_completed() {
        let fx = test_support::fixture().await;
        let start_id = flow_start(&fx, 1, vec![ANN, BOB, CAT]);

        start_flow(&fx.rt, ORG, start_id).await.unwrap();
        let start = fx.mem.snapshot().flow_starts[&start_id].clone();
        assert_eq!(start.status, StartStatus::Started);
        assert_eq!(start.contact_count, 3);

        let batch = pop_batch(&fx).await;
        assert_eq!(batch.contact_ids, vec![ANN, BOB, CAT]);
        assert!(batch.is_last);

        start_flow_batch(&fx.rt, ORG, batch).await.unwrap();
        assert_eq!(
            fx.mem.snapshot().flow_starts[&start_id].status,
            StartStatus::Completed
        );
        for id in [ANN, BOB, CAT] {
            assert!(fx.mem.contact(id).unwrap().current_session_uuid.is_some());
        }
    }

    #[tokio::test]
    async fn test_start_without_contacts_completes() {
        let fx = test_support::fixture().await;
        let start_id = flow_start(&fx, 2, vec![]);
        start_flow(&fx.rt, ORG, start_id).await.unwrap();
        assert_eq!(
            fx.mem.snapshot().flow_starts[&start_id].status,
            StartStatus::Completed
        );
        assert!(fx.rt.kv.queue_pop(THROTTLED).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handled_start_is_not_restarted() {
        let fx = test_support::fixture().await;
        let start_id = flow_start(&fx, 3, vec![ANN]);
        start_flow(&fx.rt, ORG, start_id).await.unwrap();
        pop_batch(&fx).await;

        start_flow(&fx.rt, ORG, start_id).await.unwrap();
        assert!(fx.rt.kv.queue_pop(THROTTLED).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_locked_contacts_are_requeued() {
        let fx = test_support::fixture().await;
        let start_id = flow_start(&fx, 4, vec![ANN, BOB]);
        start_flow(&fx.rt, ORG, start_id).await.unwrap();
        let batch = pop_batch(&fx).await;
        fx.rt.kv.queue_done(THROTTLED, &ORG.to_string()).await.unwrap();

        let _held = locker::lock_contact(&fx.rt, BOB, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        tokio::time::pause();
        start_flow_batch(&fx.rt, ORG, batch).await.unwrap();

        assert!(fx.mem.contact(ANN).unwrap().current_session_uuid.is_some());
        assert_eq!(
            fx.mem.snapshot().flow_starts[&start_id].status,
            StartStatus::Started
        );
        let retry = pop_batch(&fx).await;
        assert_eq!(retry.contact_ids, vec![BOB]);
        assert!(retry.is_last);
    }

    #[tokio::test]
    async fn test_missing_start_is_not_found() {
        let fx = test_support::fixture().await;
        let err = start_flow(&fx.rt, ORG, StartID(404)).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
