//! Session, run and call hooks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mailroom_core_backend::{ContactSessionUpdate, CoreTx};
use mailroom_flows::Session;
use mailroom_models::{
    Call, ContactFire, ContactID, FireType, FlowRun, OrgID, RunStatus, SessionStatus, SessionUUID,
    SprintUUID,
};
use tracing::warn;

use super::{HookResult, PreCommitHook, SceneBatch};
use crate::assets::OrgAssets;
use crate::runtime::Runtime;
use crate::scene::Scene;

fn clear_pointers(contact_ids: &[ContactID]) -> Vec<ContactSessionUpdate> {
    contact_ids
        .iter()
        .map(|id| ContactSessionUpdate {
            contact_id: *id,
            session_uuid: None,
            flow_id: None,
        })
        .collect()
}

/// Ends every waiting session of the contacts and clears their pointers.
pub struct InterruptContacts;

#[async_trait::async_trait]
impl PreCommitHook for InterruptContacts {
    type Payload = ();

    const NAME: &'static str = "interrupt_contacts";
    const ORDER: i32 = 0;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, ()>,
    ) -> HookResult<()> {
        let now = Utc::now();
        let contact_ids: Vec<ContactID> = scenes.iter().map(|(s, _)| s.contact_id()).collect();

        let ended = tx
            .end_waiting_sessions(&contact_ids, SessionStatus::Interrupted, now)
            .await?;
        if !ended.is_empty() {
            tx.end_session_runs(&ended, RunStatus::Interrupted, now).await?;
        }
        tx.delete_session_fires(&contact_ids).await?;
        tx.update_contact_sessions(&clear_pointers(&contact_ids)).await?;
        Ok(())
    }
}

/// Ends specific sessions with a given status.
pub struct InterruptSessions;

#[async_trait::async_trait]
impl PreCommitHook for InterruptSessions {
    type Payload = (SessionUUID, SessionStatus);

    const NAME: &'static str = "interrupt_sessions";
    const ORDER: i32 = 0;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, Self::Payload>,
    ) -> HookResult<()> {
        let now = Utc::now();
        let mut by_status: BTreeMap<&'static str, (SessionStatus, Vec<SessionUUID>)> =
            BTreeMap::new();
        let mut contact_ids = Vec::new();
        for (scene, payloads) in scenes {
            contact_ids.push(scene.contact_id());
            for (uuid, status) in payloads.iter() {
                by_status
                    .entry(status.as_str())
                    .or_insert_with(|| (*status, Vec::new()))
                    .1
                    .push(*uuid);
            }
        }

        for (status, uuids) in by_status.values() {
            tx.end_sessions(uuids, *status, now).await?;
            tx.end_session_runs(uuids, RunStatus::from(*status), now).await?;
        }
        tx.delete_session_fires(&contact_ids).await?;
        tx.update_contact_sessions(&clear_pointers(&contact_ids)).await?;
        Ok(())
    }
}

/// Ends the open runs of sessions the scene didn't produce itself.
pub struct InterruptRuns;

#[async_trait::async_trait]
impl PreCommitHook for InterruptRuns {
    type Payload = (SessionUUID, RunStatus);

    const NAME: &'static str = "interrupt_runs";
    const ORDER: i32 = 0;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, Self::Payload>,
    ) -> HookResult<()> {
        let now = Utc::now();
        let mut by_status: BTreeMap<&'static str, (RunStatus, Vec<SessionUUID>)> = BTreeMap::new();
        for (_, payloads) in scenes {
            for (uuid, status) in payloads.iter() {
                let entry = by_status
                    .entry(status.as_str())
                    .or_insert_with(|| (*status, Vec::new()));
                if !entry.1.contains(uuid) {
                    entry.1.push(*uuid);
                }
            }
        }
        for (status, uuids) in by_status.values() {
            tx.end_session_runs(uuids, *status, now).await?;
        }
        Ok(())
    }
}

/// Writes the scene's engine session, its runs, and for interactive
/// sessions the wait and expiry timers.
pub struct CommitSessions;

#[async_trait::async_trait]
impl PreCommitHook for CommitSessions {
    type Payload = ();

    const NAME: &'static str = "commit_sessions";
    const ORDER: i32 = 1;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        assets: &OrgAssets,
        scenes: &SceneBatch<'_, ()>,
    ) -> HookResult<()> {
        let now = Utc::now();
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut runs = Vec::new();
        let mut timer_contacts = Vec::new();
        let mut fires = Vec::new();

        for (scene, _) in scenes {
            let (Some(session), Some(sprint)) = (scene.session(), scene.sprint()) else {
                continue;
            };
            let row = session_row(scene, session, sprint.uuid, now)?;
            if scene.session_is_new() {
                inserts.push(row);
            } else {
                updates.push(row);
            }
            runs.extend(run_rows(scene, session, assets)?);

            if session.session_type.is_interactive() {
                timer_contacts.push(scene.contact_id());
                fires.extend(session_timers(
                    scene.org_id(),
                    scene.contact_id(),
                    session,
                    sprint.uuid,
                ));
            }
        }

        if !inserts.is_empty() {
            tx.insert_sessions(&inserts).await?;
        }
        if !updates.is_empty() {
            tx.update_sessions(&updates).await?;
        }
        if !runs.is_empty() {
            tx.upsert_runs(&runs).await?;
        }
        if !timer_contacts.is_empty() {
            tx.delete_session_fires(&timer_contacts).await?;
        }
        if !fires.is_empty() {
            tx.insert_fires(&fires).await?;
        }
        Ok(())
    }
}

fn session_row(
    scene: &Scene,
    session: &Session,
    sprint_uuid: SprintUUID,
    now: DateTime<Utc>,
) -> HookResult<mailroom_models::Session> {
    Ok(mailroom_models::Session {
        uuid: session.uuid,
        org_id: scene.org_id(),
        contact_id: scene.contact_id(),
        session_type: session.session_type,
        status: session.status,
        current_flow_uuid: session.current_flow(),
        last_sprint_uuid: Some(sprint_uuid),
        output: serde_json::to_value(session)?,
        call_id: scene.call().map(|c| c.id),
        created_on: scene.session_created_on().unwrap_or(now),
        ended_on: session.status.is_terminal().then_some(now),
    })
}

fn run_rows(scene: &Scene, session: &Session, assets: &OrgAssets) -> HookResult<Vec<FlowRun>> {
    let mut rows = Vec::with_capacity(session.runs.len());
    for run in &session.runs {
        let Some(flow) = assets.flow_by_uuid(run.flow.uuid) else {
            warn!(flow_uuid = %run.flow.uuid, run_uuid = %run.uuid, "run flow no longer active, not persisting run");
            continue;
        };
        rows.push(FlowRun {
            uuid: run.uuid,
            org_id: scene.org_id(),
            contact_id: scene.contact_id(),
            flow_id: flow.id,
            session_uuid: session.uuid,
            status: run.status,
            responded: run.responded,
            results: serde_json::to_value(&run.results)?,
            path_nodes: run.path.iter().map(|step| step.node_uuid).collect(),
            created_on: run.created_on,
            modified_on: run.modified_on,
            exited_on: run.exited_on,
        });
    }
    Ok(rows)
}

/// Wait expiry, wait timeout and session expiry fires of a waiting session.
fn session_timers(
    org_id: OrgID,
    contact_id: ContactID,
    session: &Session,
    sprint_uuid: SprintUUID,
) -> Vec<ContactFire> {
    if session.status != SessionStatus::Waiting {
        return Vec::new();
    }
    let wait = session.wait.as_ref();
    [
        (FireType::WaitExpires, wait.and_then(|w| w.expires_on)),
        (FireType::WaitTimeout, wait.and_then(|w| w.timeout_on)),
        (FireType::SessionExpires, session.expires_on),
    ]
    .into_iter()
    .filter_map(|(fire_type, fire_on)| {
        fire_on.map(|fire_on| {
            ContactFire::new_session_timer(
                org_id,
                contact_id,
                fire_type,
                session.uuid,
                sprint_uuid,
                fire_on,
            )
        })
    })
    .collect()
}

/// Points the contact at its new waiting session, or clears the pointers
/// when the session it was waiting in has ended.
pub struct UpdateContactSession;

#[async_trait::async_trait]
impl PreCommitHook for UpdateContactSession {
    type Payload = ContactSessionUpdate;

    const NAME: &'static str = "update_contact_session";
    const ORDER: i32 = 1;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, Self::Payload>,
    ) -> HookResult<()> {
        let updates: Vec<ContactSessionUpdate> = scenes
            .iter()
            .filter_map(|(_, payloads)| payloads.last().cloned())
            .collect();
        tx.update_contact_sessions(&updates).await?;
        Ok(())
    }
}

/// Persists call state changed by the sprint.
pub struct UpdateCallStatus;

#[async_trait::async_trait]
impl PreCommitHook for UpdateCallStatus {
    type Payload = Call;

    const NAME: &'static str = "update_call_status";
    const ORDER: i32 = 10;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, Call>,
    ) -> HookResult<()> {
        let calls: Vec<Call> = scenes
            .iter()
            .filter_map(|(_, payloads)| payloads.last().cloned())
            .collect();
        tx.update_calls(&calls).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use mailroom_models::{FireType, SessionStatus};

    use crate::test_support::{self, ANN, BOB, FAVORITES, ORG};

    #[tokio::test]
    async fn test_started_session_is_persisted_with_timers() {
        let fx = test_support::fixture().await;
        let session_uuid = fx.start_favorites(ANN).await;

        let contact = fx.mem.contact(ANN).unwrap();
        assert_eq!(contact.current_session_uuid, Some(session_uuid));
        assert_eq!(contact.current_flow_id, Some(FAVORITES));

        let row = fx.mem.session(session_uuid).unwrap();
        assert_eq!(row.status, SessionStatus::Waiting);
        assert_eq!(row.org_id, ORG);
        assert!(row.last_sprint_uuid.is_some());

        let mut types: Vec<FireType> = fx
            .mem
            .fires()
            .into_iter()
            .filter(|f| f.contact_id == ANN)
            .map(|f| f.fire_type)
            .collect();
        types.sort_by_key(|t| t.letter());
        assert_eq!(
            types,
            vec![FireType::WaitExpires, FireType::SessionExpires, FireType::WaitTimeout]
        );
    }

    #[tokio::test]
    async fn test_interrupting_contact_ends_session_and_timers() {
        let fx = test_support::fixture().await;
        let session_uuid = fx.start_favorites(BOB).await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();

        let mut scene = fx.scene(&assets, BOB);
        scene.interrupt_contact(&fx.rt, &assets).await.unwrap();
        scene.commit(&fx.rt, &assets).await.unwrap();

        let contact = fx.mem.contact(BOB).unwrap();
        assert_eq!(contact.current_session_uuid, None);
        assert_eq!(contact.current_flow_id, None);
        assert_eq!(
            fx.mem.session(session_uuid).unwrap().status,
            SessionStatus::Interrupted
        );
        assert!(fx.mem.fires().iter().all(|f| f.contact_id != BOB));
        assert!(
            fx.mem
                .snapshot()
                .runs
                .values()
                .filter(|r| r.session_uuid == session_uuid)
                .all(|r| r.status.is_ended())
        );
    }

    #[tokio::test]
    async fn test_ending_a_session_twice_is_a_noop() {
        let fx = test_support::fixture().await;
        let session_uuid = fx.start_favorites(ANN).await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();

        let mut scene = fx.scene(&assets, ANN);
        scene
            .interrupt_waiting(&fx.rt, &assets, SessionStatus::Expired)
            .await
            .unwrap();
        scene.commit(&fx.rt, &assets).await.unwrap();
        let ended_on = fx.mem.session(session_uuid).unwrap().ended_on;

        // the contact no longer points at it, so a second pass has nothing to end
        let mut scene = fx.scene(&assets, ANN);
        scene
            .interrupt_waiting(&fx.rt, &assets, SessionStatus::Interrupted)
            .await
            .unwrap();
        scene.commit(&fx.rt, &assets).await.unwrap();

        let row = fx.mem.session(session_uuid).unwrap();
        assert_eq!(row.status, SessionStatus::Expired);
        assert_eq!(row.ended_on, ended_on);
    }
}
