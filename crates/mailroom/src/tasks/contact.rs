//! Tasks run against a single locked contact.
//!
//! [`handle_contact_event`] is the entry point: it takes the contact's lock,
//! pops one task off the contact's list and performs it. Anything still
//! queued afterwards gets a fresh marker so another worker picks it up. A
//! failed task goes back on the front of the list and its marker is only
//! queued once the retry delay has passed.

use std::time::{Duration, Instant};

use chrono::Utc;
use mailroom_core_backend::MsgStatusUpdate;
use mailroom_flows::{
    ChannelRef, Event, EventKind, FlowRef, Modifier, MsgIn, OptInEvent, OptInRef, Resume, Trigger,
};
use mailroom_models::{
    ChannelEventType, Contact, ContactID, ContactStatus, FlowType, OrgID,
    SessionStatus, SessionUUID, SprintUUID,
};
use tracing::{debug, error, info, warn};

use super::{
    ContactTask, EventReceived, MsgDeleted, MsgEvent, MsgReceived, SessionExpired, TaskResult,
    TicketClosed, WaitExpired, WaitTimeout,
};
use crate::assets::OrgAssets;
use crate::locker::{self, TASK_LOCK_WAIT};
use crate::queues::{self, MAX_TASK_ERRORS, contact_queue_key};
use crate::runner;
use crate::runtime::Runtime;
use crate::scene::{IncomingMsg, Scene, SceneError, Via};
use crate::triggers::{self, EXTRA_REFERRER_ID};

/// Lock the contact and perform the next task on its list.
pub async fn handle_contact_event(
    rt: &Runtime,
    org_id: OrgID,
    contact_id: ContactID,
) -> TaskResult<()> {
    let Some(lock) = locker::lock_contact(rt, contact_id, TASK_LOCK_WAIT).await? else {
        debug!(%org_id, %contact_id, "contact locked, requeueing marker");
        queues::queue_contact_marker(rt.kv.as_ref(), org_id, contact_id).await?;
        return Ok(());
    };

    let result = perform_next(rt, org_id, contact_id).await;

    let key = contact_queue_key(org_id, contact_id);
    let remaining = rt.kv.list_len(&key).await;
    lock.release().await;

    if remaining? > 0 {
        if let Ok(Some(delay)) = result {
            debug!(%org_id, %contact_id, delay_ms = delay.as_millis() as u64, "delaying contact task retry");
            tokio::time::sleep(delay).await;
        }
        queues::queue_contact_marker(rt.kv.as_ref(), org_id, contact_id).await?;
    }
    result.map(|_| ())
}

/// Pop and perform the contact's next task. Returns the retry delay when
/// the task failed and was put back.
async fn perform_next(
    rt: &Runtime,
    org_id: OrgID,
    contact_id: ContactID,
) -> TaskResult<Option<Duration>> {
    let Some(raw) = rt.kv.list_pop(&contact_queue_key(org_id, contact_id)).await? else {
        debug!(%org_id, %contact_id, "no contact tasks queued");
        return Ok(None);
    };

    let assets = match rt.org_assets(org_id).await {
        Ok(assets) => assets,
        Err(err) if err.is_not_found() => {
            warn!(%org_id, %contact_id, "org not found, dropping contact task");
            return Ok(None);
        }
        Err(err) => {
            rt.kv
                .list_push(&contact_queue_key(org_id, contact_id), &raw, true)
                .await?;
            return Err(err.into());
        }
    };

    let queued = match queues::decode::<ContactTask>(&raw) {
        Ok(queued) => queued,
        Err(err) => {
            error!(%org_id, %contact_id, error = %err, "undecodable contact task, dropping");
            return Ok(None);
        }
    };

    let Some(contact) = rt
        .db
        .load_contacts(org_id, &[contact_id])
        .await?
        .into_iter()
        .next()
    else {
        debug!(%org_id, %contact_id, "contact no longer exists, dropping task");
        return Ok(None);
    };

    let task_type = queued.task.type_name();
    let retry = queued.task.clone();
    let started = Instant::now();
    let result = queued.task.perform(rt, &assets, contact).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(()) => {
            info!(%org_id, %contact_id, task_type, elapsed_ms, "contact task complete");
        }
        Err(err) if err.is_not_found() => {
            debug!(%org_id, %contact_id, task_type, error = %err, "contact task target missing, dropping");
        }
        Err(err) => {
            let error_count = queued.error_count + 1;
            if error_count < MAX_TASK_ERRORS {
                warn!(%org_id, %contact_id, task_type, error_count, error = %err, "contact task failed, retrying");
                let raw = queues::encode(&retry, error_count)?;
                rt.kv
                    .list_push(&contact_queue_key(org_id, contact_id), &raw, true)
                    .await?;
                return Ok(Some(queues::retry_delay(error_count)));
            }
            error!(%org_id, %contact_id, task_type, error_count, error = %err, "contact task failed too many times, dropping");
        }
    }
    Ok(None)
}

async fn load_scene(rt: &Runtime, assets: &OrgAssets, contact: Contact) -> TaskResult<Scene> {
    let tickets = rt
        .db
        .load_open_tickets(assets.org_id(), &[contact.id])
        .await?;
    Ok(Scene::for_contact(assets, contact, tickets))
}

/// The contact's current session, if it is waiting for something other
/// than a voice call.
async fn waiting_messaging_session(
    rt: &Runtime,
    contact: &Contact,
) -> TaskResult<Option<mailroom_models::Session>> {
    let Some(uuid) = contact.current_session_uuid else {
        return Ok(None);
    };
    Ok(rt
        .db
        .load_session(contact.org_id, uuid)
        .await?
        .filter(|s| s.status == SessionStatus::Waiting && s.session_type != FlowType::Voice))
}

fn ignores_triggers(assets: &OrgAssets, session: Option<&mailroom_models::Session>) -> bool {
    session
        .and_then(|s| s.current_flow_uuid)
        .and_then(|uuid| assets.flow_by_uuid(uuid))
        .is_some_and(|flow| flow.ignore_triggers)
}

pub async fn msg_received(
    rt: &Runtime,
    assets: &OrgAssets,
    contact: Contact,
    task: MsgReceived,
) -> TaskResult<()> {
    let channel = assets.channel_by_id(task.channel_id);
    let msg = MsgIn {
        uuid: task.msg_uuid,
        urn: Some(task.urn.clone()),
        channel: channel.map(|c| ChannelRef {
            uuid: c.uuid,
            name: c.name.clone(),
        }),
        text: task.text.clone(),
        attachments: task.attachments.clone(),
        external_id: task.msg_external_id.clone(),
    };

    let mut scene = load_scene(rt, assets, contact).await?.with_incoming(IncomingMsg {
        id: task.msg_id,
        uuid: task.msg_uuid,
        channel_id: Some(task.channel_id),
    });

    // blocked contacts only get their message archived
    if scene.db_contact().status == ContactStatus::Blocked {
        scene.add_event(assets, Event::new(EventKind::MsgReceived { msg }), None)?;
        scene.commit(rt, assets).await?;
        return Ok(());
    }

    if scene.db_contact().status == ContactStatus::Stopped {
        scene.apply_modifier(
            rt,
            assets,
            &Modifier::Status {
                status: ContactStatus::Active,
            },
            None,
            Via::Api,
        )?;
    }
    scene.add_event(
        assets,
        Event::new(EventKind::ContactLastSeenChanged {
            last_seen_on: Utc::now(),
        }),
        None,
    )?;

    let waiting = waiting_messaging_session(rt, scene.db_contact()).await?;
    let matched = triggers::find_msg_trigger(
        assets,
        Some(task.channel_id),
        scene.db_contact(),
        &task.text,
        waiting.is_none(),
    );

    if let Some(matched) = matched
        && !ignores_triggers(assets, waiting.as_ref())
        && let Some(flow) = assets.flow_by_id(matched.trigger.flow_id)
    {
        let trigger = Trigger::Msg {
            flow: FlowRef::from(flow),
            msg: msg.clone(),
            keyword: matched.keyword.map(str::to_string),
        };
        debug!(contact_id = %scene.contact_id(), flow = %flow.uuid, "message matched trigger");
        match scene.start_session(rt, assets, trigger, true).await {
            Ok(()) => {}
            Err(SceneError::Engine(err)) => {
                warn!(contact_id = %scene.contact_id(), error = %err, "engine failed to start triggered session");
                scene.add_event(assets, Event::new(EventKind::MsgReceived { msg }), None)?;
            }
            Err(err) => return Err(err.into()),
        }
        scene.commit(rt, assets).await?;
        return Ok(());
    }

    if let Some(row) = waiting {
        runner::resume_session(rt, assets, &mut scene, &row, Resume::Msg { msg }).await?;
        return Ok(());
    }

    scene.add_event(assets, Event::new(EventKind::MsgReceived { msg }), None)?;
    scene.commit(rt, assets).await?;
    Ok(())
}

pub async fn msg_event(rt: &Runtime, task: MsgEvent) -> TaskResult<()> {
    let mut tx = rt.db.begin().await?;
    tx.update_msg_statuses(&[MsgStatusUpdate {
        msg_id: task.msg_id,
        status: task.status,
        external_id: task.external_id,
        failed_reason: task.failed_reason,
        at: Utc::now(),
    }])
    .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn event_received(
    rt: &Runtime,
    assets: &OrgAssets,
    contact: Contact,
    task: EventReceived,
) -> TaskResult<()> {
    if contact.status == ContactStatus::Blocked {
        debug!(contact_id = %contact.id, event_type = %task.event_type, "ignoring event for blocked contact");
        return Ok(());
    }
    let mut scene = load_scene(rt, assets, contact).await?;

    if task.event_type == ChannelEventType::DeleteContact {
        scene.interrupt_contact(rt, assets).await?;
        scene.commit(rt, assets).await?;
        return Ok(());
    }

    scene.add_event(
        assets,
        Event::new(EventKind::ContactLastSeenChanged {
            last_seen_on: task.created_on,
        }),
        None,
    )?;

    let flow_trigger = match task.event_type {
        ChannelEventType::StopContact => {
            scene.apply_modifier(
                rt,
                assets,
                &Modifier::Status {
                    status: ContactStatus::Stopped,
                },
                None,
                Via::Api,
            )?;
            scene.interrupt_contact(rt, assets).await?;
            None
        }
        ChannelEventType::IncomingCall => None,
        ChannelEventType::OptIn | ChannelEventType::OptOut => {
            optin_trigger(assets, scene.db_contact(), &task)
        }
        _ => channel_trigger(assets, scene.db_contact(), &task),
    };

    if let Some(trigger) = flow_trigger {
        let waiting = waiting_messaging_session(rt, scene.db_contact()).await?;
        if ignores_triggers(assets, waiting.as_ref()) {
            debug!(contact_id = %scene.contact_id(), "waiting flow ignores triggers");
        } else {
            match scene.start_session(rt, assets, trigger, true).await {
                Ok(()) => {}
                Err(SceneError::Engine(err)) => {
                    warn!(contact_id = %scene.contact_id(), error = %err, "engine failed to start event session");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    scene.commit(rt, assets).await?;
    Ok(())
}

fn optin_trigger(assets: &OrgAssets, contact: &Contact, task: &EventReceived) -> Option<Trigger> {
    let optin = task
        .optin_id
        .and_then(|id| assets.optins().iter().find(|o| o.id == id))?;
    let matched =
        triggers::find_channel_trigger(assets, task.event_type, task.channel_id, contact, None)?;
    let flow = assets.flow_by_id(matched.trigger.flow_id)?;
    Some(Trigger::OptIn {
        flow: FlowRef::from(flow),
        optin: OptInRef {
            uuid: optin.uuid,
            name: optin.name.clone(),
        },
        event: if task.event_type == ChannelEventType::OptIn {
            OptInEvent::Started
        } else {
            OptInEvent::Stopped
        },
    })
}

fn channel_trigger(assets: &OrgAssets, contact: &Contact, task: &EventReceived) -> Option<Trigger> {
    let channel = assets.channel_by_id(task.channel_id)?;
    let referrer_id = task.extra.get(EXTRA_REFERRER_ID).map(String::as_str);
    let matched = triggers::find_channel_trigger(
        assets,
        task.event_type,
        task.channel_id,
        contact,
        referrer_id,
    )?;
    let flow = assets.flow_by_id(matched.trigger.flow_id)?;
    Some(Trigger::Channel {
        flow: FlowRef::from(flow),
        event: task.event_type,
        channel: ChannelRef {
            uuid: channel.uuid,
            name: channel.name.clone(),
        },
        extra: task.extra.clone(),
    })
}

pub async fn msg_deleted(
    rt: &Runtime,
    assets: &OrgAssets,
    contact: Contact,
    task: MsgDeleted,
) -> TaskResult<()> {
    let mut scene = load_scene(rt, assets, contact).await?;
    scene.add_event(
        assets,
        Event::new(EventKind::MsgDeleted {
            msg_uuid: task.msg_uuid,
            by_contact: true,
        }),
        None,
    )?;
    scene.commit(rt, assets).await?;
    Ok(())
}

pub async fn ticket_closed(
    rt: &Runtime,
    assets: &OrgAssets,
    contact: Contact,
    task: TicketClosed,
) -> TaskResult<()> {
    let Some(ticket) = rt
        .db
        .load_tickets(assets.org_id(), &[task.ticket_id])
        .await?
        .into_iter()
        .next()
    else {
        debug!(ticket_id = %task.ticket_id, "ticket gone, nothing to trigger");
        return Ok(());
    };
    let Some(flow) = triggers::find_ticket_closed_trigger(assets, &contact)
        .and_then(|t| assets.flow_by_id(t.flow_id))
    else {
        return Ok(());
    };

    let trigger = Trigger::Ticket {
        flow: FlowRef::from(flow),
        ticket_uuid: ticket.uuid,
    };
    let mut scene = load_scene(rt, assets, contact).await?;
    match scene.start_session(rt, assets, trigger, false).await {
        Ok(()) => {}
        Err(SceneError::Engine(err)) => {
            warn!(contact_id = %scene.contact_id(), error = %err, "engine failed to start ticket session");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    }
    scene.commit(rt, assets).await?;
    Ok(())
}

/// The session a timer fired for, if it is still the contact's waiting
/// session and, when a sprint is given, still on that sprint.
async fn timed_session(
    rt: &Runtime,
    contact: &Contact,
    session_uuid: SessionUUID,
    sprint_uuid: Option<SprintUUID>,
) -> TaskResult<Option<mailroom_models::Session>> {
    if contact.current_session_uuid != Some(session_uuid) {
        debug!(contact_id = %contact.id, %session_uuid, "timer for a session the contact has left");
        return Ok(None);
    }
    let Some(row) = rt.db.load_session(contact.org_id, session_uuid).await? else {
        return Ok(None);
    };
    if row.status != SessionStatus::Waiting {
        debug!(%session_uuid, status = %row.status, "timer for a session no longer waiting");
        return Ok(None);
    }
    if let Some(sprint_uuid) = sprint_uuid
        && row.last_sprint_uuid != Some(sprint_uuid)
    {
        debug!(%session_uuid, %sprint_uuid, "timer for an old sprint");
        return Ok(None);
    }
    Ok(Some(row))
}

pub async fn wait_expired(
    rt: &Runtime,
    assets: &OrgAssets,
    contact: Contact,
    task: WaitExpired,
) -> TaskResult<()> {
    let Some(row) = timed_session(rt, &contact, task.session_uuid, Some(task.sprint_uuid)).await?
    else {
        return Ok(());
    };
    let mut scene = load_scene(rt, assets, contact).await?;

    if row.session_type == FlowType::Voice {
        // the call is hung up before the session is ended
        if let Some(call_id) = row.call_id
            && let Some(call) = rt.db.load_call(assets.org_id(), call_id).await?
            && let Err(err) = crate::ivr::hangup_call(rt, assets, &call).await
        {
            warn!(%call_id, error = %err, "failed to hang up expired call");
        }
        scene
            .interrupt_waiting(rt, assets, SessionStatus::Expired)
            .await?;
        scene.commit(rt, assets).await?;
        return Ok(());
    }

    runner::resume_session(rt, assets, &mut scene, &row, Resume::WaitExpiration {}).await?;
    Ok(())
}

pub async fn wait_timeout(
    rt: &Runtime,
    assets: &OrgAssets,
    contact: Contact,
    task: WaitTimeout,
) -> TaskResult<()> {
    let Some(row) = timed_session(rt, &contact, task.session_uuid, Some(task.sprint_uuid)).await?
    else {
        return Ok(());
    };
    let mut scene = load_scene(rt, assets, contact).await?;
    runner::resume_session(rt, assets, &mut scene, &row, Resume::WaitTimeout {}).await?;
    Ok(())
}

pub async fn session_expired(
    rt: &Runtime,
    assets: &OrgAssets,
    contact: Contact,
    task: SessionExpired,
) -> TaskResult<()> {
    let Some(row) = timed_session(rt, &contact, task.session_uuid, None).await? else {
        return Ok(());
    };
    let mut scene = load_scene(rt, assets, contact).await?;
    runner::resume_session(rt, assets, &mut scene, &row, Resume::SessionExpiration {}).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mailroom_kv_backend::KvBackend;
    use mailroom_models::{MsgDirection, MsgStatus};

    use super::*;
    use crate::queues::{REALTIME, queue_contact_task};
    use crate::test_support::{self, ANN, BOB, FAVORITES, ORG};

    async fn queue(fx: &test_support::Fixture, contact_id: ContactID, task: ContactTask) {
        queue_contact_task(fx.rt.kv.as_ref(), ORG, contact_id, &task, false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_keyword_starts_flow() {
        let fx = test_support::fixture().await;
        let task = fx.incoming(ANN, "red please").await;
        let msg_id = task.msg_id;
        queue(&fx, ANN, ContactTask::MsgReceived(task)).await;

        handle_contact_event(&fx.rt, ORG, ANN).await.unwrap();

        let ann = fx.mem.contact(ANN).unwrap();
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        assert_eq!(ann.current_flow_id, Some(FAVORITES));
        assert!(ann.last_seen_on.is_some());
        let session = fx.mem.session(ann.current_session_uuid.unwrap()).unwrap();
        assert_eq!(session.status, SessionStatus::Waiting);

        let msgs = fx.mem.msgs();
        let incoming = msgs.iter().find(|m| m.id == msg_id).unwrap();
        assert_eq!(incoming.status, MsgStatus::Handled);
        assert!(
            msgs.iter()
                .any(|m| m.direction == MsgDirection::Out && m.contact_id == ANN)
        );
    }

    #[tokio::test]
    async fn test_unmatched_message_is_only_handled() {
        let fx = test_support::fixture().await;
        let task = fx.incoming(BOB, "hello there").await;
        let msg_id = task.msg_id;
        queue(&fx, BOB, ContactTask::MsgReceived(task)).await;

        handle_contact_event(&fx.rt, ORG, BOB).await.unwrap();

        let bob = fx.mem.contact(BOB).unwrap();
        assert!(bob.current_session_uuid.is_none());
        let incoming = fx.mem.msgs().into_iter().find(|m| m.id == msg_id).unwrap();
        assert_eq!(incoming.status, MsgStatus::Handled);
    }

    #[tokio::test]
    async fn test_message_resumes_flow_that_ignores_triggers() {
        let fx = test_support::fixture().await;
        fx.mem.seed(|store| {
            for flow in store.org_rows(ORG).flows.iter_mut() {
                if flow.id == FAVORITES {
                    flow.ignore_triggers = true;
                }
            }
        });
        fx.rt.assets.invalidate(ORG);
        let session_uuid = fx.start_favorites(BOB).await;
        let before = fx.mem.session(session_uuid).unwrap().last_sprint_uuid;

        let task = fx.incoming(BOB, "red").await;
        queue(&fx, BOB, ContactTask::MsgReceived(task)).await;
        handle_contact_event(&fx.rt, ORG, BOB).await.unwrap();

        let bob = fx.mem.contact(BOB).unwrap();
        assert_eq!(bob.current_session_uuid, Some(session_uuid));
        assert_ne!(fx.mem.session(session_uuid).unwrap().last_sprint_uuid, before);
    }

    #[tokio::test]
    async fn test_locked_contact_requeues_marker() {
        let fx = test_support::fixture().await;
        let _held = locker::lock_contact(&fx.rt, ANN, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let task = fx.incoming(ANN, "red").await;
        queue(&fx, ANN, ContactTask::MsgReceived(task)).await;
        let markers = fx.rt.kv.queue_size(REALTIME).await.unwrap();

        tokio::time::pause();
        handle_contact_event(&fx.rt, ORG, ANN).await.unwrap();

        assert_eq!(fx.rt.kv.queue_size(REALTIME).await.unwrap(), markers + 1);
        assert_eq!(
            fx.rt.kv.list_len(&contact_queue_key(ORG, ANN)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_failing_task_is_retried_then_dropped() {
        let fx = test_support::fixture().await;
        fx.mem.fail_op("update_msg_statuses");
        let task = ContactTask::MsgEvent(MsgEvent {
            msg_id: mailroom_models::MsgID(999),
            status: MsgStatus::Delivered,
            external_id: None,
            failed_reason: None,
        });
        queue(&fx, ANN, task).await;
        let key = contact_queue_key(ORG, ANN);

        tokio::time::pause();
        for expected in 1..MAX_TASK_ERRORS {
            let markers = fx.rt.kv.queue_size(REALTIME).await.unwrap();
            let started = tokio::time::Instant::now();
            handle_contact_event(&fx.rt, ORG, ANN).await.unwrap();

            assert!(started.elapsed() >= queues::retry_delay(expected));
            assert_eq!(fx.rt.kv.queue_size(REALTIME).await.unwrap(), markers + 1);
            let raw = fx.rt.kv.list_range(&key).await.unwrap();
            assert_eq!(raw.len(), 1);
            let queued = queues::decode::<ContactTask>(&raw[0]).unwrap();
            assert_eq!(queued.error_count, expected);
        }
        handle_contact_event(&fx.rt, ORG, ANN).await.unwrap();
        assert_eq!(fx.rt.kv.list_len(&key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retried_task_stays_ahead_of_later_tasks() {
        let fx = test_support::fixture().await;
        fx.mem.fail_op("update_msg_statuses");
        let failing = ContactTask::MsgEvent(MsgEvent {
            msg_id: mailroom_models::MsgID(999),
            status: MsgStatus::Delivered,
            external_id: None,
            failed_reason: None,
        });
        queue(&fx, ANN, failing).await;
        let later = fx.incoming(ANN, "hello").await;
        queue(&fx, ANN, ContactTask::MsgReceived(later)).await;

        tokio::time::pause();
        handle_contact_event(&fx.rt, ORG, ANN).await.unwrap();

        let raw = fx.rt.kv.list_range(&contact_queue_key(ORG, ANN)).await.unwrap();
        assert_eq!(raw.len(), 2);
        assert!(raw[0].contains("msg_event"));
        assert!(raw[1].contains("msg_received"));
    }

    #[tokio::test]
    async fn test_tasks_for_inactive_org_are_dropped() {
        let fx = test_support::fixture().await;
        let task = fx.incoming(ANN, "red").await;
        queue(&fx, ANN, ContactTask::MsgReceived(task)).await;
        let task = fx.incoming(ANN, "blue").await;
        queue(&fx, ANN, ContactTask::MsgReceived(task)).await;
        fx.mem.seed(|store| {
            if let Some(org) = store.orgs.get_mut(&ORG) {
                org.is_active = false;
            }
        });
        fx.rt.assets.invalidate(ORG);
        let key = contact_queue_key(ORG, ANN);

        while fx.rt.kv.queue_pop(REALTIME).await.unwrap().is_some() {}
        handle_contact_event(&fx.rt, ORG, ANN).await.unwrap();
        assert_eq!(fx.rt.kv.list_len(&key).await.unwrap(), 1);
        assert_eq!(fx.rt.kv.queue_size(REALTIME).await.unwrap(), 1);

        let (owner, _) = fx.rt.kv.queue_pop(REALTIME).await.unwrap().unwrap();
        fx.rt.kv.queue_done(REALTIME, &owner).await.unwrap();
        handle_contact_event(&fx.rt, ORG, ANN).await.unwrap();
        assert_eq!(fx.rt.kv.list_len(&key).await.unwrap(), 0);
        assert_eq!(fx.rt.kv.queue_size(REALTIME).await.unwrap(), 0);
        assert!(fx.mem.contact(ANN).unwrap().current_session_uuid.is_none());
    }

    #[tokio::test]
    async fn test_msg_event_updates_status() {
        let fx = test_support::fixture().await;
        let msg_id = fx.outgoing(ANN, "hi").await;
        queue(
            &fx,
            ANN,
            ContactTask::MsgEvent(MsgEvent {
                msg_id,
                status: MsgStatus::Delivered,
                external_id: Some("SM123".to_string()),
                failed_reason: None,
            }),
        )
        .await;

        handle_contact_event(&fx.rt, ORG, ANN).await.unwrap();

        let msg = fx.mem.msgs().into_iter().find(|m| m.id == msg_id).unwrap();
        assert_eq!(msg.status, MsgStatus::Delivered);
        assert_eq!(msg.external_id.as_deref(), Some("SM123"));
    }

    #[tokio::test]
    async fn test_stale_wait_timeout_is_ignored() {
        let fx = test_support::fixture().await;
        let session_uuid = fx.start_favorites(ANN).await;
        let sprint = fx.mem.session(session_uuid).unwrap().last_sprint_uuid;

        queue(
            &fx,
            ANN,
            ContactTask::WaitTimeout(WaitTimeout {
                session_uuid,
                sprint_uuid: SprintUUID::new(),
            }),
        )
        .await;
        handle_contact_event(&fx.rt, ORG, ANN).await.unwrap();
        assert_eq!(fx.mem.session(session_uuid).unwrap().last_sprint_uuid, sprint);

        queue(
            &fx,
            ANN,
            ContactTask::WaitTimeout(WaitTimeout {
                session_uuid,
                sprint_uuid: sprint.unwrap(),
            }),
        )
        .await;
        handle_contact_event(&fx.rt, ORG, ANN).await.unwrap();
        assert_ne!(fx.mem.session(session_uuid).unwrap().last_sprint_uuid, sprint);
    }

    #[tokio::test]
    async fn test_session_expiry_ends_session() {
        let fx = test_support::fixture().await;
        let session_uuid = fx.start_favorites(ANN).await;
        queue(&fx, ANN, ContactTask::SessionExpired(SessionExpired { session_uuid })).await;

        handle_contact_event(&fx.rt, ORG, ANN).await.unwrap();

        let session = fx.mem.session(session_uuid).unwrap();
        assert_ne!(session.status, SessionStatus::Waiting);
        assert!(fx.mem.contact(ANN).unwrap().current_session_uuid.is_none());
    }

    #[tokio::test]
    async fn test_stop_contact_event_stops_and_interrupts() {
        let fx = test_support::fixture().await;
        let session_uuid = fx.start_favorites(ANN).await;
        queue(
            &fx,
            ANN,
            ContactTask::EventReceived(EventReceived {
                event_type: ChannelEventType::StopContact,
                channel_id: test_support::TWILIO,
                urn_id: None,
                urn: None,
                optin_id: None,
                extra: Default::default(),
                new_contact: false,
                created_on: Utc::now(),
            }),
        )
        .await;

        handle_contact_event(&fx.rt, ORG, ANN).await.unwrap();

        let ann = fx.mem.contact(ANN).unwrap();
        assert_eq!(ann.status, ContactStatus::Stopped);
        assert!(ann.current_session_uuid.is_none());
        assert_eq!(
            fx.mem.session(session_uuid).unwrap().status,
            SessionStatus::Interrupted
        );
    }

    #[tokio::test]
    async fn test_ticket_closed_without_trigger_is_noop() {
        let fx = test_support::fixture().await;
        let ticket = fx.open_ticket(ANN).await;
        queue(&fx, ANN, ContactTask::TicketClosed(TicketClosed { ticket_id: ticket.id })).await;

        handle_contact_event(&fx.rt, ORG, ANN).await.unwrap();

        assert!(fx.mem.contact(ANN).unwrap().current_session_uuid.is_none());
    }
}
