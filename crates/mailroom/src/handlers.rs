//! Event handlers.
//!
//! Each engine event type maps to exactly one handler. A handler reads the
//! event and the scene and attaches payloads to commit hooks; it never writes
//! anything itself.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use mailroom_core_backend::{ContactSessionUpdate, MsgDeletion, MsgHandled, MsgLabel, ResthookUnsubscribe};
use mailroom_flows::{Event, EventKind, MsgOut, WebhookStatus};
use mailroom_models::{
    AirtimeTransfer, Broadcast, BroadcastID, BroadcastUUID, CallStatus, ChannelID, ChannelRole,
    ContactStatus, FAILED_REASON_CONTACT_STATUS, FAILED_REASON_NO_DESTINATION, FlowID, HttpLog,
    HttpLogType, Msg, MsgDirection, MsgID, MsgStatus, MsgType, MsgVisibility, OptInID,
    SessionStatus, Ticket, TicketEvent, TicketEventType, TicketID, TicketStatus, TicketUUID,
    URN, URNID, UserID,
};
use tracing::debug;

use crate::assets::OrgAssets;
use crate::hooks::campaigns::{CampaignFireChange, UpdateCampaignFires};
use crate::hooks::contacts::{
    GroupChange, RecalculateSmartGroups, UpdateContactFields, UpdateContactGroups,
    UpdateContactLanguage, UpdateContactLastSeenOn, UpdateContactModifiedOn, UpdateContactName,
    UpdateContactStatus, UpdateContactURNs,
};
use crate::hooks::msgs::{
    AddMessageLabels, CreateBroadcasts, DeleteMessages, FlowWarning, IncrementWarnings,
    InsertAirtimeTransfers, InsertHttpLogs, InsertMessages, MarkMsgsHandled, OutgoingMsg,
    PendingBroadcast, SendMessages,
};
use crate::hooks::sessions::{
    CommitSessions, InterruptContacts, InterruptRuns, InterruptSessions, UpdateCallStatus,
    UpdateContactSession,
};
use crate::hooks::tickets::{InsertTickets, NewTicket, QueueTicketClosed, TicketChange, UpdateTickets, UpdateTicketActivity};
use crate::scene::{Scene, SceneError, SceneResult};
use crate::stats::{FlowStat, UpdateFlowStats};
use crate::webhooks::{MonitorWebhooks, UnsubscribeResthooks, WebhookCall, DEFAULT_HEALTHY_THRESHOLD};

pub type Handler = fn(&mut Scene, &OrgAssets, &Event, Option<UserID>) -> SceneResult<()>;

fn build_registry(handlers: Vec<(&'static str, Handler)>) -> HashMap<&'static str, Handler> {
    let mut registry = HashMap::with_capacity(handlers.len());
    for (event_type, handler) in handlers {
        if registry.insert(event_type, handler).is_some() {
            panic!("handler for {event_type} registered twice");
        }
    }
    registry
}

static HANDLERS: LazyLock<HashMap<&'static str, Handler>> = LazyLock::new(|| {
    build_registry(vec![
        ("msg_created", handle_msg_created),
        ("msg_received", handle_msg_received),
        ("msg_wait", noop),
        ("msg_deleted", handle_msg_deleted),
        ("ivr_created", handle_ivr_created),
        ("airtime_transferred", handle_airtime_transferred),
        ("contact_field_changed", handle_contact_field_changed),
        ("contact_groups_changed", handle_contact_groups_changed),
        ("contact_language_changed", handle_contact_language_changed),
        ("contact_last_seen_changed", handle_contact_last_seen_changed),
        ("contact_name_changed", handle_contact_name_changed),
        ("contact_status_changed", handle_contact_status_changed),
        ("contact_urns_changed", handle_contact_urns_changed),
        ("run_started", handle_run_started),
        ("run_ended", handle_run_ended),
        ("run_result_changed", handle_run_result_changed),
        ("sprint_ended", handle_sprint_ended),
        ("session_interrupted", handle_session_interrupted),
        ("contact_interrupted", handle_contact_interrupted),
        ("ticket_opened", handle_ticket_opened),
        ("ticket_closed", handle_ticket_changed),
        ("ticket_reopened", handle_ticket_changed),
        ("ticket_assignee_changed", handle_ticket_changed),
        ("ticket_topic_changed", handle_ticket_changed),
        ("ticket_note_added", handle_ticket_changed),
        ("webhook_called", handle_webhook_called),
        ("warning", handle_warning),
        ("broadcast_created", handle_broadcast_created),
        ("input_labels_added", handle_input_labels_added),
        ("optin_requested", handle_optin_requested),
        ("dial_wait", noop),
        ("dial_ended", noop),
        ("wait_timed_out", noop),
        ("error", noop),
        ("failure", noop),
        ("environment_refreshed", noop),
    ])
});

/// The handler registered for an event type.
pub fn handler_for(event_type: &str) -> Option<Handler> {
    HANDLERS.get(event_type).copied()
}

fn unexpected(event: &Event) -> SceneError {
    SceneError::Handler {
        event: event.type_name(),
        reason: "event kind doesn't match its registered handler".to_string(),
    }
}

fn noop(_: &mut Scene, _: &OrgAssets, _: &Event, _: Option<UserID>) -> SceneResult<()> {
    Ok(())
}

/// Flow the event was produced in, resolved to its id.
fn event_flow_id(scene: &Scene, assets: &OrgAssets, event: &Event) -> Option<FlowID> {
    scene
        .locate_event(event)
        .and_then(|(flow_uuid, _)| assets.flow_by_uuid(flow_uuid))
        .map(|flow| flow.id)
}

/// The contact's URN row matching an engine URN.
fn urn_row(scene: &Scene, urn: &URN) -> Option<URNID> {
    let identity = urn.identity();
    scene
        .db_contact()
        .urns
        .iter()
        .find(|u| u.identity() == identity)
        .map(|u| u.id)
}

struct OutgoingParts {
    msg_type: MsgType,
    channel_id: Option<ChannelID>,
    urn_id: Option<URNID>,
    status: MsgStatus,
    failed_reason: Option<String>,
    optin_id: Option<OptInID>,
}

fn outgoing_row(
    scene: &Scene,
    msg: &MsgOut,
    parts: OutgoingParts,
    flow_id: Option<FlowID>,
    user_id: Option<UserID>,
    created_on: DateTime<Utc>,
) -> Msg {
    Msg {
        id: MsgID(0),
        uuid: msg.uuid,
        org_id: scene.org_id(),
        channel_id: parts.channel_id,
        contact_id: scene.contact_id(),
        contact_urn_id: parts.urn_id,
        direction: MsgDirection::Out,
        status: parts.status,
        visibility: MsgVisibility::Visible,
        msg_type: parts.msg_type,
        text: msg.text.clone(),
        attachments: msg.attachments.clone(),
        quick_replies: msg.quick_replies.clone(),
        locale: msg.locale.clone(),
        flow_id,
        ticket_id: None,
        broadcast_id: None,
        optin_id: parts.optin_id,
        created_by_id: user_id,
        external_id: None,
        high_priority: scene.incoming().is_some(),
        error_count: 0,
        failed_reason: parts.failed_reason,
        created_on,
        modified_on: created_on,
        sent_on: None,
    }
}

/// Status of a message about to be queued, failing it when it can't go anywhere.
fn sendable(
    scene: &Scene,
    channel_id: Option<ChannelID>,
    urn_id: Option<URNID>,
    unsendable: Option<&str>,
) -> (MsgStatus, Option<String>) {
    if let Some(reason) = unsendable {
        return (MsgStatus::Failed, Some(reason.to_string()));
    }
    if scene.db_contact().status != ContactStatus::Active {
        return (MsgStatus::Failed, Some(FAILED_REASON_CONTACT_STATUS.to_string()));
    }
    if channel_id.is_none() || urn_id.is_none() {
        return (MsgStatus::Failed, Some(FAILED_REASON_NO_DESTINATION.to_string()));
    }
    (MsgStatus::Queued, None)
}

fn handle_msg_created(
    scene: &mut Scene,
    assets: &OrgAssets,
    event: &Event,
    user_id: Option<UserID>,
) -> SceneResult<()> {
    let EventKind::MsgCreated { msg } = &event.kind else {
        return Err(unexpected(event));
    };

    let contact_urn = msg.urn.as_ref().and_then(|urn| {
        let identity = urn.identity();
        scene
            .db_contact()
            .urns
            .iter()
            .find(|u| u.identity() == identity)
            .cloned()
    });
    let channel_id = match &msg.channel {
        Some(channel) => assets.channel_by_uuid(channel.uuid).map(|c| c.id),
        None => contact_urn
            .as_ref()
            .and_then(|urn| assets.channel_for_urn(urn, ChannelRole::Send))
            .map(|c| c.id),
    };
    let urn_id = contact_urn.as_ref().map(|u| u.id);
    let (status, failed_reason) =
        sendable(scene, channel_id, urn_id, msg.unsendable_reason.as_deref());

    let row = outgoing_row(
        scene,
        msg,
        OutgoingParts {
            msg_type: MsgType::Text,
            channel_id,
            urn_id,
            status,
            failed_reason,
            optin_id: None,
        },
        event_flow_id(scene, assets, event),
        user_id,
        event.created_on,
    );

    scene.attach_pre::<InsertMessages>(row.clone());
    if status == MsgStatus::Queued {
        scene.attach_post::<SendMessages>(OutgoingMsg {
            msg: row,
            urn: msg.urn.clone(),
        });
    }
    Ok(())
}

fn handle_ivr_created(
    scene: &mut Scene,
    assets: &OrgAssets,
    event: &Event,
    user_id: Option<UserID>,
) -> SceneResult<()> {
    let EventKind::IvrCreated { msg } = &event.kind else {
        return Err(unexpected(event));
    };
    let (channel_id, urn_id) = match scene.call() {
        Some(call) => (Some(call.channel_id), Some(call.urn_id)),
        None => (None, msg.urn.as_ref().and_then(|u| urn_row(scene, u))),
    };
    let row = outgoing_row(
        scene,
        msg,
        OutgoingParts {
            msg_type: MsgType::Voice,
            channel_id,
            urn_id,
            status: MsgStatus::Wired,
            failed_reason: None,
            optin_id: None,
        },
        event_flow_id(scene, assets, event),
        user_id,
        event.created_on,
    );
    scene.attach_pre::<InsertMessages>(row);
    Ok(())
}

fn handle_optin_requested(
    scene: &mut Scene,
    assets: &OrgAssets,
    event: &Event,
    user_id: Option<UserID>,
) -> SceneResult<()> {
    let EventKind::OptinRequested { optin, channel, urn } = &event.kind else {
        return Err(unexpected(event));
    };
    let msg = MsgOut {
        uuid: mailroom_models::MsgUUID::new(),
        urn: Some(urn.clone()),
        channel: Some(channel.clone()),
        text: String::new(),
        attachments: vec![],
        quick_replies: vec![],
        locale: None,
        unsendable_reason: None,
    };
    let channel_id = assets.channel_by_uuid(channel.uuid).map(|c| c.id);
    let urn_id = urn_row(scene, urn);
    let (status, failed_reason) = sendable(scene, channel_id, urn_id, None);
    let row = outgoing_row(
        scene,
        &msg,
        OutgoingParts {
            msg_type: MsgType::Optin,
            channel_id,
            urn_id,
            status,
            failed_reason,
            optin_id: assets.optin_by_uuid(optin.uuid).map(|o| o.id),
        },
        event_flow_id(scene, assets, event),
        user_id,
        event.created_on,
    );
    scene.attach_pre::<InsertMessages>(row.clone());
    if status == MsgStatus::Queued {
        scene.attach_post::<SendMessages>(OutgoingMsg {
            msg: row,
            urn: Some(urn.clone()),
        });
    }
    Ok(())
}

fn handle_msg_received(
    scene: &mut Scene,
    assets: &OrgAssets,
    event: &Event,
    _user_id: Option<UserID>,
) -> SceneResult<()> {
    let EventKind::MsgReceived { .. } = &event.kind else {
        return Err(unexpected(event));
    };
    let Some(incoming) = scene.incoming().cloned() else {
        debug!(contact_id = %scene.contact_id(), "msg_received without an incoming message, ignoring");
        return Ok(());
    };

    let flow_id = event_flow_id(scene, assets, event).or_else(|| {
        scene
            .session()
            .and_then(|s| s.current_flow())
            .and_then(|uuid| assets.flow_by_uuid(uuid))
            .map(|f| f.id)
    });
    let ticket_id = scene
        .tickets()
        .iter()
        .find(|t| t.status == TicketStatus::Open && t.id.0 != 0)
        .map(|t| t.id)
        .or_else(|| scene.db_contact().open_ticket_ids.first().copied());

    scene.attach_pre::<MarkMsgsHandled>(MsgHandled {
        msg_id: incoming.id,
        flow_id,
        ticket_id,
        archive: scene.db_contact().status == ContactStatus::Blocked,
    });
    if let Some(ticket_id) = ticket_id {
        scene.attach_pre::<UpdateTicketActivity>(ticket_id);
    }
    Ok(())
}

fn handle_msg_deleted(
    scene: &mut Scene,
    _assets: &OrgAssets,
    event: &Event,
    _user_id: Option<UserID>,
) -> SceneResult<()> {
    let EventKind::MsgDeleted {
        msg_uuid,
        by_contact,
    } = &event.kind
    else {
        return Err(unexpected(event));
    };
    scene.attach_pre::<DeleteMessages>(MsgDeletion {
        org_id: scene.org_id(),
        msg_uuid: *msg_uuid,
        by_contact: *by_contact,
    });
    Ok(())
}

fn handle_airtime_transferred(
    scene: &mut Scene,
    assets: &OrgAssets,
    event: &Event,
    _user_id: Option<UserID>,
) -> SceneResult<()> {
    let EventKind::AirtimeTransferred {
        external_id,
        sender,
        recipient,
        currency,
        desired_amount,
        actual_amount,
        http_logs,
    } = &event.kind
    else {
        return Err(unexpected(event));
    };
    let flow_id = event_flow_id(scene, assets, event);
    let transfer = AirtimeTransfer {
        org_id: scene.org_id(),
        contact_id: scene.contact_id(),
        external_id: external_id.clone(),
        status: if *actual_amount > 0.0 { "success" } else { "failed" }.to_string(),
        sender: sender.as_ref().map(ToString::to_string),
        recipient: recipient.to_string(),
        currency: currency.clone(),
        desired_amount: *desired_amount,
        actual_amount: *actual_amount,
        created_on: event.created_on,
    };
    let logs = http_logs
        .iter()
        .map(|trace| HttpLog {
            org_id: scene.org_id(),
            log_type: HttpLogType::AirtimeTransferred,
            flow_id,
            url: trace.url.clone(),
            status_code: i32::from(trace.status_code),
            request: trace.request.clone(),
            response: trace.response.clone(),
            is_error: !(200..300).contains(&trace.status_code),
            elapsed_ms: i64::try_from(trace.elapsed_ms).unwrap_or(i64::MAX),
            retries: i32::try_from(trace.retries).unwrap_or(i32::MAX),
            created_on: event.created_on,
        })
        .collect();
    scene.attach_pre::<InsertAirtimeTransfers>((transfer, logs));
    Ok(())
}

fn handle_contact_field_changed(
    scene: &mut Scene,
    _assets: &OrgAssets,
    event: &Event,
    _user_id: Option<UserID>,
) -> SceneResult<()> {
    let EventKind::ContactFieldChanged { field, value } = &event.kind else {
        return Err(unexpected(event));
    };
    scene.attach_pre::<UpdateContactFields>((field.key.clone(), value.clone()));
    scene.attach_pre::<RecalculateSmartGroups>(());
    scene.attach_pre::<UpdateCampaignFires>(CampaignFireChange::Field(field.key.clone()));
    scene.attach_pre::<UpdateContactModifiedOn>(());
    Ok(())
}

fn handle_contact_groups_changed(
    scene: &mut Scene,
    assets: &OrgAssets,
    event: &Event,
    _user_id: Option<UserID>,
) -> SceneResult<()> {
    let EventKind::ContactGroupsChanged {
        groups_added,
        groups_removed,
    } = &event.kind
    else {
        return Err(unexpected(event));
    };
    for group in groups_removed {
        if let Some(group) = assets.group_by_uuid(group.uuid) {
            scene.attach_pre::<UpdateContactGroups>(GroupChange::Remove(group.id));
            scene.attach_pre::<UpdateCampaignFires>(CampaignFireChange::GroupRemoved(group.id));
        }
    }
    for group in groups_added {
        match assets.group_by_uuid(group.uuid) {
            Some(group) if !group.is_smart() => {
                scene.attach_pre::<UpdateContactGroups>(GroupChange::Add(group.id));
                scene.attach_pre::<UpdateCampaignFires>(CampaignFireChange::GroupAdded(group.id));
            }
            Some(group) => {
                debug!(group_id = %group.id, "ignoring manual add to smart group");
            }
            None => {}
        }
    }
    scene.attach_pre::<UpdateContactModifiedOn>(());
    Ok(())
}

fn handle_contact_language_changed(
    scene: &mut Scene,
    _assets: &OrgAssets,
    event: &Event,
    _user_id: Option<UserID>,
) -> SceneResult<()> {
    let EventKind::ContactLanguageChanged { language } = &event.kind else {
        return Err(unexpected(event));
    };
    let language = Some(language.clone()).filter(|l| !l.is_empty());
    scene.attach_pre::<UpdateContactLanguage>(language);
    scene.attach_pre::<RecalculateSmartGroups>(());
    scene.attach_pre::<UpdateContactModifiedOn>(());
    Ok(())
}

fn handle_contact_last_seen_changed(
    scene: &mut Scene,
    _assets: &OrgAssets,
    event: &Event,
    _user_id: Option<UserID>,
) -> SceneResult<()> {
    let EventKind::ContactLastSeenChanged { last_seen_on } = &event.kind else {
        return Err(unexpected(event));
    };
    scene.attach_pre::<UpdateContactLastSeenOn>(*last_seen_on);
    scene.attach_pre::<UpdateCampaignFires>(CampaignFireChange::LastSeen);
    Ok(())
}

fn handle_contact_name_changed(
    scene: &mut Scene,
    _assets: &OrgAssets,
    event: &Event,
    _user_id: Option<UserID>,
) -> SceneResult<()> {
    let EventKind::ContactNameChanged { name } = &event.kind else {
        return Err(unexpected(event));
    };
    scene.attach_pre::<UpdateContactName>(Some(name.clone()).filter(|n| !n.is_empty()));
    scene.attach_pre::<RecalculateSmartGroups>(());
    scene.attach_pre::<UpdateContactModifiedOn>(());
    Ok(())
}

fn handle_contact_status_changed(
    scene: &mut Scene,
    _assets: &OrgAssets,
    event: &Event,
    _user_id: Option<UserID>,
) -> SceneResult<()> {
    let EventKind::ContactStatusChanged { status } = &event.kind else {
        return Err(unexpected(event));
    };
    scene.attach_pre::<UpdateContactStatus>(*status);
    scene.attach_pre::<RecalculateSmartGroups>(());
    scene.attach_pre::<UpdateContactModifiedOn>(());
    Ok(())
}

fn handle_contact_urns_changed(
    scene: &mut Scene,
    _assets: &OrgAssets,
    event: &Event,
    _user_id: Option<UserID>,
) -> SceneResult<()> {
    let EventKind::ContactUrnsChanged { urns } = &event.kind else {
        return Err(unexpected(event));
    };
    scene.attach_pre::<UpdateContactURNs>(urns.clone());
    scene.attach_pre::<RecalculateSmartGroups>(());
    scene.attach_pre::<UpdateContactModifiedOn>(());
    Ok(())
}

fn handle_run_started(
    scene: &mut Scene,
    _assets: &OrgAssets,
    _event: &Event,
    _user_id: Option<UserID>,
) -> SceneResult<()> {
    scene.attach_pre::<UpdateContactModifiedOn>(());
    Ok(())
}

/// Runs ended outside the scene's own session belong to the session the
/// contact was waiting in, and are ended in the store directly.
fn handle_run_ended(
    scene: &mut Scene,
    _assets: &OrgAssets,
    event: &Event,
    _user_id: Option<UserID>,
) -> SceneResult<()> {
    let EventKind::RunEnded {
        run_uuid, status, ..
    } = &event.kind
    else {
        return Err(unexpected(event));
    };
    let in_scene_session = scene.session().is_some_and(|s| s.run(*run_uuid).is_some());
    if in_scene_session || !status.is_ended() {
        return Ok(());
    }
    if let Some(session_uuid) = scene.db_contact().current_session_uuid {
        scene.attach_pre::<InterruptRuns>((session_uuid, *status));
    }
    Ok(())
}

fn handle_run_result_changed(
    scene: &mut Scene,
    _assets: &OrgAssets,
    event: &Event,
    _user_id: Option<UserID>,
) -> SceneResult<()> {
    let EventKind::RunResultChanged {
        name,
        category,
        previous_category,
        ..
    } = &event.kind
    else {
        return Err(unexpected(event));
    };
    if category == previous_category {
        return Ok(());
    }
    let flow_uuid = scene
        .locate_event(event)
        .map(|(flow, _)| flow)
        .or_else(|| scene.session().and_then(|s| s.current_run()).map(|r| r.flow.uuid));
    if let Some(flow_uuid) = flow_uuid {
        scene.attach_pre::<UpdateFlowStats>(FlowStat::Result {
            flow_uuid,
            key: mailroom_flows::basic::snakify(name),
            category: category.clone(),
            previous: previous_category.clone(),
        });
    }
    Ok(())
}

fn handle_sprint_ended(
    scene: &mut Scene,
    assets: &OrgAssets,
    _event: &Event,
    _user_id: Option<UserID>,
) -> SceneResult<()> {
    let Some(session) = scene.session() else {
        return Ok(());
    };
    let session_uuid = session.uuid;
    let status = session.status;
    let interactive = session.session_type.is_interactive();
    let waiting_flow = session
        .current_flow()
        .and_then(|uuid| assets.flow_by_uuid(uuid))
        .map(|f| f.id);
    let segments = scene.sprint().map(|s| s.segments.clone()).unwrap_or_default();

    scene.attach_pre::<CommitSessions>(());

    if interactive {
        if status == SessionStatus::Waiting {
            scene.attach_pre::<UpdateContactSession>(ContactSessionUpdate {
                contact_id: scene.contact_id(),
                session_uuid: Some(session_uuid),
                flow_id: waiting_flow,
            });
        } else if scene.db_contact().current_session_uuid == Some(session_uuid)
            || scene.is_interrupted()
        {
            scene.attach_pre::<UpdateContactSession>(ContactSessionUpdate {
                contact_id: scene.contact_id(),
                session_uuid: None,
                flow_id: None,
            });
        }
    }

    if let Some(call) = scene.call() {
        let mut call = call.clone();
        call.session_uuid = Some(session_uuid);
        if matches!(call.status, CallStatus::Pending | CallStatus::Wired) {
            call.mark_in_progress(Utc::now());
        }
        scene.attach_pre::<UpdateCallStatus>(call);
    }

    scene.attach_pre::<UpdateContactModifiedOn>(());
    if !segments.is_empty() {
        scene.attach_pre::<UpdateFlowStats>(FlowStat::Segments(segments));
    }
    Ok(())
}

fn handle_session_interrupted(
    scene: &mut Scene,
    _assets: &OrgAssets,
    event: &Event,
    _user_id: Option<UserID>,
) -> SceneResult<()> {
    let EventKind::SessionInterrupted { status } = &event.kind else {
        return Err(unexpected(event));
    };
    if let Some(session_uuid) = scene.db_contact().current_session_uuid {
        scene.attach_pre::<InterruptSessions>((session_uuid, *status));
    }
    scene.mark_interrupted();
    Ok(())
}

fn handle_contact_interrupted(
    scene: &mut Scene,
    _assets: &OrgAssets,
    _event: &Event,
    _user_id: Option<UserID>,
) -> SceneResult<()> {
    scene.attach_pre::<InterruptContacts>(());
    scene.mark_interrupted();
    Ok(())
}

fn handle_ticket_opened(
    scene: &mut Scene,
    assets: &OrgAssets,
    event: &Event,
    user_id: Option<UserID>,
) -> SceneResult<()> {
    let EventKind::TicketOpened {
        ticket_uuid,
        topic,
        assignee,
        note,
    } = &event.kind
    else {
        return Err(unexpected(event));
    };
    let topic_id = topic
        .as_ref()
        .and_then(|t| assets.topic_by_uuid(t.uuid))
        .or_else(|| assets.default_topic())
        .map(|t| t.id);
    let assignee_id = assignee
        .as_ref()
        .and_then(|u| assets.user_by_uuid(u.uuid))
        .map(|u| u.id);

    let now = event.created_on;
    let ticket = Ticket {
        id: TicketID(0),
        uuid: *ticket_uuid,
        org_id: scene.org_id(),
        contact_id: scene.contact_id(),
        topic_id,
        assignee_id,
        status: TicketStatus::Open,
        opened_in_flow_id: event_flow_id(scene, assets, event),
        opened_by_id: user_id,
        opened_on: now,
        closed_on: None,
        last_activity_on: now,
        modified_on: now,
    };
    scene.push_ticket(ticket.clone());
    scene.attach_pre::<InsertTickets>(NewTicket {
        ticket,
        note: note.clone(),
        event_uuid: event.uuid,
        created_by_id: user_id,
    });
    Ok(())
}

fn ticket_uuid_of(kind: &EventKind) -> Option<TicketUUID> {
    match kind {
        EventKind::TicketClosed { ticket_uuid }
        | EventKind::TicketReopened { ticket_uuid }
        | EventKind::TicketAssigneeChanged { ticket_uuid, .. }
        | EventKind::TicketTopicChanged { ticket_uuid, .. }
        | EventKind::TicketNoteAdded { ticket_uuid, .. } => Some(*ticket_uuid),
        _ => None,
    }
}

fn handle_ticket_changed(
    scene: &mut Scene,
    assets: &OrgAssets,
    event: &Event,
    user_id: Option<UserID>,
) -> SceneResult<()> {
    let ticket_uuid = ticket_uuid_of(&event.kind).ok_or_else(|| unexpected(event))?;
    let now = event.created_on;
    let org_id = scene.org_id();
    let contact_id = scene.contact_id();

    let Some(ticket) = scene.ticket_mut(ticket_uuid) else {
        return Err(SceneError::Handler {
            event: event.type_name(),
            reason: format!("ticket {ticket_uuid} isn't loaded in the scene"),
        });
    };
    if ticket.id.0 == 0 {
        // opened in this scene, so its insert already carries the final state
        return Ok(());
    }

    let mut ticket_event = TicketEvent {
        uuid: event.uuid,
        org_id,
        contact_id,
        ticket_id: ticket.id,
        event_type: TicketEventType::NoteAdded,
        note: None,
        topic_id: None,
        assignee_id: None,
        created_by_id: user_id,
        created_on: now,
    };
    let mut closed = false;
    match &event.kind {
        EventKind::TicketClosed { .. } => {
            ticket.status = TicketStatus::Closed;
            ticket.closed_on = Some(now);
            ticket_event.event_type = TicketEventType::Closed;
            closed = true;
        }
        EventKind::TicketReopened { .. } => {
            ticket.status = TicketStatus::Open;
            ticket.closed_on = None;
            ticket_event.event_type = TicketEventType::Reopened;
        }
        EventKind::TicketAssigneeChanged { assignee, .. } => {
            ticket.assignee_id = assignee
                .as_ref()
                .and_then(|u| assets.user_by_uuid(u.uuid))
                .map(|u| u.id);
            ticket_event.event_type = TicketEventType::Assigned;
            ticket_event.assignee_id = ticket.assignee_id;
        }
        EventKind::TicketTopicChanged { topic, .. } => {
            ticket.topic_id = assets.topic_by_uuid(topic.uuid).map(|t| t.id);
            ticket_event.event_type = TicketEventType::TopicChanged;
            ticket_event.topic_id = ticket.topic_id;
        }
        EventKind::TicketNoteAdded { note, .. } => {
            ticket_event.note = Some(note.clone());
        }
        _ => return Err(unexpected(event)),
    }
    ticket.modified_on = now;
    ticket.last_activity_on = now;

    let ticket = ticket.clone();
    let ticket_id = ticket.id;
    scene.attach_pre::<UpdateTickets>(TicketChange {
        ticket,
        event: ticket_event,
    });
    if closed {
        scene.attach_post::<QueueTicketClosed>(ticket_id);
    }
    Ok(())
}

fn handle_webhook_called(
    scene: &mut Scene,
    assets: &OrgAssets,
    event: &Event,
    _user_id: Option<UserID>,
) -> SceneResult<()> {
    let EventKind::WebhookCalled {
        url,
        status,
        status_code,
        elapsed_ms,
        retries,
        request,
        response,
        resthook,
    } = &event.kind
    else {
        return Err(unexpected(event));
    };

    let located = scene.locate_event(event);
    let flow = located.and_then(|(flow_uuid, _)| assets.flow_by_uuid(flow_uuid));

    scene.attach_pre::<InsertHttpLogs>(HttpLog {
        org_id: scene.org_id(),
        log_type: HttpLogType::WebhookCalled,
        flow_id: flow.map(|f| f.id),
        url: url.clone(),
        status_code: i32::from(*status_code),
        request: request.clone(),
        response: response.clone(),
        is_error: *status != WebhookStatus::Success,
        elapsed_ms: i64::try_from(*elapsed_ms).unwrap_or(i64::MAX),
        retries: i32::try_from(*retries).unwrap_or(i32::MAX),
        created_on: event.created_on,
    });

    if let (Some(flow), Some((_, node_uuid))) = (flow, located) {
        let threshold = flow
            .webhook_healthy_threshold(node_uuid)
            .unwrap_or(DEFAULT_HEALTHY_THRESHOLD);
        let healthy = (200..400).contains(status_code)
            && u128::from(*elapsed_ms) < threshold.as_millis();
        scene.attach_post::<MonitorWebhooks>(WebhookCall {
            flow_uuid: flow.uuid,
            node_uuid,
            healthy,
            at: event.created_on,
        });
    }

    if *status == WebhookStatus::SubscriberGone
        && let Some(slug) = resthook
    {
        scene.attach_pre::<UnsubscribeResthooks>(ResthookUnsubscribe {
            org_id: scene.org_id(),
            slug: slug.clone(),
            url: url.clone(),
        });
    }
    Ok(())
}

fn handle_warning(
    scene: &mut Scene,
    _assets: &OrgAssets,
    event: &Event,
    _user_id: Option<UserID>,
) -> SceneResult<()> {
    let flow_uuid = scene
        .locate_event(event)
        .map(|(flow, _)| flow)
        .or_else(|| scene.session().and_then(|s| s.current_run()).map(|r| r.flow.uuid));
    if let Some(flow_uuid) = flow_uuid {
        scene.attach_post::<IncrementWarnings>(FlowWarning {
            event_uuid: event.uuid,
            flow_uuid,
        });
    }
    Ok(())
}

fn handle_broadcast_created(
    scene: &mut Scene,
    assets: &OrgAssets,
    event: &Event,
    user_id: Option<UserID>,
) -> SceneResult<()> {
    let EventKind::BroadcastCreated {
        translations,
        base_language,
        groups,
        contacts,
        urns,
        contact_query,
    } = &event.kind
    else {
        return Err(unexpected(event));
    };
    let broadcast = Broadcast {
        id: BroadcastID(0),
        uuid: BroadcastUUID::new(),
        org_id: scene.org_id(),
        translations: translations.clone(),
        base_language: base_language.clone(),
        optin_id: None,
        contact_ids: vec![],
        group_ids: groups
            .iter()
            .filter_map(|g| assets.group_by_uuid(g.uuid))
            .map(|g| g.id)
            .collect(),
        urns: urns.clone(),
        query: contact_query.clone(),
        exclusions: Default::default(),
        created_by_id: user_id,
        created_on: event.created_on,
    };
    scene.attach_post::<CreateBroadcasts>(PendingBroadcast {
        broadcast,
        contact_uuids: contacts.iter().map(|c| c.uuid).collect(),
    });
    Ok(())
}

fn handle_input_labels_added(
    scene: &mut Scene,
    assets: &OrgAssets,
    event: &Event,
    _user_id: Option<UserID>,
) -> SceneResult<()> {
    let EventKind::InputLabelsAdded { input_uuid, labels } = &event.kind else {
        return Err(unexpected(event));
    };
    let Some(msg_uuid) = input_uuid.or_else(|| scene.incoming().map(|m| m.uuid)) else {
        return Ok(());
    };
    for label in labels {
        if let Some(label) = assets.label_by_uuid(label.uuid) {
            scene.attach_pre::<AddMessageLabels>(MsgLabel {
                msg_uuid,
                label_id: label.id,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENGINE_EVENT_TYPES: &[&str] = &[
        "msg_created",
        "msg_received",
        "msg_wait",
        "msg_deleted",
        "ivr_created",
        "airtime_transferred",
        "contact_field_changed",
        "contact_groups_changed",
        "contact_language_changed",
        "contact_last_seen_changed",
        "contact_name_changed",
        "contact_status_changed",
        "contact_urns_changed",
        "run_started",
        "run_ended",
        "run_result_changed",
        "sprint_ended",
        "session_interrupted",
        "contact_interrupted",
        "ticket_opened",
        "ticket_closed",
        "ticket_reopened",
        "ticket_assignee_changed",
        "ticket_topic_changed",
        "ticket_note_added",
        "webhook_called",
        "warning",
        "broadcast_created",
        "input_labels_added",
        "optin_requested",
        "dial_wait",
        "dial_ended",
        "wait_timed_out",
        "error",
        "failure",
        "environment_refreshed",
    ];

    #[test]
    fn test_every_engine_event_has_a_handler() {
        for event_type in ENGINE_EVENT_TYPES {
            assert!(handler_for(event_type).is_some(), "no handler for {event_type}");
        }
        assert_eq!(HANDLERS.len(), ENGINE_EVENT_TYPES.len());
        assert!(handler_for("unknown").is_none());
    }

    #[test]
    #[should_panic(expected = "handler for msg_wait registered twice")]
    fn test_duplicate_handler_panics() {
        build_registry(vec![("msg_wait", noop), ("msg_wait", noop)]);
    }

    #[tokio::test]
    async fn test_change_to_unloaded_ticket_fails() {
        let fx = crate::test_support::fixture().await;
        let assets = fx.rt.org_assets(crate::test_support::ORG).await.unwrap();
        let mut scene = fx.scene(&assets, crate::test_support::ANN);

        let err = scene
            .add_event(
                &assets,
                Event::new(EventKind::TicketClosed {
                    ticket_uuid: TicketUUID::new(),
                }),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, SceneError::Handler { event: "ticket_closed", .. }));
    }
}
