//! Ticket hooks. Every ticket change is recorded as a ticket event keyed by
//! the UUID of the engine event that caused it.

use std::collections::BTreeMap;

use chrono::Utc;
use mailroom_core_backend::CoreTx;
use mailroom_models::{
    EventUUID, Notification, NOTIFICATION_TICKETS_ACTIVITY, Ticket, TicketEvent, TicketEventType,
    TicketID, UserID,
};

use super::{HookResult, PostCommitHook, PreCommitHook, SceneBatch};
use crate::assets::OrgAssets;
use crate::queues;
use crate::runtime::Runtime;
use crate::tasks::{ContactTask, TicketClosed};

#[derive(Debug, Clone)]
pub struct NewTicket {
    pub ticket: Ticket,
    pub note: Option<String>,
    pub event_uuid: EventUUID,
    pub created_by_id: Option<UserID>,
}

pub struct InsertTickets;

#[async_trait::async_trait]
impl PreCommitHook for InsertTickets {
    type Payload = NewTicket;

    const NAME: &'static str = "insert_tickets";
    const ORDER: i32 = 10;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, NewTicket>,
    ) -> HookResult<()> {
        let opened: Vec<&NewTicket> = scenes.iter().flat_map(|(_, t)| t.iter()).collect();
        let tickets: Vec<Ticket> = opened.iter().map(|n| n.ticket.clone()).collect();
        let ids = tx.insert_tickets(&tickets).await?;

        let now = Utc::now();
        let mut events = Vec::with_capacity(opened.len());
        let mut notifications = Vec::new();
        for (new, id) in opened.iter().zip(ids) {
            events.push(TicketEvent {
                uuid: new.event_uuid,
                org_id: new.ticket.org_id,
                contact_id: new.ticket.contact_id,
                ticket_id: id,
                event_type: TicketEventType::Opened,
                note: new.note.clone(),
                topic_id: new.ticket.topic_id,
                assignee_id: new.ticket.assignee_id,
                created_by_id: new.created_by_id,
                created_on: now,
            });
            if let Some(assignee) = new.ticket.assignee_id
                && new.created_by_id != Some(assignee)
            {
                notifications.push(activity_notification(new.ticket.org_id, assignee, id));
            }
        }
        tx.insert_ticket_events(&events).await?;
        if !notifications.is_empty() {
            tx.insert_notifications(&notifications).await?;
        }
        Ok(())
    }
}

fn activity_notification(
    org_id: mailroom_models::OrgID,
    user_id: UserID,
    ticket_id: TicketID,
) -> Notification {
    Notification {
        org_id,
        notification_type: NOTIFICATION_TICKETS_ACTIVITY.to_string(),
        scope: String::new(),
        user_id,
        ticket_id: Some(ticket_id),
        incident_id: None,
        created_on: Utc::now(),
    }
}

/// An existing ticket in its changed state, and the event recording the change.
#[derive(Debug, Clone)]
pub struct TicketChange {
    pub ticket: Ticket,
    pub event: TicketEvent,
}

pub struct UpdateTickets;

#[async_trait::async_trait]
impl PreCommitHook for UpdateTickets {
    type Payload = TicketChange;

    const NAME: &'static str = "update_tickets";
    const ORDER: i32 = 10;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, TicketChange>,
    ) -> HookResult<()> {
        let mut latest: BTreeMap<TicketID, Ticket> = BTreeMap::new();
        let mut events = Vec::new();
        let mut notifications = Vec::new();
        for (_, changes) in scenes {
            for change in changes.iter() {
                latest.insert(change.ticket.id, change.ticket.clone());
                if change.event.event_type == TicketEventType::Assigned
                    && let Some(assignee) = change.event.assignee_id
                    && change.event.created_by_id != Some(assignee)
                {
                    notifications.push(activity_notification(
                        change.ticket.org_id,
                        assignee,
                        change.ticket.id,
                    ));
                }
                events.push(change.event.clone());
            }
        }
        let tickets: Vec<Ticket> = latest.into_values().collect();
        tx.update_tickets(&tickets).await?;
        tx.insert_ticket_events(&events).await?;
        if !notifications.is_empty() {
            tx.insert_notifications(&notifications).await?;
        }
        Ok(())
    }
}

/// Bumps last activity on tickets a contact has replied to.
pub struct UpdateTicketActivity;

#[async_trait::async_trait]
impl PreCommitHook for UpdateTicketActivity {
    type Payload = TicketID;

    const NAME: &'static str = "update_ticket_activity";
    const ORDER: i32 = 10;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, TicketID>,
    ) -> HookResult<()> {
        let mut ids: Vec<TicketID> = scenes.iter().flat_map(|(_, ids)| ids.iter().copied()).collect();
        ids.sort();
        ids.dedup();
        tx.update_ticket_activity(&ids, Utc::now()).await?;
        Ok(())
    }
}

/// Queues a ticket_closed contact task so closed-ticket triggers can fire.
pub struct QueueTicketClosed;

#[async_trait::async_trait]
impl PostCommitHook for QueueTicketClosed {
    type Payload = TicketID;

    const NAME: &'static str = "queue_ticket_closed";
    const ORDER: i32 = 10;

    async fn execute(
        &self,
        rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, TicketID>,
    ) -> HookResult<()> {
        for (scene, ids) in scenes {
            for ticket_id in ids.iter() {
                queues::queue_contact_task(
                    rt.kv.as_ref(),
                    scene.org_id(),
                    scene.contact_id(),
                    &ContactTask::TicketClosed(TicketClosed {
                        ticket_id: *ticket_id,
                    }),
                    false,
                )
                .await?;
            }
        }
        Ok(())
    }
}
