//! Bulk ticket changes made by users.
//!
//! Tickets are grouped by the contact that owns them, the contacts are
//! locked and loaded with those tickets plus any they already have open,
//! and the matching modifier is applied to each scene so the changes flow
//! through the usual handlers and hooks.

use std::collections::BTreeMap;

use mailroom_core_backend::BackendError;
use mailroom_flows::{EventKind, Modifier, TopicRef, UserRef};
use mailroom_models::{ContactID, OrgID, Ticket, TicketID, TicketUUID, TopicID, UserID};
use tracing::debug;

use crate::assets::{AssetsError, OrgAssets};
use crate::commit::{CommitError, bulk_commit};
use crate::locker::{self, ContactLock};
use crate::runtime::Runtime;
use crate::scene::{Scene, SceneError, Via};

#[derive(Debug, thiserror::Error)]
pub enum TicketsError {
    #[error("no such user: {0}")]
    UnknownUser(UserID),
    #[error("no such topic: {0}")]
    UnknownTopic(TopicID),
    #[error(transparent)]
    Assets(#[from] AssetsError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Kv(#[from] mailroom_kv_backend::KvError),
    #[error(transparent)]
    Scene(#[from] SceneError),
    #[error(transparent)]
    Commit(#[from] CommitError),
}

pub type TicketsResult<T> = Result<T, TicketsError>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketsChanged {
    /// Tickets that actually changed.
    pub changed: Vec<TicketID>,
    /// Contacts whose lock couldn't be obtained; their tickets are untouched.
    pub skipped: Vec<ContactID>,
}

pub async fn assign(
    rt: &Runtime,
    org_id: OrgID,
    user_id: UserID,
    ticket_ids: &[TicketID],
    assignee_id: Option<UserID>,
) -> TicketsResult<TicketsChanged> {
    let assets = rt.org_assets(org_id).await?;
    let assignee = match assignee_id {
        Some(id) => {
            let user = assets.user_by_id(id).ok_or(TicketsError::UnknownUser(id))?;
            Some(UserRef {
                uuid: user.uuid,
                name: user.name.clone(),
            })
        }
        None => None,
    };
    modify_tickets(rt, &assets, user_id, ticket_ids, |ticket_uuids| Modifier::TicketAssignee {
        ticket_uuids,
        assignee: assignee.clone(),
    })
    .await
}

pub async fn add_note(
    rt: &Runtime,
    org_id: OrgID,
    user_id: UserID,
    ticket_ids: &[TicketID],
    note: &str,
) -> TicketsResult<TicketsChanged> {
    let assets = rt.org_assets(org_id).await?;
    modify_tickets(rt, &assets, user_id, ticket_ids, |ticket_uuids| Modifier::TicketNote {
        ticket_uuids,
        note: note.to_string(),
    })
    .await
}

pub async fn change_topic(
    rt: &Runtime,
    org_id: OrgID,
    user_id: UserID,
    ticket_ids: &[TicketID],
    topic_id: TopicID,
) -> TicketsResult<TicketsChanged> {
    let assets = rt.org_assets(org_id).await?;
    let topic = assets
        .topics()
        .iter()
        .find(|t| t.id == topic_id)
        .ok_or(TicketsError::UnknownTopic(topic_id))?;
    let topic = TopicRef {
        uuid: topic.uuid,
        name: topic.name.clone(),
    };
    modify_tickets(rt, &assets, user_id, ticket_ids, |ticket_uuids| Modifier::TicketTopic {
        ticket_uuids,
        topic: topic.clone(),
    })
    .await
}

/// Close tickets. Each closed ticket queues a `ticket_closed` task for its
/// contact, which may fire a ticket-closed trigger.
pub async fn close(
    rt: &Runtime,
    org_id: OrgID,
    user_id: UserID,
    ticket_ids: &[TicketID],
) -> TicketsResult<TicketsChanged> {
    let assets = rt.org_assets(org_id).await?;
    modify_tickets(rt, &assets, user_id, ticket_ids, |ticket_uuids| Modifier::TicketClose {
        ticket_uuids,
    })
    .await
}

/// Reopen closed tickets. A contact keeps at most one open ticket, so
/// contacts that already have one are left alone.
pub async fn reopen(
    rt: &Runtime,
    org_id: OrgID,
    user_id: UserID,
    ticket_ids: &[TicketID],
) -> TicketsResult<TicketsChanged> {
    let assets = rt.org_assets(org_id).await?;
    modify_tickets(rt, &assets, user_id, ticket_ids, |ticket_uuids| Modifier::TicketReopen {
        ticket_uuids,
    })
    .await
}

async fn modify_tickets(
    rt: &Runtime,
    assets: &OrgAssets,
    user_id: UserID,
    ticket_ids: &[TicketID],
    modifier_for: impl Fn(Vec<TicketUUID>) -> Modifier,
) -> TicketsResult<TicketsChanged> {
    let org_id = assets.org_id();
    let mut by_contact: BTreeMap<ContactID, Vec<Ticket>> = BTreeMap::new();
    for ticket in rt.db.load_tickets(org_id, ticket_ids).await? {
        by_contact.entry(ticket.contact_id).or_default().push(ticket);
    }
    if by_contact.is_empty() {
        return Ok(TicketsChanged::default());
    }

    let contact_ids: Vec<ContactID> = by_contact.keys().copied().collect();
    let (locks, skipped) =
        locker::lock_contacts(rt, &contact_ids, locker::TASK_LOCK_WAIT).await?;
    let locked: Vec<ContactID> = locks.iter().map(ContactLock::contact_id).collect();

    let result = modify_locked(rt, assets, user_id, &locked, by_contact, modifier_for).await;
    for lock in locks {
        lock.release().await;
    }

    let changed = result?;
    debug!(org_id = %org_id, changed = changed.len(), skipped = skipped.len(), "modified tickets");
    Ok(TicketsChanged { changed, skipped })
}

async fn modify_locked(
    rt: &Runtime,
    assets: &OrgAssets,
    user_id: UserID,
    locked: &[ContactID],
    mut by_contact: BTreeMap<ContactID, Vec<Ticket>>,
    modifier_for: impl Fn(Vec<TicketUUID>) -> Modifier,
) -> TicketsResult<Vec<TicketID>> {
    if locked.is_empty() {
        return Ok(Vec::new());
    }
    let org_id = assets.org_id();
    let contacts = rt.db.load_contacts(org_id, locked).await?;
    let open = rt.db.load_open_tickets(org_id, locked).await?;

    let mut changed = Vec::new();
    let mut scenes = Vec::with_capacity(contacts.len());
    for contact in contacts {
        let mut tickets = by_contact.remove(&contact.id).unwrap_or_default();
        let targets: Vec<TicketUUID> = tickets.iter().map(|t| t.uuid).collect();
        for ticket in open.iter().filter(|t| t.contact_id == contact.id) {
            if !tickets.iter().any(|t| t.id == ticket.id) {
                tickets.push(ticket.clone());
            }
        }

        let mut scene = Scene::for_contact(assets, contact, tickets);
        let events =
            scene.apply_modifier(rt, assets, &modifier_for(targets), Some(user_id), Via::Ui)?;
        for event in &events {
            let Some(uuid) = changed_ticket(&event.kind) else {
                continue;
            };
            if let Some(ticket) = scene.tickets().iter().find(|t| t.uuid == uuid)
                && !changed.contains(&ticket.id)
            {
                changed.push(ticket.id);
            }
        }
        scenes.push(scene);
    }

    bulk_commit(rt, assets, &mut scenes).await?;
    changed.sort();
    Ok(changed)
}

fn changed_ticket(kind: &EventKind) -> Option<TicketUUID> {
    match kind {
        EventKind::TicketClosed { ticket_uuid }
        | EventKind::TicketReopened { ticket_uuid }
        | EventKind::TicketAssigneeChanged { ticket_uuid, .. }
        | EventKind::TicketTopicChanged { ticket_uuid, .. }
        | EventKind::TicketNoteAdded { ticket_uuid, .. } => Some(*ticket_uuid),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use mailroom_kv_backend::KvBackend;
    use mailroom_models::{TicketEventType, TicketStatus};

    use super::*;
    use crate::queues::contact_queue_key;
    use crate::test_support::{self, ADMIN, ANN, BOB, ORG};

    #[tokio::test]
    async fn test_close_and_reopen() {
        let fx = test_support::fixture().await;
        let ann = fx.open_ticket(ANN).await;
        let bob = fx.open_ticket(BOB).await;

        let result = close(&fx.rt, ORG, ADMIN, &[ann.id, bob.id]).await.unwrap();
        assert_eq!(result.changed, vec![ann.id, bob.id]);
        assert!(result.skipped.is_empty());

        let snapshot = fx.mem.snapshot();
        assert_eq!(snapshot.tickets[&ann.id].status, TicketStatus::Closed);
        assert!(snapshot.tickets[&ann.id].closed_on.is_some());
        assert_eq!(
            snapshot
                .ticket_events
                .iter()
                .filter(|e| e.event_type == TicketEventType::Closed)
                .count(),
            2
        );
        let queued = fx.rt.kv.list_range(&contact_queue_key(ORG, ANN)).await.unwrap();
        assert!(queued.iter().any(|raw| raw.contains("ticket_closed")));

        // closing again is a no-op
        let result = close(&fx.rt, ORG, ADMIN, &[ann.id]).await.unwrap();
        assert!(result.changed.is_empty());

        let result = reopen(&fx.rt, ORG, ADMIN, &[ann.id]).await.unwrap();
        assert_eq!(result.changed, vec![ann.id]);
        assert_eq!(fx.mem.snapshot().tickets[&ann.id].status, TicketStatus::Open);
    }

    #[tokio::test]
    async fn test_reopen_skips_contacts_with_open_ticket() {
        let fx = test_support::fixture().await;
        let first = fx.open_ticket(ANN).await;
        close(&fx.rt, ORG, ADMIN, &[first.id]).await.unwrap();
        let second = fx.open_ticket(ANN).await;

        let result = reopen(&fx.rt, ORG, ADMIN, &[first.id]).await.unwrap();
        assert!(result.changed.is_empty());
        let snapshot = fx.mem.snapshot();
        assert_eq!(snapshot.tickets[&first.id].status, TicketStatus::Closed);
        assert_eq!(snapshot.tickets[&second.id].status, TicketStatus::Open);
    }

    #[tokio::test]
    async fn test_assign_note_and_topic() {
        let fx = test_support::fixture().await;
        let ticket = fx.open_ticket(ANN).await;

        let result = assign(&fx.rt, ORG, ADMIN, &[ticket.id], Some(ADMIN)).await.unwrap();
        assert_eq!(result.changed, vec![ticket.id]);
        assert_eq!(fx.mem.snapshot().tickets[&ticket.id].assignee_id, Some(ADMIN));

        let result = add_note(&fx.rt, ORG, ADMIN, &[ticket.id], "call back tomorrow")
            .await
            .unwrap();
        assert_eq!(result.changed, vec![ticket.id]);

        let result = change_topic(&fx.rt, ORG, ADMIN, &[ticket.id], TopicID(2)).await.unwrap();
        assert_eq!(result.changed, vec![ticket.id]);
        assert_eq!(fx.mem.snapshot().tickets[&ticket.id].topic_id, Some(TopicID(2)));

        let types: Vec<TicketEventType> = fx
            .mem
            .snapshot()
            .ticket_events
            .iter()
            .filter(|e| e.ticket_id == ticket.id)
            .map(|e| e.event_type)
            .collect();
        assert!(types.contains(&TicketEventType::Assigned));
        assert!(types.contains(&TicketEventType::NoteAdded));
        assert!(types.contains(&TicketEventType::TopicChanged));
    }

    #[tokio::test]
    async fn test_unknown_references() {
        let fx = test_support::fixture().await;
        let ticket = fx.open_ticket(ANN).await;

        let err = assign(&fx.rt, ORG, ADMIN, &[ticket.id], Some(UserID(999)))
            .await
            .unwrap_err();
        assert!(matches!(err, TicketsError::UnknownUser(UserID(999))));

        let err = change_topic(&fx.rt, ORG, ADMIN, &[ticket.id], TopicID(999))
            .await
            .unwrap_err();
        assert!(matches!(err, TicketsError::UnknownTopic(TopicID(999))));

        let result = close(&fx.rt, ORG, ADMIN, &[TicketID(999)]).await.unwrap();
        assert_eq!(result, TicketsChanged::default());
    }
}
