//! Task queues.
//!
//! Org tasks go on one of three fair queues, owned by the org that queued
//! them. Contact tasks go on a per-contact FIFO list instead, and each push
//! also queues a `handle_contact_event` org task so some worker drains the
//! list while holding the contact's lock.
//!
//! Everything travels in the same JSON envelope:
//! `{"type": ..., "task": ..., "queued_on": ..., "error_count": ...}`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use mailroom_kv_backend::{KvBackend, KvError, Priority};
use mailroom_models::{ContactID, OrgID};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::tasks::{ContactTask, HandleContactEvent, OrgTask};

/// Incoming contact events.
pub const REALTIME: &str = "realtime";
/// Campaign triggers, flow starts and broadcasts.
pub const BATCH: &str = "batch";
/// Flow start batches.
pub const THROTTLED: &str = "throttled";

pub const ALL_QUEUES: [&str; 3] = [REALTIME, BATCH, THROTTLED];

/// Attempts a contact task gets before it is dropped.
pub const MAX_TASK_ERRORS: u32 = 3;

/// Wait before a failed contact task is picked up again, per failure so far.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

pub fn retry_delay(error_count: u32) -> Duration {
    RETRY_DELAY * error_count
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("error encoding task: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("error decoding task: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("malformed task envelope: {0}")]
    Envelope(String),
}

/// A task taken out of its envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Queued<T> {
    pub task: T,
    pub queued_on: DateTime<Utc>,
    pub error_count: u32,
}

/// Wrap a tagged task in its envelope. The task must serialize as
/// `{"type": ..., "task": ...}`.
pub fn encode<T: Serialize>(task: &T, error_count: u32) -> Result<String, QueueError> {
    let mut value = serde_json::to_value(task).map_err(QueueError::Encode)?;
    let Value::Object(fields) = &mut value else {
        return Err(QueueError::Envelope("task must serialize to an object".to_string()));
    };
    fields.insert("queued_on".to_string(), Value::String(Utc::now().to_rfc3339()));
    fields.insert("error_count".to_string(), Value::from(error_count));
    serde_json::to_string(&value).map_err(QueueError::Encode)
}

/// Unwrap an envelope. Unknown task types are decode errors.
pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<Queued<T>, QueueError> {
    let mut value: Value = serde_json::from_str(raw).map_err(QueueError::Decode)?;
    let Value::Object(fields) = &mut value else {
        return Err(QueueError::Envelope("envelope isn't an object".to_string()));
    };
    let queued_on = fields
        .remove("queued_on")
        .and_then(|v| v.as_str().and_then(|s| DateTime::parse_from_rfc3339(s).ok()))
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| QueueError::Envelope("missing queued_on".to_string()))?;
    let error_count = fields
        .remove("error_count")
        .and_then(|v| v.as_u64())
        .unwrap_or_default();
    let task = serde_json::from_value(value).map_err(QueueError::Decode)?;
    Ok(Queued {
        task,
        queued_on,
        error_count: u32::try_from(error_count).unwrap_or(u32::MAX),
    })
}

pub async fn queue_org_task(
    kv: &dyn KvBackend,
    queue: &str,
    org_id: OrgID,
    task: &OrgTask,
    priority: Priority,
) -> Result<(), QueueError> {
    let raw = encode(task, 0)?;
    kv.queue_push(queue, &org_id.to_string(), &raw, priority).await?;
    Ok(())
}

pub fn contact_queue_key(org_id: OrgID, contact_id: ContactID) -> String {
    format!("c:{org_id}:{contact_id}")
}

/// Push a contact task to the back of the contact's list, or to the front
/// when it must run before what is already there.
pub async fn queue_contact_task(
    kv: &dyn KvBackend,
    org_id: OrgID,
    contact_id: ContactID,
    task: &ContactTask,
    front: bool,
) -> Result<(), QueueError> {
    let raw = encode(task, 0)?;
    kv.list_push(&contact_queue_key(org_id, contact_id), &raw, front)
        .await?;
    queue_contact_marker(kv, org_id, contact_id).await
}

/// Make sure some worker will drain the contact's task list.
pub(crate) async fn queue_contact_marker(
    kv: &dyn KvBackend,
    org_id: OrgID,
    contact_id: ContactID,
) -> Result<(), QueueError> {
    queue_org_task(
        kv,
        REALTIME,
        org_id,
        &OrgTask::HandleContactEvent(HandleContactEvent { contact_id }),
        Priority::Default,
    )
    .await
}

#[cfg(test)]
mod tests {
    use mailroom_backend_memory::MemoryBackend;
    use mailroom_models::{SessionUUID, SprintUUID, TicketID};

    use super::*;
    use crate::tasks::{TicketClosed, WaitTimeout};

    #[test]
    fn test_envelope_shape() {
        let raw = encode(
            &ContactTask::TicketClosed(TicketClosed {
                ticket_id: TicketID(7),
            }),
            2,
        )
        .unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "ticket_closed");
        assert_eq!(value["task"]["ticket_id"], 7);
        assert_eq!(value["error_count"], 2);
        assert!(value["queued_on"].is_string());

        let queued: Queued<ContactTask> = decode(&raw).unwrap();
        assert_eq!(queued.error_count, 2);
        assert!(matches!(queued.task, ContactTask::TicketClosed(t) if t.ticket_id == TicketID(7)));
    }

    #[test]
    fn test_unknown_type_is_a_decode_error() {
        let raw = r#"{"type": "fly_to_moon", "task": {}, "queued_on": "2025-01-01T00:00:00Z", "error_count": 0}"#;
        let err = decode::<ContactTask>(raw).unwrap_err();
        assert!(matches!(err, QueueError::Decode(_)));

        let err = decode::<ContactTask>(r#"{"type": "ticket_closed", "task": {"ticket_id": 1}}"#)
            .unwrap_err();
        assert!(matches!(err, QueueError::Envelope(_)));
    }

    #[tokio::test]
    async fn test_contact_tasks_queue_a_marker() {
        let kv = MemoryBackend::new();
        let task = ContactTask::WaitTimeout(WaitTimeout {
            session_uuid: SessionUUID::new(),
            sprint_uuid: SprintUUID::new(),
        });
        queue_contact_task(&kv, OrgID(1), ContactID(10), &task, false)
            .await
            .unwrap();
        queue_contact_task(
            &kv,
            OrgID(1),
            ContactID(10),
            &ContactTask::TicketClosed(TicketClosed {
                ticket_id: TicketID(3),
            }),
            true,
        )
        .await
        .unwrap();

        let list = kv.list_range("c:1:10").await.unwrap();
        assert_eq!(list.len(), 2);
        assert!(list[0].contains("ticket_closed"));
        assert!(list[1].contains("wait_timeout"));

        assert_eq!(kv.queue_size(REALTIME).await.unwrap(), 2);
        let (owner, raw) = kv.queue_pop(REALTIME).await.unwrap().unwrap();
        assert_eq!(owner, "1");
        let queued: Queued<OrgTask> = decode(&raw).unwrap();
        assert!(matches!(
            queued.task,
            OrgTask::HandleContactEvent(HandleContactEvent { contact_id }) if contact_id == ContactID(10)
        ));
    }
}
