//! Queued tasks.
//!
//! Both task families are closed, adjacently tagged unions, so the queue
//! envelope's `type` picks the variant and an unknown type fails to decode.
//! [`OrgTask`]s travel on the fair queues; [`ContactTask`]s sit on a
//! contact's own list and only ever run under that contact's lock.

pub mod broadcasts;
pub mod contact;
pub mod starts;
pub mod worker;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mailroom_core_backend::BackendError;
use mailroom_flows::EngineError;
use mailroom_kv_backend::KvError;
use mailroom_models::{
    BroadcastID, ChannelEventType, ChannelID, Contact, ContactID, MsgID, MsgStatus, MsgUUID,
    OptInID, OrgID, PointID, SessionUUID, SprintUUID, StartID, TicketID, URN, URNID,
};
use serde::{Deserialize, Serialize};

use crate::assets::{AssetsError, OrgAssets};
use crate::commit::CommitError;
use crate::hooks::HookError;
use crate::ivr::IvrError;
use crate::queues::QueueError;
use crate::runner::RunnerError;
use crate::runtime::Runtime;
use crate::scene::SceneError;

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Assets(#[from] AssetsError),
    #[error(transparent)]
    Scene(#[from] SceneError),
    #[error(transparent)]
    Commit(#[from] CommitError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Ivr(#[from] IvrError),
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error("{0} not found")]
    NotFound(String),
}

impl TaskError {
    /// Missing orgs, contacts and the like. Tasks failing this way are
    /// dropped rather than retried.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Assets(err) => err.is_not_found(),
            Self::Backend(err) => err.is_not_found(),
            Self::Scene(err) => err.is_not_found(),
            Self::Commit(err) => err.is_not_found(),
            Self::Runner(err) => err.is_not_found(),
            Self::Engine(err) => err.is_not_found(),
            Self::Hook(err) => err.is_not_found(),
            Self::Ivr(err) => err.is_not_found(),
            _ => false,
        }
    }
}

pub type TaskResult<T> = Result<T, TaskError>;

/// An incoming message, already persisted by the receiving channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgReceived {
    pub channel_id: ChannelID,
    pub msg_id: MsgID,
    pub msg_uuid: MsgUUID,
    pub msg_external_id: Option<String>,
    pub urn: URN,
    pub urn_id: URNID,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub new_contact: bool,
}

/// A delivery status reported for an outgoing message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgEvent {
    pub msg_id: MsgID,
    pub status: MsgStatus,
    pub external_id: Option<String>,
    pub failed_reason: Option<String>,
}

/// A channel event about the contact that isn't a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventReceived {
    pub event_type: ChannelEventType,
    pub channel_id: ChannelID,
    pub urn_id: Option<URNID>,
    pub urn: Option<URN>,
    pub optin_id: Option<OptInID>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
    #[serde(default)]
    pub new_contact: bool,
    pub created_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgDeleted {
    pub msg_uuid: MsgUUID,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketClosed {
    pub ticket_id: TicketID,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitExpired {
    pub session_uuid: SessionUUID,
    pub sprint_uuid: SprintUUID,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitTimeout {
    pub session_uuid: SessionUUID,
    pub sprint_uuid: SprintUUID,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionExpired {
    pub session_uuid: SessionUUID,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "task", rename_all = "snake_case")]
pub enum ContactTask {
    MsgReceived(MsgReceived),
    MsgEvent(MsgEvent),
    EventReceived(EventReceived),
    MsgDeleted(MsgDeleted),
    TicketClosed(TicketClosed),
    WaitExpired(WaitExpired),
    WaitTimeout(WaitTimeout),
    SessionExpired(SessionExpired),
}

impl ContactTask {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::MsgReceived(_) => "msg_received",
            Self::MsgEvent(_) => "msg_event",
            Self::EventReceived(_) => "event_received",
            Self::MsgDeleted(_) => "msg_deleted",
            Self::TicketClosed(_) => "ticket_closed",
            Self::WaitExpired(_) => "wait_expired",
            Self::WaitTimeout(_) => "wait_timeout",
            Self::SessionExpired(_) => "session_expired",
        }
    }

    /// Run the task for a contact whose lock the caller holds.
    pub async fn perform(
        self,
        rt: &Runtime,
        assets: &OrgAssets,
        contact: Contact,
    ) -> TaskResult<()> {
        match self {
            Self::MsgReceived(task) => contact::msg_received(rt, assets, contact, task).await,
            Self::MsgEvent(task) => contact::msg_event(rt, task).await,
            Self::EventReceived(task) => contact::event_received(rt, assets, contact, task).await,
            Self::MsgDeleted(task) => contact::msg_deleted(rt, assets, contact, task).await,
            Self::TicketClosed(task) => contact::ticket_closed(rt, assets, contact, task).await,
            Self::WaitExpired(task) => contact::wait_expired(rt, assets, contact, task).await,
            Self::WaitTimeout(task) => contact::wait_timeout(rt, assets, contact, task).await,
            Self::SessionExpired(task) => contact::session_expired(rt, assets, contact, task).await,
        }
    }
}

/// Marker telling a worker to drain a contact's task list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleContactEvent {
    pub contact_id: ContactID,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartFlow {
    pub start_id: StartID,
}

/// One slice of a flow start's contacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartFlowBatch {
    pub start_id: StartID,
    pub contact_ids: Vec<ContactID>,
    #[serde(default)]
    pub is_last: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendBroadcast {
    pub broadcast_id: BroadcastID,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleCampaignPoint {
    pub point_id: PointID,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkCampaignTrigger {
    pub point_id: PointID,
    pub fire_version: i32,
    pub contact_ids: Vec<ContactID>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "task", rename_all = "snake_case")]
pub enum OrgTask {
    HandleContactEvent(HandleContactEvent),
    StartFlow(StartFlow),
    StartFlowBatch(StartFlowBatch),
    SendBroadcast(SendBroadcast),
    ScheduleCampaignPoint(ScheduleCampaignPoint),
    BulkCampaignTrigger(BulkCampaignTrigger),
}

impl OrgTask {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::HandleContactEvent(_) => "handle_contact_event",
            Self::StartFlow(_) => "start_flow",
            Self::StartFlowBatch(_) => "start_flow_batch",
            Self::SendBroadcast(_) => "send_broadcast",
            Self::ScheduleCampaignPoint(_) => "schedule_campaign_point",
            Self::BulkCampaignTrigger(_) => "bulk_campaign_trigger",
        }
    }

    pub async fn perform(self, rt: &Runtime, org_id: OrgID) -> TaskResult<()> {
        match self {
            Self::HandleContactEvent(task) => {
                contact::handle_contact_event(rt, org_id, task.contact_id).await
            }
            Self::StartFlow(task) => starts::start_flow(rt, org_id, task.start_id).await,
            Self::StartFlowBatch(task) => starts::start_flow_batch(rt, org_id, task).await,
            Self::SendBroadcast(task) => {
                broadcasts::send_broadcast(rt, org_id, task.broadcast_id).await
            }
            Self::ScheduleCampaignPoint(task) => {
                crate::campaigns::schedule_point(rt, org_id, task.point_id)
                    .await
                    .map(|_| ())
            }
            Self::BulkCampaignTrigger(task) => crate::campaigns::bulk_trigger(rt, org_id, &task)
                .await
                .map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queues::{decode, encode};

    #[test]
    fn test_org_tasks_are_tagged_by_type() {
        let task = OrgTask::BulkCampaignTrigger(BulkCampaignTrigger {
            point_id: PointID(4),
            fire_version: 2,
            contact_ids: vec![ContactID(1), ContactID(2)],
        });
        let value: serde_json::Value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["type"], "bulk_campaign_trigger");
        assert_eq!(value["task"]["contact_ids"], serde_json::json!([1, 2]));
        assert_eq!(task.type_name(), "bulk_campaign_trigger");
    }

    #[test]
    fn test_contact_task_type_names_match_tags() {
        let tasks = vec![
            ContactTask::MsgDeleted(MsgDeleted {
                msg_uuid: MsgUUID::new(),
            }),
            ContactTask::SessionExpired(SessionExpired {
                session_uuid: SessionUUID::new(),
            }),
            ContactTask::MsgEvent(MsgEvent {
                msg_id: MsgID(3),
                status: MsgStatus::Delivered,
                external_id: Some("ext-1".to_string()),
                failed_reason: None,
            }),
        ];
        for task in tasks {
            let raw = encode(&task, 0).unwrap();
            let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
            assert_eq!(value["type"], task.type_name());
            let decoded = decode::<ContactTask>(&raw).unwrap().task;
            assert_eq!(decoded.type_name(), task.type_name());
        }
    }

    #[test]
    fn test_not_found_errors_are_recognized() {
        assert!(TaskError::NotFound("contact".to_string()).is_not_found());
        assert!(TaskError::Assets(AssetsError::NotFound("org 1".to_string())).is_not_found());
        assert!(TaskError::Backend(BackendError::NotFound("flow".to_string())).is_not_found());
        assert!(!TaskError::Backend(BackendError::Message("boom".to_string())).is_not_found());
    }

    #[test]
    fn test_wrapped_not_found_errors_are_recognized() {
        let missing = || BackendError::NotFound("session".to_string());

        let err = TaskError::Runner(RunnerError::Scene(SceneError::Backend(missing())));
        assert!(err.is_not_found());
        let err = TaskError::Runner(RunnerError::Commit(CommitError::Hook {
            hook: "insert_sessions",
            source: HookError::Backend(missing()),
        }));
        assert!(err.is_not_found());
        let err = TaskError::Scene(SceneError::Engine(EngineError::FlowNotFound(
            mailroom_models::FlowUUID::new(),
        )));
        assert!(err.is_not_found());
        let err = TaskError::Ivr(IvrError::Runner(RunnerError::Backend(missing())));
        assert!(err.is_not_found());

        let err = TaskError::Runner(RunnerError::Commit(CommitError::Timeout(
            std::time::Duration::from_secs(1),
        )));
        assert!(!err.is_not_found());
        let err = TaskError::Scene(SceneError::UnknownEventType("made_up"));
        assert!(!err.is_not_found());
    }
}
