//! Events emitted by the engine, plus the synthetic events the core adds
//! around sprints and interruptions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mailroom_models::{
    BroadcastTranslation, ContactStatus, EventUUID, FieldValue, MsgUUID, RunStatus,
    SessionStatus, StepUUID, TicketUUID, URN,
};

use crate::{
    ChannelRef, ContactRef, FieldRef, FlowRef, GroupRef, LabelRef, OptInRef, TopicRef, UserRef,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub uuid: EventUUID,
    pub created_on: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_uuid: Option<StepUUID>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            uuid: EventUUID::new(),
            created_on: Utc::now(),
            step_uuid: None,
            kind,
        }
    }

    pub fn at_step(kind: EventKind, step_uuid: StepUUID) -> Self {
        Self {
            step_uuid: Some(step_uuid),
            ..Self::new(kind)
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgOut {
    pub uuid: MsgUUID,
    pub urn: Option<URN>,
    pub channel: Option<ChannelRef>,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub quick_replies: Vec<String>,
    pub locale: Option<String>,
    /// Set when the engine knows the message can't be sent, e.g. no usable URN.
    pub unsendable_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgIn {
    pub uuid: MsgUUID,
    pub urn: Option<URN>,
    pub channel: Option<ChannelRef>,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Success,
    ResponseError,
    ConnectionError,
    SubscriberGone,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpTrace {
    pub url: String,
    pub status_code: u16,
    pub request: String,
    pub response: String,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialStatus {
    Answered,
    NoAnswer,
    Busy,
    Failed,
}

impl DialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Answered => "answered",
            Self::NoAnswer => "no_answer",
            Self::Busy => "busy",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "answered" => Some(Self::Answered),
            "no_answer" => Some(Self::NoAnswer),
            "busy" => Some(Self::Busy),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    MsgCreated {
        msg: MsgOut,
    },
    MsgReceived {
        msg: MsgIn,
    },
    MsgWait {
        timeout_seconds: Option<i64>,
        expires_on: Option<DateTime<Utc>>,
    },
    MsgDeleted {
        msg_uuid: MsgUUID,
        #[serde(default)]
        by_contact: bool,
    },
    IvrCreated {
        msg: MsgOut,
    },
    AirtimeTransferred {
        external_id: Option<String>,
        sender: Option<URN>,
        recipient: URN,
        currency: String,
        desired_amount: f64,
        actual_amount: f64,
        #[serde(default)]
        http_logs: Vec<HttpTrace>,
    },
    ContactFieldChanged {
        field: FieldRef,
        value: Option<FieldValue>,
    },
    ContactGroupsChanged {
        #[serde(default)]
        groups_added: Vec<GroupRef>,
        #[serde(default)]
        groups_removed: Vec<GroupRef>,
    },
    ContactLanguageChanged {
        language: String,
    },
    ContactLastSeenChanged {
        last_seen_on: DateTime<Utc>,
    },
    ContactNameChanged {
        name: String,
    },
    ContactStatusChanged {
        status: ContactStatus,
    },
    ContactUrnsChanged {
        urns: Vec<URN>,
    },
    RunStarted {
        run_uuid: mailroom_models::RunUUID,
        flow: FlowRef,
    },
    RunEnded {
        run_uuid: mailroom_models::RunUUID,
        flow: FlowRef,
        status: RunStatus,
    },
    RunResultChanged {
        name: String,
        value: String,
        category: Option<String>,
        previous_category: Option<String>,
    },
    SprintEnded {},
    SessionInterrupted {
        status: SessionStatus,
    },
    ContactInterrupted {},
    TicketOpened {
        ticket_uuid: TicketUUID,
        topic: Option<TopicRef>,
        assignee: Option<UserRef>,
        note: Option<String>,
    },
    TicketClosed {
        ticket_uuid: TicketUUID,
    },
    TicketReopened {
        ticket_uuid: TicketUUID,
    },
    TicketAssigneeChanged {
        ticket_uuid: TicketUUID,
        assignee: Option<UserRef>,
    },
    TicketTopicChanged {
        ticket_uuid: TicketUUID,
        topic: TopicRef,
    },
    TicketNoteAdded {
        ticket_uuid: TicketUUID,
        note: String,
    },
    WebhookCalled {
        url: String,
        status: WebhookStatus,
        status_code: u16,
        elapsed_ms: u64,
        #[serde(default)]
        retries: u32,
        #[serde(default)]
        request: String,
        #[serde(default)]
        response: String,
        resthook: Option<String>,
    },
    Warning {
        text: String,
    },
    BroadcastCreated {
        translations: BTreeMap<String, BroadcastTranslation>,
        base_language: String,
        #[serde(default)]
        groups: Vec<GroupRef>,
        #[serde(default)]
        contacts: Vec<ContactRef>,
        #[serde(default)]
        urns: Vec<URN>,
        contact_query: Option<String>,
    },
    InputLabelsAdded {
        input_uuid: Option<MsgUUID>,
        labels: Vec<LabelRef>,
    },
    OptinRequested {
        optin: OptInRef,
        channel: ChannelRef,
        urn: URN,
    },
    DialWait {
        urn: URN,
        dial_limit_seconds: i64,
        call_limit_seconds: i64,
        expires_on: Option<DateTime<Utc>>,
    },
    DialEnded {
        status: DialStatus,
        duration: i32,
    },
    WaitTimedOut {},
    Error {
        text: String,
    },
    Failure {
        text: String,
    },
    EnvironmentRefreshed {},
    /// Any event type this build doesn't know about.
    #[serde(other)]
    Unknown,
}

impl EventKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::MsgCreated { .. } => "msg_created",
            Self::MsgReceived { .. } => "msg_received",
            Self::MsgWait { .. } => "msg_wait",
            Self::MsgDeleted { .. } => "msg_deleted",
            Self::IvrCreated { .. } => "ivr_created",
            Self::AirtimeTransferred { .. } => "airtime_transferred",
            Self::ContactFieldChanged { .. } => "contact_field_changed",
            Self::ContactGroupsChanged { .. } => "contact_groups_changed",
            Self::ContactLanguageChanged { .. } => "contact_language_changed",
            Self::ContactLastSeenChanged { .. } => "contact_last_seen_changed",
            Self::ContactNameChanged { .. } => "contact_name_changed",
            Self::ContactStatusChanged { .. } => "contact_status_changed",
            Self::ContactUrnsChanged { .. } => "contact_urns_changed",
            Self::RunStarted { .. } => "run_started",
            Self::RunEnded { .. } => "run_ended",
            Self::RunResultChanged { .. } => "run_result_changed",
            Self::SprintEnded {} => "sprint_ended",
            Self::SessionInterrupted { .. } => "session_interrupted",
            Self::ContactInterrupted {} => "contact_interrupted",
            Self::TicketOpened { .. } => "ticket_opened",
            Self::TicketClosed { .. } => "ticket_closed",
            Self::TicketReopened { .. } => "ticket_reopened",
            Self::TicketAssigneeChanged { .. } => "ticket_assignee_changed",
            Self::TicketTopicChanged { .. } => "ticket_topic_changed",
            Self::TicketNoteAdded { .. } => "ticket_note_added",
            Self::WebhookCalled { .. } => "webhook_called",
            Self::Warning { .. } => "warning",
            Self::BroadcastCreated { .. } => "broadcast_created",
            Self::InputLabelsAdded { .. } => "input_labels_added",
            Self::OptinRequested { .. } => "optin_requested",
            Self::DialWait { .. } => "dial_wait",
            Self::DialEnded { .. } => "dial_ended",
            Self::WaitTimedOut {} => "wait_timed_out",
            Self::Error { .. } => "error",
            Self::Failure { .. } => "failure",
            Self::EnvironmentRefreshed {} => "environment_refreshed",
            Self::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_json_is_flat_and_tagged() {
        let event = Event::new(EventKind::ContactLanguageChanged {
            language: "spa".to_string(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "contact_language_changed");
        assert_eq!(json["language"], "spa");

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.type_name(), "contact_language_changed");
    }

    #[test]
    fn unrecognized_event_type_decodes_as_unknown() {
        let event: Event = serde_json::from_value(serde_json::json!({
            "uuid": "0191fa3c-4c6a-7e1d-a1b3-0b6f1c0ef1e2",
            "created_on": "2025-01-01T00:00:00Z",
            "type": "service_called",
            "service": "classifier"
        }))
        .unwrap();
        assert_eq!(event.kind, EventKind::Unknown);
        assert_eq!(event.type_name(), "unknown");
    }
}
