use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    BroadcastID, ChannelID, ContactID, FlowID, MsgID, MsgUUID, OptInID, OrgID, TicketID, URNID,
    UserID,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgDirection {
    In,
    Out,
}

impl MsgDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in" | "I" => Some(Self::In),
            "out" | "O" => Some(Self::Out),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgStatus {
    Pending,
    Handled,
    Initializing,
    Queued,
    Wired,
    Sent,
    Delivered,
    Read,
    Errored,
    Failed,
}

impl MsgStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Handled => "handled",
            Self::Initializing => "initializing",
            Self::Queued => "queued",
            Self::Wired => "wired",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Errored => "errored",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" | "P" => Some(Self::Pending),
            "handled" | "H" => Some(Self::Handled),
            "initializing" | "I" => Some(Self::Initializing),
            "queued" | "Q" => Some(Self::Queued),
            "wired" | "W" => Some(Self::Wired),
            "sent" | "S" => Some(Self::Sent),
            "delivered" | "D" => Some(Self::Delivered),
            "read" | "R" => Some(Self::Read),
            "errored" | "E" => Some(Self::Errored),
            "failed" | "F" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgVisibility {
    Visible,
    Archived,
    Deleted,
    DeletedBySender,
}

impl MsgVisibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Visible => "visible",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
            Self::DeletedBySender => "deleted_by_sender",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "visible" | "V" => Some(Self::Visible),
            "archived" | "A" => Some(Self::Archived),
            "deleted" | "D" => Some(Self::Deleted),
            "deleted_by_sender" | "X" => Some(Self::DeletedBySender),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    Text,
    Voice,
    Optin,
}

impl MsgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Voice => "voice",
            Self::Optin => "optin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" | "T" => Some(Self::Text),
            "voice" | "V" => Some(Self::Voice),
            "optin" | "O" => Some(Self::Optin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Msg {
    pub id: MsgID,
    pub uuid: MsgUUID,
    pub org_id: OrgID,
    pub channel_id: Option<ChannelID>,
    pub contact_id: ContactID,
    pub contact_urn_id: Option<URNID>,
    pub direction: MsgDirection,
    pub status: MsgStatus,
    pub visibility: MsgVisibility,
    pub msg_type: MsgType,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub quick_replies: Vec<String>,
    pub locale: Option<String>,
    pub flow_id: Option<FlowID>,
    pub ticket_id: Option<TicketID>,
    pub broadcast_id: Option<BroadcastID>,
    pub optin_id: Option<OptInID>,
    pub created_by_id: Option<UserID>,
    pub external_id: Option<String>,
    pub high_priority: bool,
    pub error_count: i32,
    pub failed_reason: Option<String>,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
    pub sent_on: Option<DateTime<Utc>>,
}

/// Reason an outgoing message was created as failed rather than queued.
pub const FAILED_REASON_NO_DESTINATION: &str = "no_destination";
pub const FAILED_REASON_CONTACT_STATUS: &str = "contact_status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpLogType {
    WebhookCalled,
    AirtimeTransferred,
    IvrCallRequested,
}

impl HttpLogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebhookCalled => "webhook_called",
            Self::AirtimeTransferred => "airtime_transferred",
            Self::IvrCallRequested => "ivr_call_requested",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpLog {
    pub org_id: OrgID,
    pub log_type: HttpLogType,
    pub flow_id: Option<FlowID>,
    pub url: String,
    pub status_code: i32,
    pub request: String,
    pub response: String,
    pub is_error: bool,
    pub elapsed_ms: i64,
    pub retries: i32,
    pub created_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AirtimeTransfer {
    pub org_id: OrgID,
    pub contact_id: ContactID,
    pub external_id: Option<String>,
    pub status: String,
    pub sender: Option<String>,
    pub recipient: String,
    pub currency: String,
    pub desired_amount: f64,
    pub actual_amount: f64,
    pub created_on: DateTime<Utc>,
}

/// A per-flow counter increment, summed by scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowActivityCount {
    pub flow_id: FlowID,
    pub scope: String,
    pub count: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub org_id: OrgID,
    pub notification_type: String,
    pub scope: String,
    pub user_id: UserID,
    pub ticket_id: Option<TicketID>,
    pub incident_id: Option<crate::IncidentID>,
    pub created_on: DateTime<Utc>,
}

pub const NOTIFICATION_TICKETS_ACTIVITY: &str = "tickets:activity";
pub const NOTIFICATION_TICKETS_OPENED: &str = "tickets:opened";
pub const NOTIFICATION_INCIDENT_STARTED: &str = "incident:started";
