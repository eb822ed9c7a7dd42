use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ContactID, EventUUID, FlowID, OrgID, TicketID, TicketUUID, TopicID, UserID};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    Closed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" | "O" => Some(Self::Open),
            "closed" | "C" => Some(Self::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketID,
    pub uuid: TicketUUID,
    pub org_id: OrgID,
    pub contact_id: ContactID,
    pub topic_id: Option<TopicID>,
    pub assignee_id: Option<UserID>,
    pub status: TicketStatus,
    pub opened_in_flow_id: Option<FlowID>,
    pub opened_by_id: Option<UserID>,
    pub opened_on: DateTime<Utc>,
    pub closed_on: Option<DateTime<Utc>>,
    pub last_activity_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketEventType {
    Opened,
    Assigned,
    NoteAdded,
    TopicChanged,
    Closed,
    Reopened,
}

impl TicketEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Assigned => "assigned",
            Self::NoteAdded => "note_added",
            Self::TopicChanged => "topic_changed",
            Self::Closed => "closed",
            Self::Reopened => "reopened",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "opened" => Some(Self::Opened),
            "assigned" => Some(Self::Assigned),
            "note_added" => Some(Self::NoteAdded),
            "topic_changed" => Some(Self::TopicChanged),
            "closed" => Some(Self::Closed),
            "reopened" => Some(Self::Reopened),
            _ => None,
        }
    }
}

/// A change to a ticket, keyed by the UUID of the event that produced it so
/// re-delivered tasks write each change once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketEvent {
    pub uuid: EventUUID,
    pub org_id: OrgID,
    pub contact_id: ContactID,
    pub ticket_id: TicketID,
    pub event_type: TicketEventType,
    pub note: Option<String>,
    pub topic_id: Option<TopicID>,
    pub assignee_id: Option<UserID>,
    pub created_by_id: Option<UserID>,
    pub created_on: DateTime<Utc>,
}
