use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ContactID, ContactURN, ContactUUID, FlowID, GroupID, OrgID, SessionUUID, TicketID};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    Active,
    Blocked,
    Stopped,
    Archived,
}

impl ContactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Blocked => "blocked",
            Self::Stopped => "stopped",
            Self::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" | "A" => Some(Self::Active),
            "blocked" | "B" => Some(Self::Blocked),
            "stopped" | "S" => Some(Self::Stopped),
            "archived" | "V" => Some(Self::Archived),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A contact as persisted, with its URNs, group memberships and field values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactID,
    pub uuid: ContactUUID,
    pub org_id: OrgID,
    pub name: Option<String>,
    pub language: Option<String>,
    pub status: ContactStatus,
    pub timezone: Option<String>,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
    pub last_seen_on: Option<DateTime<Utc>>,
    pub current_session_uuid: Option<SessionUUID>,
    pub current_flow_id: Option<FlowID>,
    /// Ordered highest priority first.
    pub urns: Vec<ContactURN>,
    pub group_ids: Vec<GroupID>,
    /// Keyed by field key.
    pub fields: BTreeMap<String, crate::FieldValue>,
    pub open_ticket_ids: Vec<TicketID>,
}

impl Contact {
    pub fn is_waiting(&self) -> bool {
        self.current_session_uuid.is_some()
    }

    pub fn in_group(&self, group_id: GroupID) -> bool {
        self.group_ids.contains(&group_id)
    }

    pub fn preferred_urn(&self) -> Option<&ContactURN> {
        self.urns.first()
    }
}
