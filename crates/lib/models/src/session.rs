use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CallID, ContactID, FlowID, FlowType, FlowUUID, OrgID, RunUUID, SessionUUID, SprintUUID};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    Completed,
    Interrupted,
    Failed,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" | "W" => Some(Self::Waiting),
            "completed" | "C" => Some(Self::Completed),
            "interrupted" | "I" => Some(Self::Interrupted),
            "failed" | "F" => Some(Self::Failed),
            "expired" | "X" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Waiting)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted session. `output` holds the serialized engine session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub uuid: SessionUUID,
    pub org_id: OrgID,
    pub contact_id: ContactID,
    pub session_type: FlowType,
    pub status: SessionStatus,
    pub current_flow_uuid: Option<FlowUUID>,
    pub last_sprint_uuid: Option<SprintUUID>,
    pub output: serde_json::Value,
    pub call_id: Option<CallID>,
    pub created_on: DateTime<Utc>,
    pub ended_on: Option<DateTime<Utc>>,
}

impl Session {
    /// Move a waiting session to a terminal status. Returns false, leaving the
    /// session untouched, if it has already ended.
    pub fn end(&mut self, status: SessionStatus, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.ended_on = Some(now);
        self.current_flow_uuid = None;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    Waiting,
    Completed,
    Interrupted,
    Expired,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "waiting" => Some(Self::Waiting),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "expired" => Some(Self::Expired),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_ended(&self) -> bool {
        !matches!(self, Self::Active | Self::Waiting)
    }
}

impl From<SessionStatus> for RunStatus {
    fn from(status: SessionStatus) -> Self {
        match status {
            SessionStatus::Waiting => Self::Waiting,
            SessionStatus::Completed => Self::Completed,
            SessionStatus::Interrupted => Self::Interrupted,
            SessionStatus::Failed => Self::Failed,
            SessionStatus::Expired => Self::Expired,
        }
    }
}

/// Row form of an engine run, written when a sprint ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRun {
    pub uuid: RunUUID,
    pub org_id: OrgID,
    pub contact_id: ContactID,
    pub flow_id: FlowID,
    pub session_uuid: SessionUUID,
    pub status: RunStatus,
    pub responded: bool,
    pub results: serde_json::Value,
    pub path_nodes: Vec<crate::NodeUUID>,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
    pub exited_on: Option<DateTime<Utc>>,
}
