use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CallID, CallUUID, ChannelID, ContactID, OrgID, SessionUUID, URNID};

/// Number of times an errored outbound call is retried before it is marked failed.
pub const MAX_CALL_RETRIES: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Pending,
    Wired,
    InProgress,
    Completed,
    Errored,
    Failed,
    Throttled,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Wired => "wired",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Failed => "failed",
            Self::Throttled => "throttled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "wired" => Some(Self::Wired),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "errored" => Some(Self::Errored),
            "failed" => Some(Self::Failed),
            "throttled" => Some(Self::Throttled),
            _ => None,
        }
    }

    /// Whether no more status changes are expected from the provider.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "incoming" | "I" => Some(Self::Incoming),
            "outgoing" | "O" => Some(Self::Outgoing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallError {
    Provider,
    Busy,
    NoAnswer,
    Machine,
}

impl CallError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provider => "provider",
            Self::Busy => "busy",
            Self::NoAnswer => "no_answer",
            Self::Machine => "machine",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "provider" => Some(Self::Provider),
            "busy" => Some(Self::Busy),
            "no_answer" => Some(Self::NoAnswer),
            "machine" => Some(Self::Machine),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub id: CallID,
    pub uuid: CallUUID,
    pub org_id: OrgID,
    pub channel_id: ChannelID,
    pub contact_id: ContactID,
    pub urn_id: URNID,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub external_id: Option<String>,
    pub duration: i32,
    pub error_reason: Option<CallError>,
    pub error_count: i32,
    pub next_attempt: Option<DateTime<Utc>>,
    pub session_uuid: Option<SessionUUID>,
    /// Serialized engine trigger used to start the session once the call connects.
    pub trigger: Option<serde_json::Value>,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    pub ended_on: Option<DateTime<Utc>>,
}

impl Call {
    pub fn new_outgoing(
        org_id: OrgID,
        channel_id: ChannelID,
        contact_id: ContactID,
        urn_id: URNID,
        trigger: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CallID(0),
            uuid: CallUUID::new(),
            org_id,
            channel_id,
            contact_id,
            urn_id,
            direction: CallDirection::Outgoing,
            status: CallStatus::Pending,
            external_id: None,
            duration: 0,
            error_reason: None,
            error_count: 0,
            next_attempt: None,
            session_uuid: None,
            trigger,
            created_on: now,
            modified_on: now,
            started_on: None,
            ended_on: None,
        }
    }

    pub fn mark_wired(&mut self, external_id: &str, now: DateTime<Utc>) {
        self.status = CallStatus::Wired;
        self.external_id = Some(external_id.to_string());
        self.next_attempt = None;
        self.modified_on = now;
    }

    pub fn mark_in_progress(&mut self, now: DateTime<Utc>) {
        self.status = CallStatus::InProgress;
        self.started_on.get_or_insert(now);
        self.modified_on = now;
    }

    pub fn mark_completed(&mut self, duration: i32, now: DateTime<Utc>) {
        self.status = CallStatus::Completed;
        self.duration = duration;
        self.ended_on = Some(now);
        self.modified_on = now;
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>) {
        self.status = CallStatus::Failed;
        self.next_attempt = None;
        self.ended_on = Some(now);
        self.modified_on = now;
    }

    /// Mark the call errored. Outgoing calls with retries left get a next attempt
    /// after `retry_wait`; everything else becomes failed.
    pub fn mark_errored(
        &mut self,
        reason: CallError,
        retry_wait: Option<Duration>,
        now: DateTime<Utc>,
    ) {
        self.error_reason = Some(reason);
        self.modified_on = now;

        let retry = retry_wait.filter(|_| {
            self.direction == CallDirection::Outgoing && self.error_count < MAX_CALL_RETRIES
        });
        match retry.and_then(|wait| chrono::Duration::from_std(wait).ok()) {
            Some(wait) => {
                self.status = CallStatus::Errored;
                self.error_count += 1;
                self.next_attempt = Some(now + wait);
            }
            None => self.mark_failed(now),
        }
    }

    pub fn mark_throttled(&mut self, now: DateTime<Utc>) {
        self.status = CallStatus::Throttled;
        self.next_attempt = Some(now);
        self.modified_on = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call() -> Call {
        Call::new_outgoing(OrgID(1), ChannelID(2), ContactID(3), URNID(4), None, Utc::now())
    }

    #[test]
    fn call_mark_errored_schedules_retry() {
        let mut c = call();
        let now = Utc::now();
        c.mark_errored(CallError::Machine, Some(Duration::from_secs(3600)), now);
        assert_eq!(c.status, CallStatus::Errored);
        assert_eq!(c.error_count, 1);
        assert_eq!(c.next_attempt, Some(now + chrono::Duration::hours(1)));
        assert_eq!(c.error_reason, Some(CallError::Machine));
    }

    #[test]
    fn call_mark_errored_fails_after_max_retries() {
        let mut c = call();
        c.error_count = MAX_CALL_RETRIES;
        c.mark_errored(CallError::NoAnswer, Some(Duration::from_secs(60)), Utc::now());
        assert_eq!(c.status, CallStatus::Failed);
        assert_eq!(c.next_attempt, None);
    }

    #[test]
    fn call_mark_errored_without_retry_wait_fails() {
        let mut c = call();
        c.mark_errored(CallError::Busy, None, Utc::now());
        assert_eq!(c.status, CallStatus::Failed);
    }
}
