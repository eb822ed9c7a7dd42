use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ChannelID, ChannelUUID, OrgID};

/// Config key naming the maximum concurrent outbound calls for voice channels.
pub const CONFIG_MAX_CONCURRENT_CALLS: &str = "max_concurrent_calls";
/// Config key naming the number of seconds before an unanswered call is abandoned.
pub const CONFIG_CALL_TIMEOUT: &str = "call_timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    Send,
    Receive,
    Call,
    Answer,
}

impl ChannelRole {
    pub fn code(&self) -> char {
        match self {
            Self::Send => 'S',
            Self::Receive => 'R',
            Self::Call => 'C',
            Self::Answer => 'A',
        }
    }

    pub fn parse_codes(codes: &str) -> Vec<Self> {
        codes
            .chars()
            .filter_map(|c| match c {
                'S' => Some(Self::Send),
                'R' => Some(Self::Receive),
                'C' => Some(Self::Call),
                'A' => Some(Self::Answer),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelID,
    pub uuid: ChannelUUID,
    pub org_id: OrgID,
    pub name: String,
    /// Channel type code, e.g. `T` (Twilio), `NX` (Vonage), `FBA` (Facebook).
    pub channel_type: String,
    pub address: String,
    pub schemes: Vec<String>,
    pub roles: Vec<ChannelRole>,
    pub config: BTreeMap<String, serde_json::Value>,
    pub features: Vec<String>,
}

impl Channel {
    pub fn has_role(&self, role: ChannelRole) -> bool {
        self.roles.contains(&role)
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn config_int(&self, key: &str) -> Option<i64> {
        self.config.get(key).and_then(|v| match v {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        })
    }

    /// Maximum concurrent outbound calls, if the channel limits them.
    pub fn max_concurrent_calls(&self) -> Option<i64> {
        self.config_int(CONFIG_MAX_CONCURRENT_CALLS).filter(|n| *n > 0)
    }

    pub fn supports_scheme(&self, scheme: &str) -> bool {
        self.schemes.iter().any(|s| s == scheme)
    }
}

/// Events reported by channels about a contact, outside of messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelEventType {
    NewConversation,
    Referral,
    MissedCall,
    IncomingCall,
    OptIn,
    OptOut,
    StopContact,
    WelcomeMessage,
    DeleteContact,
}

impl ChannelEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewConversation => "new_conversation",
            Self::Referral => "referral",
            Self::MissedCall => "missed_call",
            Self::IncomingCall => "incoming_call",
            Self::OptIn => "opt_in",
            Self::OptOut => "opt_out",
            Self::StopContact => "stop_contact",
            Self::WelcomeMessage => "welcome_message",
            Self::DeleteContact => "delete_contact",
        }
    }
}

impl std::fmt::Display for ChannelEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
