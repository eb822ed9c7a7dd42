use serde::{Deserialize, Serialize};

use crate::{ChannelID, FlowID, GroupID, OrgID, TriggerID};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Keyword,
    Catchall,
    NewConversation,
    Referral,
    MissedCall,
    IncomingCall,
    OptIn,
    OptOut,
    TicketClosed,
    Campaign,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::Catchall => "catchall",
            Self::NewConversation => "new_conversation",
            Self::Referral => "referral",
            Self::MissedCall => "missed_call",
            Self::IncomingCall => "incoming_call",
            Self::OptIn => "opt_in",
            Self::OptOut => "opt_out",
            Self::TicketClosed => "ticket_closed",
            Self::Campaign => "campaign",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordMatchType {
    /// Keyword must be the first word of the message.
    FirstWord,
    /// Keyword must be the only word of the message.
    OnlyWord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: TriggerID,
    pub org_id: OrgID,
    pub trigger_type: TriggerType,
    pub flow_id: FlowID,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub match_type: Option<KeywordMatchType>,
    pub channel_id: Option<ChannelID>,
    pub referrer_id: Option<String>,
    #[serde(default)]
    pub include_group_ids: Vec<GroupID>,
    #[serde(default)]
    pub exclude_group_ids: Vec<GroupID>,
}
