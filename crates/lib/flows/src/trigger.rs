use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use mailroom_models::{CampaignUUID, ChannelEventType, PointUUID, TicketUUID};

use crate::{ChannelRef, DialStatus, FlowRef, MsgIn, OptInRef, UserRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptInEvent {
    Started,
    Stopped,
}

/// What started a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Manual {
        flow: FlowRef,
        params: Option<serde_json::Value>,
        user: Option<UserRef>,
    },
    Msg {
        flow: FlowRef,
        msg: MsgIn,
        keyword: Option<String>,
    },
    Channel {
        flow: FlowRef,
        event: ChannelEventType,
        channel: ChannelRef,
        #[serde(default)]
        extra: BTreeMap<String, String>,
    },
    Campaign {
        flow: FlowRef,
        campaign: CampaignUUID,
        point: PointUUID,
    },
    Ticket {
        flow: FlowRef,
        ticket_uuid: TicketUUID,
    },
    OptIn {
        flow: FlowRef,
        optin: OptInRef,
        event: OptInEvent,
    },
}

impl Trigger {
    pub fn flow(&self) -> &FlowRef {
        match self {
            Self::Manual { flow, .. }
            | Self::Msg { flow, .. }
            | Self::Channel { flow, .. }
            | Self::Campaign { flow, .. }
            | Self::Ticket { flow, .. }
            | Self::OptIn { flow, .. } => flow,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Manual { .. } => "manual",
            Self::Msg { .. } => "msg",
            Self::Channel { .. } => "channel",
            Self::Campaign { .. } => "campaign",
            Self::Ticket { .. } => "ticket",
            Self::OptIn { .. } => "optin",
        }
    }
}

/// What a waiting session is resumed with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resume {
    Msg { msg: MsgIn },
    Dial { status: DialStatus, duration: i32 },
    WaitExpiration {},
    WaitTimeout {},
    SessionExpiration {},
}

impl Resume {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Msg { .. } => "msg",
            Self::Dial { .. } => "dial",
            Self::WaitExpiration {} => "wait_expiration",
            Self::WaitTimeout {} => "wait_timeout",
            Self::SessionExpiration {} => "session_expiration",
        }
    }
}
