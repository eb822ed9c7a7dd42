use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_type {
    ($($(#[$meta:meta])* $name:ident;)+) => {$(
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    )+};
}

macro_rules! uuid_type {
    ($($(#[$meta:meta])* $name:ident;)+) => {$(
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(crate::uuids::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    )+};
}

id_type! {
    OrgID;
    ContactID;
    URNID;
    ChannelID;
    FlowID;
    GroupID;
    FieldID;
    LabelID;
    OptInID;
    TopicID;
    UserID;
    TicketID;
    MsgID;
    CallID;
    CampaignID;
    PointID;
    TriggerID;
    StartID;
    BroadcastID;
    FireID;
    IncidentID;
}

uuid_type! {
    OrgUUID;
    ContactUUID;
    ChannelUUID;
    FlowUUID;
    GroupUUID;
    FieldUUID;
    LabelUUID;
    OptInUUID;
    TopicUUID;
    UserUUID;
    TicketUUID;
    MsgUUID;
    CallUUID;
    CampaignUUID;
    PointUUID;
    SessionUUID;
    SprintUUID;
    RunUUID;
    StepUUID;
    EventUUID;
    NodeUUID;
    ExitUUID;
    StartUUID;
    BroadcastUUID;
}
