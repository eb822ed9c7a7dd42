use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mailroom_models::{
    ChannelUUID, ContactID, ContactStatus, ContactUUID, FieldValue, Flow, FlowUUID, GroupUUID,
    LabelUUID, OptInUUID, TicketStatus, TicketUUID, TopicUUID, URN, UserUUID,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRef {
    pub uuid: FlowUUID,
    pub name: String,
}

impl From<&Flow> for FlowRef {
    fn from(flow: &Flow) -> Self {
        FlowRef {
            uuid: flow.uuid,
            name: flow.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRef {
    pub uuid: GroupUUID,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRef {
    pub key: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRef {
    pub uuid: TopicUUID,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub uuid: UserUUID,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRef {
    pub uuid: LabelUUID,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptInRef {
    pub uuid: OptInUUID,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    pub uuid: ChannelUUID,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRef {
    pub uuid: ContactUUID,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowTicket {
    pub uuid: TicketUUID,
    pub status: TicketStatus,
    pub topic: Option<TopicRef>,
    pub assignee: Option<UserRef>,
}

/// The engine's view of a contact. Built from the persisted contact and the
/// org assets, mutated by modifiers and sprints, and diffed through events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowContact {
    pub id: ContactID,
    pub uuid: ContactUUID,
    pub name: Option<String>,
    pub language: Option<String>,
    pub status: ContactStatus,
    pub timezone: Option<String>,
    pub created_on: DateTime<Utc>,
    pub last_seen_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub urns: Vec<URN>,
    #[serde(default)]
    pub groups: Vec<GroupRef>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(default)]
    pub tickets: Vec<FlowTicket>,
}

impl FlowContact {
    pub fn in_group(&self, uuid: GroupUUID) -> bool {
        self.groups.iter().any(|g| g.uuid == uuid)
    }

    pub fn preferred_urn(&self) -> Option<&URN> {
        self.urns.first()
    }

    pub fn ticket_mut(&mut self, uuid: TicketUUID) -> Option<&mut FlowTicket> {
        self.tickets.iter_mut().find(|t| t.uuid == uuid)
    }

    /// Text value of a field or system property, as used by queries and campaigns.
    pub fn value_of(&self, key: &str) -> Option<String> {
        match key {
            "name" => self.name.clone(),
            "language" => self.language.clone(),
            "status" => Some(self.status.as_str().to_string()),
            "uuid" => Some(self.uuid.to_string()),
            "id" => Some(self.id.to_string()),
            "created_on" => Some(self.created_on.to_rfc3339()),
            "last_seen_on" => self.last_seen_on.map(|t| t.to_rfc3339()),
            _ => self.fields.get(key).map(|v| v.text.clone()),
        }
    }

    /// Datetime value of a field or system property, used for campaign scheduling.
    pub fn datetime_of(&self, key: &str) -> Option<DateTime<Utc>> {
        match key {
            "created_on" => Some(self.created_on),
            "last_seen_on" => self.last_seen_on,
            _ => self.fields.get(key).and_then(|v| v.datetime),
        }
    }
}
