use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mailroom_models::{BroadcastTranslation, ExitUUID, NodeUUID, URN};

use crate::{ContactRef, FieldRef, GroupRef, LabelRef, TopicRef, UserRef, WaitHint, WaitKind};

/// The subset of a flow definition the basic engine executes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Definition {
    #[serde(default)]
    pub nodes: Vec<Node>,
    pub expire_after_minutes: Option<i64>,
    /// Language → action or category UUID → property → translated values.
    #[serde(default)]
    pub localization: BTreeMap<String, BTreeMap<Uuid, BTreeMap<String, Vec<String>>>>,
}

impl Definition {
    pub fn node(&self, uuid: NodeUUID) -> Option<&Node> {
        self.nodes.iter().find(|n| n.uuid == uuid)
    }

    /// Translated value of an item property, if the language has one.
    pub fn localized(&self, language: Option<&str>, item: Uuid, property: &str) -> Option<&[String]> {
        self.localization
            .get(language?)?
            .get(&item)?
            .get(property)
            .map(Vec::as_slice)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub uuid: NodeUUID,
    #[serde(default)]
    pub actions: Vec<Action>,
    pub router: Option<Router>,
    #[serde(default)]
    pub exits: Vec<Exit>,
}

impl Node {
    pub fn exit(&self, uuid: ExitUUID) -> Option<&Exit> {
        self.exits.iter().find(|e| e.uuid == uuid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exit {
    pub uuid: ExitUUID,
    pub destination_uuid: Option<NodeUUID>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub uuid: Uuid,
    #[serde(flatten)]
    pub kind: ActionKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    SendMsg {
        text: String,
        #[serde(default)]
        attachments: Vec<String>,
        #[serde(default)]
        quick_replies: Vec<String>,
    },
    SayMsg {
        text: String,
    },
    SetContactField {
        field: FieldRef,
        value: String,
    },
    SetContactName {
        name: String,
    },
    SetContactLanguage {
        language: String,
    },
    AddContactGroups {
        groups: Vec<GroupRef>,
    },
    RemoveContactGroups {
        groups: Vec<GroupRef>,
    },
    SetRunResult {
        name: String,
        value: String,
        category: Option<String>,
    },
    OpenTicket {
        topic: Option<TopicRef>,
        assignee: Option<UserRef>,
        note: Option<String>,
    },
    AddInputLabels {
        labels: Vec<LabelRef>,
    },
    SendBroadcast {
        translations: BTreeMap<String, BroadcastTranslation>,
        base_language: String,
        #[serde(default)]
        groups: Vec<GroupRef>,
        #[serde(default)]
        contacts: Vec<ContactRef>,
        #[serde(default)]
        urns: Vec<URN>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Router {
    #[serde(default = "default_operand")]
    pub operand: String,
    pub wait: Option<RouterWait>,
    pub result_name: Option<String>,
    #[serde(default)]
    pub cases: Vec<Case>,
    pub categories: Vec<Category>,
    pub default_category_uuid: Option<Uuid>,
}

fn default_operand() -> String {
    "@input.text".to_string()
}

impl Router {
    pub fn category(&self, uuid: Uuid) -> Option<&Category> {
        self.categories.iter().find(|c| c.uuid == uuid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterWait {
    #[serde(rename = "type", default = "default_wait_kind")]
    pub kind: WaitKind,
    pub timeout_seconds: Option<i64>,
    pub timeout_category_uuid: Option<Uuid>,
    /// Number dialed by dial waits.
    pub phone: Option<String>,
    pub hint: Option<WaitHint>,
}

fn default_wait_kind() -> WaitKind {
    WaitKind::Msg
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub uuid: Uuid,
    #[serde(rename = "type")]
    pub test: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    pub category_uuid: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub uuid: Uuid,
    pub name: String,
    pub exit_uuid: ExitUUID,
}
