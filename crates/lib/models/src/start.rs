use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    BroadcastID, BroadcastUUID, ContactID, FlowID, GroupID, OptInID, OrgID, StartID, StartUUID,
    URN, UserID,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartType {
    Manual,
    Api,
    Trigger,
    Campaign,
    Zapier,
}

impl StartType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Api => "api",
            Self::Trigger => "trigger",
            Self::Campaign => "campaign",
            Self::Zapier => "zapier",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" | "M" => Some(Self::Manual),
            "api" | "A" => Some(Self::Api),
            "trigger" | "F" => Some(Self::Trigger),
            "campaign" | "C" => Some(Self::Campaign),
            "zapier" | "Z" => Some(Self::Zapier),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartStatus {
    Pending,
    Queued,
    Started,
    Completed,
    Failed,
    Interrupted,
}

impl StartStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" | "P" => Some(Self::Pending),
            "queued" | "Q" => Some(Self::Queued),
            "started" | "S" => Some(Self::Started),
            "completed" | "C" => Some(Self::Completed),
            "failed" | "F" => Some(Self::Failed),
            "interrupted" | "I" => Some(Self::Interrupted),
            _ => None,
        }
    }
}

/// Contacts left out when a start or broadcast resolves its recipients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusions {
    #[serde(default)]
    pub non_active: bool,
    #[serde(default)]
    pub in_a_flow: bool,
    #[serde(default)]
    pub started_previously: bool,
    #[serde(default)]
    pub not_seen_since_days: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStart {
    pub id: StartID,
    pub uuid: StartUUID,
    pub org_id: OrgID,
    pub flow_id: FlowID,
    pub start_type: StartType,
    pub status: StartStatus,
    #[serde(default)]
    pub exclusions: Exclusions,
    #[serde(default)]
    pub contact_ids: Vec<ContactID>,
    #[serde(default)]
    pub group_ids: Vec<GroupID>,
    #[serde(default)]
    pub urns: Vec<URN>,
    pub query: Option<String>,
    pub created_by_id: Option<UserID>,
    pub params: Option<serde_json::Value>,
    pub parent_summary: Option<serde_json::Value>,
    pub session_history: Option<serde_json::Value>,
    pub contact_count: i64,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BroadcastTranslation {
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub quick_replies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Broadcast {
    pub id: BroadcastID,
    pub uuid: BroadcastUUID,
    pub org_id: OrgID,
    pub translations: BTreeMap<String, BroadcastTranslation>,
    pub base_language: String,
    pub optin_id: Option<OptInID>,
    #[serde(default)]
    pub contact_ids: Vec<ContactID>,
    #[serde(default)]
    pub group_ids: Vec<GroupID>,
    #[serde(default)]
    pub urns: Vec<URN>,
    pub query: Option<String>,
    #[serde(default)]
    pub exclusions: Exclusions,
    pub created_by_id: Option<UserID>,
    pub created_on: DateTime<Utc>,
}

impl Broadcast {
    /// The translation for a contact language, falling back to the base language.
    pub fn translation_for(&self, language: Option<&str>) -> Option<&BroadcastTranslation> {
        language
            .and_then(|lang| self.translations.get(lang))
            .or_else(|| self.translations.get(&self.base_language))
            .or_else(|| self.translations.values().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_translation_falls_back_to_base_language() {
        let mut translations = BTreeMap::new();
        translations.insert(
            "eng".to_string(),
            BroadcastTranslation {
                text: "Hello".to_string(),
                ..Default::default()
            },
        );
        translations.insert(
            "spa".to_string(),
            BroadcastTranslation {
                text: "Hola".to_string(),
                ..Default::default()
            },
        );
        let bcast = Broadcast {
            id: BroadcastID(1),
            uuid: BroadcastUUID::new(),
            org_id: OrgID(1),
            translations,
            base_language: "eng".to_string(),
            optin_id: None,
            contact_ids: vec![],
            group_ids: vec![],
            urns: vec![],
            query: None,
            exclusions: Exclusions::default(),
            created_by_id: None,
            created_on: Utc::now(),
        };
        assert_eq!(bcast.translation_for(Some("spa")).unwrap().text, "Hola");
        assert_eq!(bcast.translation_for(Some("fra")).unwrap().text, "Hello");
        assert_eq!(bcast.translation_for(None).unwrap().text, "Hello");
    }
}
