use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::{
    FieldID, FieldUUID, GroupID, GroupUUID, IncidentID, LabelID, LabelUUID, OptInID, OptInUUID,
    OrgID, OrgUUID, TopicID, TopicUUID, UserID, UserUUID,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Org {
    pub id: OrgID,
    pub uuid: OrgUUID,
    pub name: String,
    pub timezone: String,
    pub language: String,
    pub is_active: bool,
    pub is_suspended: bool,
}

impl Org {
    /// The org timezone, falling back to UTC for unknown names.
    pub fn tz(&self) -> Tz {
        parse_timezone(&self.timezone).unwrap_or(Tz::UTC)
    }
}

pub fn parse_timezone(name: &str) -> Option<Tz> {
    name.parse::<Tz>().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    Manual,
    Smart,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupID,
    pub uuid: GroupUUID,
    pub name: String,
    pub group_type: GroupType,
    /// Contact query for smart groups.
    pub query: Option<String>,
}

impl Group {
    pub fn is_smart(&self) -> bool {
        self.group_type == GroupType::Smart
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValueType {
    Text,
    Number,
    Datetime,
    State,
    District,
    Ward,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub id: FieldID,
    pub uuid: FieldUUID,
    pub key: String,
    pub name: String,
    pub value_type: FieldValueType,
    /// System fields (`created_on`, `last_seen_on`) are not stored in the fields map.
    pub is_system: bool,
}

/// A typed contact field value. `text` is always set; parsed forms are set
/// when the text parses as that type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime: Option<DateTime<Utc>>,
}

impl FieldValue {
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        Self {
            text: trimmed.to_string(),
            number: trimmed.parse::<f64>().ok().filter(|n| n.is_finite()),
            datetime: DateTime::parse_from_rfc3339(trimmed)
                .ok()
                .map(|d| d.with_timezone(&Utc)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub id: LabelID,
    pub uuid: LabelUUID,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptIn {
    pub id: OptInID,
    pub uuid: OptInUUID,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub id: TopicID,
    pub uuid: TopicUUID,
    pub name: String,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserID,
    pub uuid: UserUUID,
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLM {
    pub id: i64,
    pub uuid: uuid::Uuid,
    pub name: String,
    pub llm_type: String,
}

pub const INCIDENT_WEBHOOKS_UNHEALTHY: &str = "webhooks:unhealthy";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentID,
    pub org_id: OrgID,
    pub incident_type: String,
    pub scope: String,
    pub started_on: DateTime<Utc>,
    pub ended_on: Option<DateTime<Utc>>,
}

impl Incident {
    /// KV key of the set of nodes implicated in this incident.
    pub fn nodes_key(&self) -> String {
        format!("incident:{}:nodes", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_value_parse_happy_path() {
        let value = FieldValue::parse(" 42 ");
        assert_eq!(value.text, "42");
        assert_eq!(value.number, Some(42.0));
        assert_eq!(value.datetime, None);

        let value = FieldValue::parse("2025-05-04T12:30:00Z");
        assert!(value.datetime.is_some());
        assert_eq!(value.number, None);
    }

    #[test]
    fn org_tz_falls_back_to_utc() {
        let org = Org {
            id: OrgID(1),
            uuid: OrgUUID::new(),
            name: "Nyaruka".to_string(),
            timezone: "Not/AZone".to_string(),
            language: "eng".to_string(),
            is_active: true,
            is_suspended: false,
        };
        assert_eq!(org.tz(), Tz::UTC);
    }
}
