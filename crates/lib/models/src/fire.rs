use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ContactID, FireID, OrgID, PointID, SessionUUID, SprintUUID};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FireType {
    Campaign,
    WaitExpires,
    WaitTimeout,
    SessionExpires,
}

impl FireType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Campaign => "campaign",
            Self::WaitExpires => "wait_expires",
            Self::WaitTimeout => "wait_timeout",
            Self::SessionExpires => "session_expires",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "campaign" | "C" => Some(Self::Campaign),
            "wait_expires" | "E" => Some(Self::WaitExpires),
            "wait_timeout" | "T" => Some(Self::WaitTimeout),
            "session_expires" | "S" => Some(Self::SessionExpires),
            _ => None,
        }
    }

    /// Letter prefixed to session-timer scopes.
    pub fn letter(&self) -> char {
        match self {
            Self::Campaign => 'C',
            Self::WaitExpires => 'E',
            Self::WaitTimeout => 'T',
            Self::SessionExpires => 'S',
        }
    }

    pub fn is_session_timer(&self) -> bool {
        !matches!(self, Self::Campaign)
    }
}

pub const SESSION_FIRE_TYPES: [FireType; 3] = [
    FireType::WaitExpires,
    FireType::WaitTimeout,
    FireType::SessionExpires,
];

/// Scope of a campaign fire: `{point_id}:{fire_version}`.
pub fn campaign_scope(point_id: PointID, fire_version: i32) -> String {
    format!("{point_id}:{fire_version}")
}

/// Parse a campaign scope, also accepting the `C/` prefixed form.
pub fn parse_campaign_scope(scope: &str) -> Option<(PointID, i32)> {
    let scope = scope.strip_prefix("C/").unwrap_or(scope);
    let (point, version) = scope.split_once(':')?;
    Some((PointID(point.parse().ok()?), version.parse().ok()?))
}

/// Scope of a session timer fire: `{letter}:{session_uuid}`.
pub fn session_scope(fire_type: FireType, session_uuid: SessionUUID) -> String {
    format!("{}:{session_uuid}", fire_type.letter())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactFire {
    pub id: FireID,
    pub org_id: OrgID,
    pub contact_id: ContactID,
    pub fire_type: FireType,
    pub scope: String,
    pub fire_on: DateTime<Utc>,
    pub session_uuid: Option<SessionUUID>,
    pub sprint_uuid: Option<SprintUUID>,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ContactFire {
    pub fn new_campaign(
        org_id: OrgID,
        contact_id: ContactID,
        point_id: PointID,
        fire_version: i32,
        fire_on: DateTime<Utc>,
    ) -> Self {
        Self {
            id: FireID(0),
            org_id,
            contact_id,
            fire_type: FireType::Campaign,
            scope: campaign_scope(point_id, fire_version),
            fire_on,
            session_uuid: None,
            sprint_uuid: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn new_session_timer(
        org_id: OrgID,
        contact_id: ContactID,
        fire_type: FireType,
        session_uuid: SessionUUID,
        sprint_uuid: SprintUUID,
        fire_on: DateTime<Utc>,
    ) -> Self {
        Self {
            id: FireID(0),
            org_id,
            contact_id,
            fire_type,
            scope: session_scope(fire_type, session_uuid),
            fire_on,
            session_uuid: Some(session_uuid),
            sprint_uuid: Some(sprint_uuid),
            extra: BTreeMap::new(),
        }
    }

    /// Point and version for campaign fires.
    pub fn campaign_point(&self) -> Option<(PointID, i32)> {
        match self.fire_type {
            FireType::Campaign => parse_campaign_scope(&self.scope),
            _ => None,
        }
    }
}
