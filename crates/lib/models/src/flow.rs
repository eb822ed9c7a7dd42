use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{FlowID, FlowUUID, NodeUUID, OrgID};

/// Default wait between IVR call retries when the flow does not configure one.
pub const DEFAULT_IVR_RETRY_WAIT: Duration = Duration::from_secs(60 * 60);

/// Node UI types whose operand is recorded alongside recent contacts.
pub const RECENT_CONTACT_UI_TYPES: &[&str] = &[
    "wait_for_response",
    "split_by_expression",
    "split_by_contact_field",
    "split_by_run_result",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    Messaging,
    MessagingBackground,
    Voice,
}

impl FlowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Messaging => "messaging",
            Self::MessagingBackground => "messaging_background",
            Self::Voice => "voice",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "messaging" | "M" => Some(Self::Messaging),
            "messaging_background" | "B" => Some(Self::MessagingBackground),
            "voice" | "V" => Some(Self::Voice),
            _ => None,
        }
    }

    /// Background flows never wait so they never take over a contact's current session.
    pub fn is_interactive(&self) -> bool {
        !matches!(self, Self::MessagingBackground)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowID,
    pub uuid: FlowUUID,
    pub org_id: OrgID,
    pub name: String,
    pub flow_type: FlowType,
    /// The engine-level definition, opaque to the core except for `_ui` metadata.
    pub definition: serde_json::Value,
    pub ignore_triggers: bool,
    /// Minutes to wait before retrying a failed IVR call, negative disables retries.
    pub ivr_retry_minutes: Option<i64>,
    pub is_active: bool,
}

impl Flow {
    /// Retry wait for errored calls, `None` when retries are disabled.
    pub fn ivr_retry_wait(&self) -> Option<Duration> {
        match self.ivr_retry_minutes {
            None => Some(DEFAULT_IVR_RETRY_WAIT),
            Some(minutes) if minutes < 0 => None,
            Some(minutes) => Some(Duration::from_secs(minutes as u64 * 60)),
        }
    }

    /// Map of node UUID to the UI type recorded by the editor.
    pub fn node_ui_types(&self) -> HashMap<NodeUUID, String> {
        let mut types = HashMap::new();
        let Some(nodes) = self
            .definition
            .get("_ui")
            .and_then(|ui| ui.get("nodes"))
            .and_then(|nodes| nodes.as_object())
        else {
            return types;
        };
        for (uuid, node) in nodes {
            let (Ok(uuid), Some(ui_type)) = (
                uuid.parse::<NodeUUID>(),
                node.get("type").and_then(|t| t.as_str()),
            ) else {
                continue;
            };
            types.insert(uuid, ui_type.to_string());
        }
        types
    }

    /// Elapsed time above which a webhook call from the given node is unhealthy.
    pub fn webhook_healthy_threshold(&self, node: NodeUUID) -> Option<Duration> {
        self.definition
            .get("_ui")
            .and_then(|ui| ui.get("nodes"))
            .and_then(|nodes| nodes.get(node.to_string()))
            .and_then(|n| n.get("config"))
            .and_then(|c| c.get("healthy_response_ms"))
            .and_then(|ms| ms.as_u64())
            .map(Duration::from_millis)
    }
}
