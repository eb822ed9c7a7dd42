use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{ChannelID, ContactID, URNID};

pub const TEL_SCHEME: &str = "tel";
pub const FACEBOOK_SCHEME: &str = "facebook";
pub const TELEGRAM_SCHEME: &str = "telegram";
pub const WHATSAPP_SCHEME: &str = "whatsapp";
pub const EMAIL_SCHEME: &str = "mailto";
pub const EXTERNAL_SCHEME: &str = "ext";
pub const WEBCHAT_SCHEME: &str = "webchat";

const KNOWN_SCHEMES: &[&str] = &[
    TEL_SCHEME,
    FACEBOOK_SCHEME,
    TELEGRAM_SCHEME,
    WHATSAPP_SCHEME,
    EMAIL_SCHEME,
    EXTERNAL_SCHEME,
    WEBCHAT_SCHEME,
    "instagram",
    "line",
    "viber",
    "vk",
    "twitterid",
    "discord",
    "slack",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum URNError {
    #[error("URN '{0}' has no scheme")]
    MissingScheme(String),
    #[error("unknown URN scheme '{0}'")]
    UnknownScheme(String),
    #[error("URN '{0}' has an empty path")]
    EmptyPath(String),
}

/// A universal recipient name: `scheme:path[#display]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct URN {
    scheme: String,
    path: String,
    display: Option<String>,
}

impl URN {
    pub fn new(scheme: &str, path: &str, display: Option<&str>) -> Result<Self, URNError> {
        let scheme = scheme.to_ascii_lowercase();
        if !KNOWN_SCHEMES.contains(&scheme.as_str()) {
            return Err(URNError::UnknownScheme(scheme));
        }
        let path = normalize_path(&scheme, path);
        if path.is_empty() {
            return Err(URNError::EmptyPath(format!("{scheme}:")));
        }
        Ok(Self {
            scheme,
            path,
            display: display.filter(|d| !d.is_empty()).map(ToString::to_string),
        })
    }

    pub fn parse(raw: &str) -> Result<Self, URNError> {
        let (scheme, rest) = raw
            .split_once(':')
            .ok_or_else(|| URNError::MissingScheme(raw.to_string()))?;
        let (path, display) = match rest.split_once('#') {
            Some((path, display)) => (path, Some(display)),
            None => (rest, None),
        };
        Self::new(scheme, path, display)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn display(&self) -> Option<&str> {
        self.display.as_deref()
    }

    /// Canonical form used for uniqueness within an org: scheme and path only.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.scheme, self.path)
    }
}

fn normalize_path(scheme: &str, path: &str) -> String {
    let path = path.trim();
    match scheme {
        TEL_SCHEME => path
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '+')
            .collect(),
        EMAIL_SCHEME => path.to_lowercase(),
        _ => path.to_string(),
    }
}

impl fmt::Display for URN {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display {
            Some(display) => write!(f, "{}:{}#{}", self.scheme, self.path, display),
            None => write!(f, "{}:{}", self.scheme, self.path),
        }
    }
}

impl TryFrom<String> for URN {
    type Error = URNError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<URN> for String {
    fn from(value: URN) -> Self {
        value.to_string()
    }
}

/// A URN row owned by a contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactURN {
    pub id: URNID,
    pub contact_id: Option<ContactID>,
    pub urn: URN,
    pub priority: i32,
    pub channel_id: Option<ChannelID>,
    #[serde(default)]
    pub auth_tokens: BTreeMap<String, String>,
}

impl ContactURN {
    pub fn identity(&self) -> String {
        self.urn.identity()
    }
}

/// Sort URNs by descending priority, keeping insertion order for ties.
pub fn sort_by_priority(urns: &mut [ContactURN]) {
    urns.sort_by(|a, b| b.priority.cmp(&a.priority));
}
