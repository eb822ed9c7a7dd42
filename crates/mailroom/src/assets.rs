//! Per-org snapshots of the rows flows run against.
//!
//! A snapshot is immutable. Refreshing produces a new snapshot that shares
//! every section the refresh mask leaves out with the previous one, so all
//! lookups made while handling one scene resolve against the same state.
//! The process-wide [`AssetsCache`] reloads a snapshot once it is older than
//! its TTL.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use mailroom_core_backend::{BackendError, CoreBackend};
use mailroom_flows::{GroupRef, SessionAssets};
use mailroom_models::{
    Campaign, CampaignPoint, Channel, ChannelID, ChannelRole, ChannelUUID, ContactURN, Field,
    Flow, FlowID, FlowUUID, Group, GroupID, GroupUUID, LLM, Label, LabelUUID, OptIn, OptInUUID,
    Org, OrgID, PointID, Topic, TopicUUID, Trigger, User, UserID, UserUUID,
};
use tokio::time::Instant;
use tracing::debug;

bitflags! {
    /// Sections of an [`OrgAssets`] snapshot to reload.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Refresh: u32 {
        const ORG = 1;
        const FLOWS = 1 << 1;
        const FIELDS = 1 << 2;
        const GROUPS = 1 << 3;
        const CHANNELS = 1 << 4;
        const TOPICS = 1 << 5;
        const USERS = 1 << 6;
        const CAMPAIGNS = 1 << 7;
        const TRIGGERS = 1 << 8;
        const LABELS = 1 << 9;
        const OPTINS = 1 << 10;
        const LLMS = 1 << 11;
        const ALL = (1 << 12) - 1;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AssetsError {
    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Backend(BackendError),
}

impl AssetsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<BackendError> for AssetsError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::NotFound(what) => Self::NotFound(what),
            other => Self::Backend(other),
        }
    }
}

pub type AssetsResult<T> = Result<T, AssetsError>;

#[derive(Debug, Clone)]
pub struct OrgAssets {
    org: Arc<Org>,
    flows: Arc<Vec<Flow>>,
    fields: Arc<Vec<Field>>,
    groups: Arc<Vec<Group>>,
    channels: Arc<Vec<Channel>>,
    topics: Arc<Vec<Topic>>,
    users: Arc<Vec<User>>,
    campaigns: Arc<Vec<Campaign>>,
    triggers: Arc<Vec<Trigger>>,
    labels: Arc<Vec<Label>>,
    optins: Arc<Vec<OptIn>>,
    llms: Arc<Vec<LLM>>,
    built_on: DateTime<Utc>,
}

/// Reuse the previous section unless the refresh mask names it.
macro_rules! section {
    ($prev:expr, $refresh:expr, $flag:expr, $field:ident, $load:expr) => {
        match $prev {
            Some(prev) if !$refresh.contains($flag) => prev.$field.clone(),
            _ => Arc::new($load.await?),
        }
    };
}

impl OrgAssets {
    /// Load a snapshot, reusing sections of `prev` that `refresh` doesn't name.
    pub async fn load(
        db: &dyn CoreBackend,
        org_id: OrgID,
        prev: Option<&OrgAssets>,
        refresh: Refresh,
    ) -> AssetsResult<Self> {
        let org = section!(prev, refresh, Refresh::ORG, org, db.load_org(org_id));
        if !org.is_active {
            return Err(AssetsError::NotFound(format!("org {org_id}")));
        }

        let assets = Self {
            flows: section!(prev, refresh, Refresh::FLOWS, flows, db.load_flows(org_id)),
            fields: section!(prev, refresh, Refresh::FIELDS, fields, db.load_fields(org_id)),
            groups: section!(prev, refresh, Refresh::GROUPS, groups, db.load_groups(org_id)),
            channels: section!(prev, refresh, Refresh::CHANNELS, channels, db.load_channels(org_id)),
            topics: section!(prev, refresh, Refresh::TOPICS, topics, db.load_topics(org_id)),
            users: section!(prev, refresh, Refresh::USERS, users, db.load_users(org_id)),
            campaigns: section!(prev, refresh, Refresh::CAMPAIGNS, campaigns, db.load_campaigns(org_id)),
            triggers: section!(prev, refresh, Refresh::TRIGGERS, triggers, db.load_triggers(org_id)),
            labels: section!(prev, refresh, Refresh::LABELS, labels, db.load_labels(org_id)),
            optins: section!(prev, refresh, Refresh::OPTINS, optins, db.load_optins(org_id)),
            llms: section!(prev, refresh, Refresh::LLMS, llms, db.load_llms(org_id)),
            org,
            built_on: Utc::now(),
        };
        debug!(
            org_id = %org_id,
            refresh = ?refresh,
            flows = assets.flows.len(),
            channels = assets.channels.len(),
            "loaded org assets"
        );
        Ok(assets)
    }

    pub fn org(&self) -> &Org {
        &self.org
    }

    pub fn org_id(&self) -> OrgID {
        self.org.id
    }

    pub fn built_on(&self) -> DateTime<Utc> {
        self.built_on
    }

    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    pub fn flow_by_uuid(&self, uuid: FlowUUID) -> Option<&Flow> {
        self.flows.iter().find(|f| f.uuid == uuid && f.is_active)
    }

    pub fn flow_by_id(&self, id: FlowID) -> Option<&Flow> {
        self.flows.iter().find(|f| f.id == id && f.is_active)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field_by_key(&self, key: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.key == key)
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn group_by_uuid(&self, uuid: GroupUUID) -> Option<&Group> {
        self.groups.iter().find(|g| g.uuid == uuid)
    }

    pub fn group_by_id(&self, id: GroupID) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn group_ref(&self, id: GroupID) -> Option<GroupRef> {
        self.group_by_id(id).map(|g| GroupRef {
            uuid: g.uuid,
            name: g.name.clone(),
        })
    }

    pub fn smart_groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter().filter(|g| g.is_smart())
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channel_by_uuid(&self, uuid: ChannelUUID) -> Option<&Channel> {
        self.channels.iter().find(|c| c.uuid == uuid)
    }

    pub fn channel_by_id(&self, id: ChannelID) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == id)
    }

    /// The channel to use for a URN: its affinity channel when that one still
    /// fits, otherwise the first channel with the role that supports the scheme.
    pub fn channel_for_urn(&self, urn: &ContactURN, role: ChannelRole) -> Option<&Channel> {
        let fits = |c: &&Channel| c.has_role(role) && c.supports_scheme(urn.urn.scheme());
        urn.channel_id
            .and_then(|id| self.channel_by_id(id))
            .filter(fits)
            .or_else(|| self.channels.iter().find(fits))
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    pub fn topic_by_uuid(&self, uuid: TopicUUID) -> Option<&Topic> {
        self.topics.iter().find(|t| t.uuid == uuid)
    }

    pub fn default_topic(&self) -> Option<&Topic> {
        self.topics.iter().find(|t| t.is_default)
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn user_by_uuid(&self, uuid: UserUUID) -> Option<&User> {
        self.users.iter().find(|u| u.uuid == uuid)
    }

    pub fn user_by_id(&self, id: UserID) -> Option<&User> {
        self.users.iter().find(|u| u.id == id)
    }

    pub fn campaigns(&self) -> &[Campaign] {
        &self.campaigns
    }

    /// Campaigns whose contacts are the members of the group.
    pub fn campaigns_for_group(&self, group_id: GroupID) -> impl Iterator<Item = &Campaign> {
        self.campaigns.iter().filter(move |c| c.group_id == group_id)
    }

    pub fn point_by_id(&self, id: PointID) -> Option<(&Campaign, &CampaignPoint)> {
        self.campaigns
            .iter()
            .find_map(|c| c.points.iter().find(|p| p.id == id).map(|p| (c, p)))
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn label_by_uuid(&self, uuid: LabelUUID) -> Option<&Label> {
        self.labels.iter().find(|l| l.uuid == uuid)
    }

    pub fn optins(&self) -> &[OptIn] {
        &self.optins
    }

    pub fn optin_by_uuid(&self, uuid: OptInUUID) -> Option<&OptIn> {
        self.optins.iter().find(|o| o.uuid == uuid)
    }

    pub fn llms(&self) -> &[LLM] {
        &self.llms
    }
}

impl SessionAssets for OrgAssets {
    fn org(&self) -> &Org {
        &self.org
    }

    fn flow_by_uuid(&self, uuid: FlowUUID) -> Option<&Flow> {
        OrgAssets::flow_by_uuid(self, uuid)
    }

    fn flow_by_id(&self, id: FlowID) -> Option<&Flow> {
        OrgAssets::flow_by_id(self, id)
    }
}

pub const DEFAULT_ASSETS_TTL: Duration = Duration::from_secs(5);

struct CachedAssets {
    assets: Arc<OrgAssets>,
    loaded_at: Instant,
}

/// Process-wide cache of org snapshots.
#[derive(Clone)]
pub struct AssetsCache {
    inner: Arc<Mutex<HashMap<OrgID, CachedAssets>>>,
    ttl: Duration,
}

impl Default for AssetsCache {
    fn default() -> Self {
        Self::new(DEFAULT_ASSETS_TTL)
    }
}

impl AssetsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// The org's snapshot, reloaded in full when missing or expired.
    pub async fn get(&self, db: &dyn CoreBackend, org_id: OrgID) -> AssetsResult<Arc<OrgAssets>> {
        if let Some(assets) = self.fresh(org_id) {
            return Ok(assets);
        }
        debug!(%org_id, "loading org assets");
        self.get_with_refresh(db, org_id, Refresh::ALL).await
    }

    /// Reload the named sections and replace the cached snapshot.
    pub async fn get_with_refresh(
        &self,
        db: &dyn CoreBackend,
        org_id: OrgID,
        refresh: Refresh,
    ) -> AssetsResult<Arc<OrgAssets>> {
        let prev = self.cached(org_id);
        let assets = match OrgAssets::load(db, org_id, prev.as_deref(), refresh).await {
            Ok(assets) => Arc::new(assets),
            Err(err) => {
                if err.is_not_found() {
                    self.invalidate(org_id);
                }
                return Err(err);
            }
        };
        self.inner.lock().expect("assets cache poisoned").insert(
            org_id,
            CachedAssets {
                assets: assets.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(assets)
    }

    /// The cached snapshot, however old.
    pub fn cached(&self, org_id: OrgID) -> Option<Arc<OrgAssets>> {
        self.inner
            .lock()
            .expect("assets cache poisoned")
            .get(&org_id)
            .map(|c| c.assets.clone())
    }

    fn fresh(&self, org_id: OrgID) -> Option<Arc<OrgAssets>> {
        self.inner
            .lock()
            .expect("assets cache poisoned")
            .get(&org_id)
            .filter(|c| c.loaded_at.elapsed() < self.ttl)
            .map(|c| c.assets.clone())
    }

    pub fn invalidate(&self, org_id: OrgID) {
        self.inner
            .lock()
            .expect("assets cache poisoned")
            .remove(&org_id);
    }

    pub fn flush(&self) {
        self.inner.lock().expect("assets cache poisoned").clear();
    }
}
