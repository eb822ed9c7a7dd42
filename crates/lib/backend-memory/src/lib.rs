//! In-memory backend for tests and local runs.
//!
//! Relational state lives in a [`Store`]. Transactions work on a staged copy
//! that replaces the committed store on commit and is discarded on drop, and
//! only one transaction is open at a time. Every transactional write is
//! recorded in a log, and named operations can be made to fail so rollback
//! paths can be exercised.

#[cfg(feature = "core-backend")]
mod core_backend;

#[cfg(feature = "kv-backend")]
mod kv_backend;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use mailroom_models::{
    AirtimeTransfer, Broadcast, BroadcastID, Call, CallID, Campaign, CampaignPoint, Channel, Contact, ContactFire,
    ContactID, Field, FireID, Flow, FlowActivityCount, FlowRun, FlowStart, Group, HttpLog,
    Incident, IncidentID, Label, LLM, LabelID, Msg, MsgID, MsgUUID, Notification, OptIn, Org,
    OrgID, PointID, RunUUID, Session, SessionUUID, StartID, Ticket, TicketEvent, TicketID, Topic,
    Trigger, User,
};

#[cfg(feature = "kv-backend")]
pub use self::kv_backend::KvStore;

/// Asset rows of a single org.
#[derive(Clone, Debug, Default)]
pub struct OrgRows {
    pub flows: Vec<Flow>,
    pub fields: Vec<Field>,
    pub groups: Vec<Group>,
    pub channels: Vec<Channel>,
    pub topics: Vec<Topic>,
    pub users: Vec<User>,
    pub campaigns: Vec<Campaign>,
    pub triggers: Vec<Trigger>,
    pub labels: Vec<Label>,
    pub optins: Vec<OptIn>,
    pub llms: Vec<LLM>,
}

/// The relational tables of the memory backend.
#[derive(Clone, Debug, Default)]
pub struct Store {
    pub orgs: BTreeMap<OrgID, Org>,
    pub assets: BTreeMap<OrgID, OrgRows>,
    pub contacts: BTreeMap<ContactID, Contact>,
    pub sessions: BTreeMap<SessionUUID, Session>,
    pub runs: BTreeMap<RunUUID, FlowRun>,
    pub fires: BTreeMap<FireID, ContactFire>,
    pub calls: BTreeMap<CallID, Call>,
    pub msgs: BTreeMap<MsgID, Msg>,
    pub msg_labels: BTreeSet<(MsgUUID, LabelID)>,
    pub tickets: BTreeMap<TicketID, Ticket>,
    pub ticket_events: Vec<TicketEvent>,
    pub http_logs: Vec<HttpLog>,
    pub airtime_transfers: Vec<AirtimeTransfer>,
    pub flow_activity: Vec<FlowActivityCount>,
    pub notifications: Vec<Notification>,
    pub incidents: BTreeMap<IncidentID, Incident>,
    pub flow_starts: BTreeMap<StartID, FlowStart>,
    pub broadcasts: BTreeMap<BroadcastID, Broadcast>,
    /// (org, resthook slug, target url)
    pub resthook_subscribers: BTreeSet<(OrgID, String, String)>,
    /// Names of transactional writes, in commit order.
    pub tx_log: Vec<String>,
    next_id: i64,
}

impl Store {
    pub fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn org_rows(&mut self, org_id: OrgID) -> &mut OrgRows {
        self.assets.entry(org_id).or_default()
    }

    pub fn campaign_point_mut(&mut self, point_id: PointID) -> Option<&mut CampaignPoint> {
        self.assets
            .values_mut()
            .flat_map(|rows| rows.campaigns.iter_mut())
            .flat_map(|c| c.points.iter_mut())
            .find(|p| p.id == point_id)
    }
}

/// Backend that keeps everything in memory.
#[derive(Clone)]
pub struct MemoryBackend {
    store: Arc<Mutex<Store>>,
    tx_lock: Arc<tokio::sync::Mutex<()>>,
    failing_ops: Arc<Mutex<HashSet<&'static str>>>,
    #[cfg(feature = "kv-backend")]
    kv: Arc<Mutex<KvStore>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::default())),
            tx_lock: Arc::new(tokio::sync::Mutex::new(())),
            failing_ops: Arc::new(Mutex::new(HashSet::new())),
            #[cfg(feature = "kv-backend")]
            kv: Arc::new(Mutex::new(KvStore::default())),
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the committed relational state.
    pub fn snapshot(&self) -> Store {
        self.store.lock().expect("store poisoned").clone()
    }

    /// Mutate committed state directly, outside any transaction. Used to seed fixtures.
    pub fn seed<R>(&self, f: impl FnOnce(&mut Store) -> R) -> R {
        let mut store = self.store.lock().expect("store poisoned");
        f(&mut store)
    }

    pub fn contact(&self, id: ContactID) -> Option<Contact> {
        self.store
            .lock()
            .expect("store poisoned")
            .contacts
            .get(&id)
            .cloned()
    }

    pub fn session(&self, uuid: SessionUUID) -> Option<Session> {
        self.store
            .lock()
            .expect("store poisoned")
            .sessions
            .get(&uuid)
            .cloned()
    }

    pub fn msgs(&self) -> Vec<Msg> {
        self.store
            .lock()
            .expect("store poisoned")
            .msgs
            .values()
            .cloned()
            .collect()
    }

    pub fn fires(&self) -> Vec<ContactFire> {
        self.store
            .lock()
            .expect("store poisoned")
            .fires
            .values()
            .cloned()
            .collect()
    }

    pub fn tx_log(&self) -> Vec<String> {
        self.store.lock().expect("store poisoned").tx_log.clone()
    }

    pub fn clear_tx_log(&self) {
        self.store.lock().expect("store poisoned").tx_log.clear();
    }

    /// Make every later call of the named operation fail with `Injected`.
    pub fn fail_op(&self, op: &'static str) {
        self.failing_ops
            .lock()
            .expect("failing ops poisoned")
            .insert(op);
    }

    pub fn clear_failures(&self) {
        self.failing_ops
            .lock()
            .expect("failing ops poisoned")
            .clear();
    }

    pub(crate) fn is_failing(&self, op: &str) -> bool {
        self.failing_ops
            .lock()
            .expect("failing ops poisoned")
            .contains(op)
    }
}
