//! Persistence traits for the mailroom core.
//!
//! [`CoreBackend`] serves reads against committed state and opens transactions.
//! Every durable write goes through a [`CoreTx`], so a bulk commit either lands
//! all of its hook writes or none of them.

mod data;

use chrono::{DateTime, Utc};

use mailroom_models::{
    AirtimeTransfer, Broadcast, BroadcastID, Call, CallID, Campaign, CampaignPoint, Channel, ChannelID, ChannelUUID, Contact,
    ContactUUID,
    ContactFire, ContactID, ContactStatus, Field, FireID, FireType, Flow, FlowActivityCount, FlowID,
    FlowRun, FlowStart, Group, GroupID, HttpLog, Incident, IncidentID, Label, LLM, Msg, MsgID,
    Notification, OptIn, Org, OrgID, PointID, PointStatus, RunStatus, Session, SessionStatus,
    SessionUUID, StartID, StartStatus, Ticket, TicketEvent, TicketID, Topic, Trigger, URN, User,
};

pub use mailroom_backends_core::{BackendError, BackendResult};

pub use self::data::*;

/// Reads against committed state, plus transaction creation.
#[async_trait::async_trait]
pub trait CoreBackend: Send + Sync {
    fn clone_box(&self) -> Box<dyn CoreBackend>;

    /// Open a transaction. Dropping it without calling [`CoreTx::commit`] rolls back.
    async fn begin(&self) -> BackendResult<Box<dyn CoreTx>>;

    /// Load an active org, failing with `NotFound` when it is missing or inactive.
    async fn load_org(&self, org_id: OrgID) -> BackendResult<Org>;
    async fn load_flows(&self, org_id: OrgID) -> BackendResult<Vec<Flow>>;
    async fn load_fields(&self, org_id: OrgID) -> BackendResult<Vec<Field>>;
    async fn load_groups(&self, org_id: OrgID) -> BackendResult<Vec<Group>>;
    async fn load_channels(&self, org_id: OrgID) -> BackendResult<Vec<Channel>>;
    /// Look up an active channel across orgs, as provider callbacks only carry its UUID.
    async fn load_channel_by_uuid(&self, uuid: ChannelUUID) -> BackendResult<Option<Channel>>;
    async fn load_topics(&self, org_id: OrgID) -> BackendResult<Vec<Topic>>;
    async fn load_users(&self, org_id: OrgID) -> BackendResult<Vec<User>>;
    async fn load_campaigns(&self, org_id: OrgID) -> BackendResult<Vec<Campaign>>;
    async fn load_triggers(&self, org_id: OrgID) -> BackendResult<Vec<Trigger>>;
    async fn load_labels(&self, org_id: OrgID) -> BackendResult<Vec<Label>>;
    async fn load_optins(&self, org_id: OrgID) -> BackendResult<Vec<OptIn>>;
    async fn load_llms(&self, org_id: OrgID) -> BackendResult<Vec<LLM>>;

    /// Load contacts by id. Missing or deleted contacts are left out.
    async fn load_contacts(&self, org_id: OrgID, ids: &[ContactID]) -> BackendResult<Vec<Contact>>;
    async fn load_group_contact_ids(
        &self,
        org_id: OrgID,
        group_id: GroupID,
    ) -> BackendResult<Vec<ContactID>>;
    async fn load_contact_ids_by_urns(
        &self,
        org_id: OrgID,
        urns: &[URN],
    ) -> BackendResult<Vec<ContactID>>;
    async fn load_contact_ids_by_uuids(
        &self,
        org_id: OrgID,
        uuids: &[ContactUUID],
    ) -> BackendResult<Vec<ContactID>>;
    async fn load_active_contact_ids(&self, org_id: OrgID) -> BackendResult<Vec<ContactID>>;
    /// Contacts that have ever had a run in the flow.
    async fn load_flow_contact_ids(
        &self,
        org_id: OrgID,
        flow_id: FlowID,
    ) -> BackendResult<Vec<ContactID>>;

    async fn load_session(
        &self,
        org_id: OrgID,
        uuid: SessionUUID,
    ) -> BackendResult<Option<Session>>;

    async fn load_msg(&self, org_id: OrgID, id: MsgID) -> BackendResult<Option<Msg>>;

    async fn load_tickets(&self, org_id: OrgID, ids: &[TicketID]) -> BackendResult<Vec<Ticket>>;
    /// Open tickets of the given contacts.
    async fn load_open_tickets(
        &self,
        org_id: OrgID,
        contact_ids: &[ContactID],
    ) -> BackendResult<Vec<Ticket>>;

    /// Fires of the given types due at `now`, oldest first.
    async fn load_due_fires(
        &self,
        fire_types: &[FireType],
        now: DateTime<Utc>,
        limit: usize,
    ) -> BackendResult<Vec<ContactFire>>;

    async fn load_campaign_point(
        &self,
        org_id: OrgID,
        point_id: PointID,
    ) -> BackendResult<Option<CampaignPoint>>;

    async fn load_call(&self, org_id: OrgID, id: CallID) -> BackendResult<Option<Call>>;
    async fn load_call_by_external_id(
        &self,
        channel_id: ChannelID,
        external_id: &str,
    ) -> BackendResult<Option<Call>>;
    /// Calls on the channel that are wired or in progress.
    async fn count_active_calls(&self, channel_id: ChannelID) -> BackendResult<i64>;
    /// Errored outgoing calls whose next attempt is due.
    async fn load_calls_to_retry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BackendResult<Vec<Call>>;
    async fn load_throttled_calls(&self, limit: usize) -> BackendResult<Vec<Call>>;

    async fn load_flow_start(&self, org_id: OrgID, id: StartID)
    -> BackendResult<Option<FlowStart>>;
    async fn load_broadcast(
        &self,
        org_id: OrgID,
        id: BroadcastID,
    ) -> BackendResult<Option<Broadcast>>;

    async fn load_open_incidents(&self, incident_type: &str) -> BackendResult<Vec<Incident>>;
}

impl Clone for Box<dyn CoreBackend> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Writes made inside one transaction.
#[async_trait::async_trait]
pub trait CoreTx: Send {
    async fn commit(self: Box<Self>) -> BackendResult<()>;

    async fn insert_sessions(&mut self, sessions: &[Session]) -> BackendResult<()>;
    /// Persist status, output and pointers of existing sessions.
    async fn update_sessions(&mut self, sessions: &[Session]) -> BackendResult<()>;
    /// End the waiting sessions of the given contacts, returning the ones ended.
    async fn end_waiting_sessions(
        &mut self,
        contact_ids: &[ContactID],
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> BackendResult<Vec<SessionUUID>>;
    /// End specific sessions if still waiting.
    async fn end_sessions(
        &mut self,
        uuids: &[SessionUUID],
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> BackendResult<()>;

    async fn upsert_runs(&mut self, runs: &[FlowRun]) -> BackendResult<()>;
    /// End the active and waiting runs of the given sessions.
    async fn end_session_runs(
        &mut self,
        session_uuids: &[SessionUUID],
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> BackendResult<()>;

    async fn update_contact_sessions(&mut self, updates: &[ContactSessionUpdate])
    -> BackendResult<()>;
    async fn update_contact_names(
        &mut self,
        updates: &[(ContactID, Option<String>)],
    ) -> BackendResult<()>;
    async fn update_contact_languages(
        &mut self,
        updates: &[(ContactID, Option<String>)],
    ) -> BackendResult<()>;
    async fn update_contact_statuses(
        &mut self,
        updates: &[(ContactID, ContactStatus)],
    ) -> BackendResult<()>;
    async fn update_contact_last_seen(
        &mut self,
        updates: &[(ContactID, DateTime<Utc>)],
    ) -> BackendResult<()>;
    async fn update_contact_fields(&mut self, updates: &[ContactFieldUpdate]) -> BackendResult<()>;
    /// Add memberships, ignoring ones that already exist.
    async fn add_contact_groups(&mut self, memberships: &[GroupMembership]) -> BackendResult<()>;
    async fn remove_contact_groups(&mut self, memberships: &[GroupMembership])
    -> BackendResult<()>;
    async fn update_contact_urns(&mut self, updates: &[ContactURNsUpdate]) -> BackendResult<()>;
    async fn update_contacts_modified_on(
        &mut self,
        contact_ids: &[ContactID],
        now: DateTime<Utc>,
    ) -> BackendResult<()>;

    /// Insert fires, replacing any existing fire with the same contact, type and scope.
    async fn insert_fires(&mut self, fires: &[ContactFire]) -> BackendResult<()>;
    async fn delete_fires(&mut self, ids: &[FireID]) -> BackendResult<()>;
    /// Delete wait and session timer fires of the given contacts.
    async fn delete_session_fires(&mut self, contact_ids: &[ContactID]) -> BackendResult<()>;
    async fn delete_campaign_fires(&mut self, keys: &[CampaignFireKey]) -> BackendResult<()>;
    async fn delete_point_fires(&mut self, point_id: PointID) -> BackendResult<()>;

    async fn insert_call(&mut self, call: &Call) -> BackendResult<CallID>;
    async fn update_calls(&mut self, calls: &[Call]) -> BackendResult<()>;

    async fn insert_msgs(&mut self, msgs: &[Msg]) -> BackendResult<Vec<MsgID>>;
    /// Mark incoming messages handled, only if they are still pending.
    async fn mark_msgs_handled(&mut self, msgs: &[MsgHandled]) -> BackendResult<()>;
    async fn update_msg_statuses(&mut self, updates: &[MsgStatusUpdate]) -> BackendResult<()>;
    async fn delete_msgs(&mut self, deletions: &[MsgDeletion]) -> BackendResult<()>;
    async fn add_msg_labels(&mut self, labels: &[MsgLabel]) -> BackendResult<()>;

    async fn insert_tickets(&mut self, tickets: &[Ticket]) -> BackendResult<Vec<TicketID>>;
    async fn update_tickets(&mut self, tickets: &[Ticket]) -> BackendResult<()>;
    /// Insert ticket events, ignoring ones whose UUID already exists.
    async fn insert_ticket_events(&mut self, events: &[TicketEvent]) -> BackendResult<()>;
    async fn update_ticket_activity(
        &mut self,
        ticket_ids: &[TicketID],
        now: DateTime<Utc>,
    ) -> BackendResult<()>;

    async fn insert_http_logs(&mut self, logs: &[HttpLog]) -> BackendResult<()>;
    async fn insert_airtime_transfers(&mut self, transfers: &[AirtimeTransfer])
    -> BackendResult<()>;
    async fn insert_flow_activity(&mut self, counts: &[FlowActivityCount]) -> BackendResult<()>;
    async fn insert_notifications(&mut self, notifications: &[Notification]) -> BackendResult<()>;

    /// Return the open incident of this type and scope, creating it if needed.
    /// The flag is true when the incident was created by this call.
    async fn get_or_create_incident(
        &mut self,
        org_id: OrgID,
        incident_type: &str,
        scope: &str,
        now: DateTime<Utc>,
    ) -> BackendResult<(Incident, bool)>;
    async fn end_incident(&mut self, id: IncidentID, now: DateTime<Utc>) -> BackendResult<()>;

    async fn update_point_status(
        &mut self,
        point_id: PointID,
        status: PointStatus,
    ) -> BackendResult<()>;
    async fn update_flow_start(
        &mut self,
        id: StartID,
        status: StartStatus,
        contact_count: Option<i64>,
    ) -> BackendResult<()>;
    async fn insert_broadcast(&mut self, broadcast: &Broadcast) -> BackendResult<BroadcastID>;
    async fn unsubscribe_resthooks(&mut self, unsubscribes: &[ResthookUnsubscribe])
    -> BackendResult<()>;
}
