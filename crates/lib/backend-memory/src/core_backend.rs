use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use mailroom_core_backend::{
    BackendError, BackendResult, CampaignFireKey, ContactFieldUpdate, ContactSessionUpdate,
    ContactURNsUpdate, CoreBackend, CoreTx, GroupMembership, MsgDeletion, MsgHandled, MsgLabel,
    MsgStatusUpdate, ResthookUnsubscribe,
};
use mailroom_models::{
    AirtimeTransfer, Broadcast, BroadcastID, Call, CallDirection, CallID, CallStatus, Campaign,
    CampaignPoint, Channel, ChannelID, ChannelUUID, Contact, ContactFire, ContactID, ContactStatus,
    ContactURN, ContactUUID,
    Field, FireID, FireType, Flow, FlowActivityCount, FlowID, FlowRun, FlowStart, Group, GroupID,
    HttpLog, Incident, IncidentID, Label, LLM, Msg, MsgDirection, MsgID, MsgStatus, MsgVisibility,
    Notification, OptIn, Org, OrgID, PointID, PointStatus, RunStatus, Session, SessionStatus,
    SessionUUID, StartID, StartStatus, Ticket, TicketEvent, TicketID, TicketStatus, Topic, Trigger,
    URN, URNID, User,
};
use tokio::sync::OwnedMutexGuard;

use crate::{MemoryBackend, OrgRows, Store};

impl MemoryBackend {
    fn read<R>(&self, f: impl FnOnce(&Store) -> R) -> R {
        let store = self.store.lock().expect("store poisoned");
        f(&store)
    }

    fn org_rows<T: Clone>(&self, org_id: OrgID, f: impl FnOnce(&OrgRows) -> &Vec<T>) -> Vec<T> {
        self.read(|s| s.assets.get(&org_id).map(|rows| f(rows).clone()))
            .unwrap_or_default()
    }

    fn check_read(&self, op: &'static str) -> BackendResult<()> {
        if self.is_failing(op) {
            return Err(BackendError::Injected(op));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CoreBackend for MemoryBackend {
    fn clone_box(&self) -> Box<dyn CoreBackend> {
        Box::new(self.clone())
    }

    async fn begin(&self) -> BackendResult<Box<dyn CoreTx>> {
        self.check_read("begin")?;
        let guard = self.tx_lock.clone().lock_owned().await;
        let staged = self.snapshot();
        Ok(Box::new(MemoryTx {
            backend: self.clone(),
            store: self.store.clone(),
            staged,
            _guard: guard,
        }))
    }

    async fn load_org(&self, org_id: OrgID) -> BackendResult<Org> {
        self.check_read("load_org")?;
        self.read(|s| s.orgs.get(&org_id).filter(|o| o.is_active).cloned())
            .ok_or_else(|| BackendError::NotFound(format!("org {org_id}")))
    }

    async fn load_flows(&self, org_id: OrgID) -> BackendResult<Vec<Flow>> {
        self.check_read("load_flows")?;
        Ok(self.org_rows(org_id, |r| &r.flows))
    }

    async fn load_fields(&self, org_id: OrgID) -> BackendResult<Vec<Field>> {
        Ok(self.org_rows(org_id, |r| &r.fields))
    }

    async fn load_groups(&self, org_id: OrgID) -> BackendResult<Vec<Group>> {
        Ok(self.org_rows(org_id, |r| &r.groups))
    }

    async fn load_channels(&self, org_id: OrgID) -> BackendResult<Vec<Channel>> {
        Ok(self.org_rows(org_id, |r| &r.channels))
    }

    async fn load_channel_by_uuid(&self, uuid: ChannelUUID) -> BackendResult<Option<Channel>> {
        Ok(self.read(|s| {
            s.assets
                .values()
                .flat_map(|rows| rows.channels.iter())
                .find(|c| c.uuid == uuid)
                .cloned()
        }))
    }

    async fn load_topics(&self, org_id: OrgID) -> BackendResult<Vec<Topic>> {
        Ok(self.org_rows(org_id, |r| &r.topics))
    }

    async fn load_users(&self, org_id: OrgID) -> BackendResult<Vec<User>> {
        Ok(self.org_rows(org_id, |r| &r.users))
    }

    async fn load_campaigns(&self, org_id: OrgID) -> BackendResult<Vec<Campaign>> {
        self.check_read("load_campaigns")?;
        Ok(self.org_rows(org_id, |r| &r.campaigns))
    }

    async fn load_triggers(&self, org_id: OrgID) -> BackendResult<Vec<Trigger>> {
        Ok(self.org_rows(org_id, |r| &r.triggers))
    }

    async fn load_labels(&self, org_id: OrgID) -> BackendResult<Vec<Label>> {
        Ok(self.org_rows(org_id, |r| &r.labels))
    }

    async fn load_optins(&self, org_id: OrgID) -> BackendResult<Vec<OptIn>> {
        Ok(self.org_rows(org_id, |r| &r.optins))
    }

    async fn load_llms(&self, org_id: OrgID) -> BackendResult<Vec<LLM>> {
        Ok(self.org_rows(org_id, |r| &r.llms))
    }

    async fn load_contacts(&self, org_id: OrgID, ids: &[ContactID]) -> BackendResult<Vec<Contact>> {
        self.check_read("load_contacts")?;
        Ok(self.read(|s| {
            ids.iter()
                .filter_map(|id| s.contacts.get(id))
                .filter(|c| c.org_id == org_id)
                .cloned()
                .collect()
        }))
    }

    async fn load_group_contact_ids(
        &self,
        org_id: OrgID,
        group_id: GroupID,
    ) -> BackendResult<Vec<ContactID>> {
        Ok(self.read(|s| {
            s.contacts
                .values()
                .filter(|c| c.org_id == org_id && c.in_group(group_id))
                .map(|c| c.id)
                .collect()
        }))
    }

    async fn load_contact_ids_by_urns(
        &self,
        org_id: OrgID,
        urns: &[URN],
    ) -> BackendResult<Vec<ContactID>> {
        let identities: Vec<String> = urns.iter().map(URN::identity).collect();
        Ok(self.read(|s| {
            s.contacts
                .values()
                .filter(|c| c.org_id == org_id)
                .filter(|c| c.urns.iter().any(|u| identities.contains(&u.identity())))
                .map(|c| c.id)
                .collect()
        }))
    }

    async fn load_contact_ids_by_uuids(
        &self,
        org_id: OrgID,
        uuids: &[ContactUUID],
    ) -> BackendResult<Vec<ContactID>> {
        Ok(self.read(|s| {
            s.contacts
                .values()
                .filter(|c| c.org_id == org_id && uuids.contains(&c.uuid))
                .map(|c| c.id)
                .collect()
        }))
    }

    async fn load_active_contact_ids(&self, org_id: OrgID) -> BackendResult<Vec<ContactID>> {
        Ok(self.read(|s| {
            s.contacts
                .values()
                .filter(|c| c.org_id == org_id && c.status == ContactStatus::Active)
                .map(|c| c.id)
                .collect()
        }))
    }

    async fn load_flow_contact_ids(
        &self,
        org_id: OrgID,
        flow_id: FlowID,
    ) -> BackendResult<Vec<ContactID>> {
        Ok(self.read(|s| {
            let ids: std::collections::BTreeSet<ContactID> = s
                .runs
                .values()
                .filter(|r| r.org_id == org_id && r.flow_id == flow_id)
                .map(|r| r.contact_id)
                .collect();
            ids.into_iter().collect()
        }))
    }

    async fn load_session(
        &self,
        org_id: OrgID,
        uuid: SessionUUID,
    ) -> BackendResult<Option<Session>> {
        self.check_read("load_session")?;
        Ok(self.read(|s| s.sessions.get(&uuid).filter(|x| x.org_id == org_id).cloned()))
    }

    async fn load_msg(&self, org_id: OrgID, id: MsgID) -> BackendResult<Option<Msg>> {
        Ok(self.read(|s| s.msgs.get(&id).filter(|m| m.org_id == org_id).cloned()))
    }

    async fn load_tickets(&self, org_id: OrgID, ids: &[TicketID]) -> BackendResult<Vec<Ticket>> {
        Ok(self.read(|s| {
            ids.iter()
                .filter_map(|id| s.tickets.get(id))
                .filter(|t| t.org_id == org_id)
                .cloned()
                .collect()
        }))
    }

    async fn load_open_tickets(
        &self,
        org_id: OrgID,
        contact_ids: &[ContactID],
    ) -> BackendResult<Vec<Ticket>> {
        Ok(self.read(|s| {
            s.tickets
                .values()
                .filter(|t| t.org_id == org_id && t.status == TicketStatus::Open)
                .filter(|t| contact_ids.contains(&t.contact_id))
                .cloned()
                .collect()
        }))
    }

    async fn load_due_fires(
        &self,
        fire_types: &[FireType],
        now: DateTime<Utc>,
        limit: usize,
    ) -> BackendResult<Vec<ContactFire>> {
        self.check_read("load_due_fires")?;
        let mut due: Vec<ContactFire> = self.read(|s| {
            s.fires
                .values()
                .filter(|f| fire_types.contains(&f.fire_type) && f.fire_on <= now)
                .cloned()
                .collect()
        });
        due.sort_by_key(|f| (f.fire_on, f.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn load_campaign_point(
        &self,
        org_id: OrgID,
        point_id: PointID,
    ) -> BackendResult<Option<CampaignPoint>> {
        Ok(self.read(|s| {
            s.assets.get(&org_id).and_then(|rows| {
                rows.campaigns
                    .iter()
                    .flat_map(|c| c.points.iter())
                    .find(|p| p.id == point_id)
                    .cloned()
            })
        }))
    }

    async fn load_call(&self, org_id: OrgID, id: CallID) -> BackendResult<Option<Call>> {
        Ok(self.read(|s| s.calls.get(&id).filter(|c| c.org_id == org_id).cloned()))
    }

    async fn load_call_by_external_id(
        &self,
        channel_id: ChannelID,
        external_id: &str,
    ) -> BackendResult<Option<Call>> {
        Ok(self.read(|s| {
            s.calls
                .values()
                .find(|c| c.channel_id == channel_id && c.external_id.as_deref() == Some(external_id))
                .cloned()
        }))
    }

    async fn count_active_calls(&self, channel_id: ChannelID) -> BackendResult<i64> {
        Ok(self.read(|s| {
            s.calls
                .values()
                .filter(|c| c.channel_id == channel_id)
                .filter(|c| matches!(c.status, CallStatus::Wired | CallStatus::InProgress))
                .count() as i64
        }))
    }

    async fn load_calls_to_retry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BackendResult<Vec<Call>> {
        Ok(self.read(|s| {
            s.calls
                .values()
                .filter(|c| c.status == CallStatus::Errored && c.direction == CallDirection::Outgoing)
                .filter(|c| c.next_attempt.is_some_and(|t| t <= now))
                .take(limit)
                .cloned()
                .collect()
        }))
    }

    async fn load_throttled_calls(&self, limit: usize) -> BackendResult<Vec<Call>> {
        Ok(self.read(|s| {
            s.calls
                .values()
                .filter(|c| c.status == CallStatus::Throttled)
                .take(limit)
                .cloned()
                .collect()
        }))
    }

    async fn load_flow_start(
        &self,
        org_id: OrgID,
        id: StartID,
    ) -> BackendResult<Option<FlowStart>> {
        Ok(self.read(|s| s.flow_starts.get(&id).filter(|x| x.org_id == org_id).cloned()))
    }

    async fn load_broadcast(
        &self,
        org_id: OrgID,
        id: BroadcastID,
    ) -> BackendResult<Option<Broadcast>> {
        Ok(self.read(|s| s.broadcasts.get(&id).filter(|b| b.org_id == org_id).cloned()))
    }

    async fn load_open_incidents(&self, incident_type: &str) -> BackendResult<Vec<Incident>> {
        Ok(self.read(|s| {
            s.incidents
                .values()
                .filter(|i| i.incident_type == incident_type && i.ended_on.is_none())
                .cloned()
                .collect()
        }))
    }
}

/// A transaction over a staged copy of the store.
pub struct MemoryTx {
    backend: MemoryBackend,
    store: Arc<Mutex<Store>>,
    staged: Store,
    _guard: OwnedMutexGuard<()>,
}

impl MemoryTx {
    fn op(&mut self, op: &'static str) -> BackendResult<&mut Store> {
        if self.backend.is_failing(op) {
            return Err(BackendError::Injected(op));
        }
        self.staged.tx_log.push(op.to_string());
        Ok(&mut self.staged)
    }
}

fn contact_mut(store: &mut Store, id: ContactID) -> Option<&mut Contact> {
    store.contacts.get_mut(&id)
}

#[async_trait::async_trait]
impl CoreTx for MemoryTx {
    async fn commit(self: Box<Self>) -> BackendResult<()> {
        if self.backend.is_failing("commit") {
            return Err(BackendError::Injected("commit"));
        }
        let MemoryTx { store, staged, .. } = *self;
        *store.lock().expect("store poisoned") = staged;
        Ok(())
    }

    async fn insert_sessions(&mut self, sessions: &[Session]) -> BackendResult<()> {
        let store = self.op("insert_sessions")?;
        for session in sessions {
            store.sessions.insert(session.uuid, session.clone());
        }
        Ok(())
    }

    async fn update_sessions(&mut self, sessions: &[Session]) -> BackendResult<()> {
        let store = self.op("update_sessions")?;
        for session in sessions {
            store.sessions.insert(session.uuid, session.clone());
        }
        Ok(())
    }

    async fn end_waiting_sessions(
        &mut self,
        contact_ids: &[ContactID],
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> BackendResult<Vec<SessionUUID>> {
        let store = self.op("end_waiting_sessions")?;
        let mut ended = Vec::new();
        for session in store.sessions.values_mut() {
            if contact_ids.contains(&session.contact_id) && session.end(status, now) {
                ended.push(session.uuid);
            }
        }
        Ok(ended)
    }

    async fn end_sessions(
        &mut self,
        uuids: &[SessionUUID],
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> BackendResult<()> {
        let store = self.op("end_sessions")?;
        for uuid in uuids {
            if let Some(session) = store.sessions.get_mut(uuid) {
                session.end(status, now);
            }
        }
        Ok(())
    }

    async fn upsert_runs(&mut self, runs: &[FlowRun]) -> BackendResult<()> {
        let store = self.op("upsert_runs")?;
        for run in runs {
            store.runs.insert(run.uuid, run.clone());
        }
        Ok(())
    }

    async fn end_session_runs(
        &mut self,
        session_uuids: &[SessionUUID],
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> BackendResult<()> {
        let store = self.op("end_session_runs")?;
        for run in store.runs.values_mut() {
            if session_uuids.contains(&run.session_uuid) && !run.status.is_ended() {
                run.status = status;
                run.exited_on = Some(now);
                run.modified_on = now;
            }
        }
        Ok(())
    }

    async fn update_contact_sessions(
        &mut self,
        updates: &[ContactSessionUpdate],
    ) -> BackendResult<()> {
        let store = self.op("update_contact_sessions")?;
        for update in updates {
            if let Some(contact) = contact_mut(store, update.contact_id) {
                contact.current_session_uuid = update.session_uuid;
                contact.current_flow_id = update.flow_id;
            }
        }
        Ok(())
    }

    async fn update_contact_names(
        &mut self,
        updates: &[(ContactID, Option<String>)],
    ) -> BackendResult<()> {
        let store = self.op("update_contact_names")?;
        for (id, name) in updates {
            if let Some(contact) = contact_mut(store, *id) {
                contact.name = name.clone();
            }
        }
        Ok(())
    }

    async fn update_contact_languages(
        &mut self,
        updates: &[(ContactID, Option<String>)],
    ) -> BackendResult<()> {
        let store = self.op("update_contact_languages")?;
        for (id, language) in updates {
            if let Some(contact) = contact_mut(store, *id) {
                contact.language = language.clone();
            }
        }
        Ok(())
    }

    async fn update_contact_statuses(
        &mut self,
        updates: &[(ContactID, ContactStatus)],
    ) -> BackendResult<()> {
        let store = self.op("update_contact_statuses")?;
        for (id, status) in updates {
            if let Some(contact) = contact_mut(store, *id) {
                contact.status = *status;
            }
        }
        Ok(())
    }

    async fn update_contact_last_seen(
        &mut self,
        updates: &[(ContactID, DateTime<Utc>)],
    ) -> BackendResult<()> {
        let store = self.op("update_contact_last_seen")?;
        for (id, seen) in updates {
            if let Some(contact) = contact_mut(store, *id) {
                contact.last_seen_on = Some(*seen);
            }
        }
        Ok(())
    }

    async fn update_contact_fields(&mut self, updates: &[ContactFieldUpdate]) -> BackendResult<()> {
        let store = self.op("update_contact_fields")?;
        for update in updates {
            if let Some(contact) = contact_mut(store, update.contact_id) {
                match &update.value {
                    Some(value) => contact.fields.insert(update.key.clone(), value.clone()),
                    None => contact.fields.remove(&update.key),
                };
            }
        }
        Ok(())
    }

    async fn add_contact_groups(&mut self, memberships: &[GroupMembership]) -> BackendResult<()> {
        let store = self.op("add_contact_groups")?;
        for m in memberships {
            if let Some(contact) = contact_mut(store, m.contact_id)
                && !contact.in_group(m.group_id)
            {
                contact.group_ids.push(m.group_id);
            }
        }
        Ok(())
    }

    async fn remove_contact_groups(
        &mut self,
        memberships: &[GroupMembership],
    ) -> BackendResult<()> {
        let store = self.op("remove_contact_groups")?;
        for m in memberships {
            if let Some(contact) = contact_mut(store, m.contact_id) {
                contact.group_ids.retain(|g| *g != m.group_id);
            }
        }
        Ok(())
    }

    async fn update_contact_urns(&mut self, updates: &[ContactURNsUpdate]) -> BackendResult<()> {
        let store = self.op("update_contact_urns")?;
        for update in updates {
            let mut urns = Vec::with_capacity(update.urns.len());
            for (i, urn) in update.urns.iter().enumerate() {
                let identity = urn.identity();
                // take over the URN from whichever contact in the org owns it
                let mut existing = None;
                for contact in store.contacts.values_mut() {
                    if contact.org_id != update.org_id {
                        continue;
                    }
                    if let Some(pos) = contact.urns.iter().position(|u| u.identity() == identity) {
                        existing = Some(contact.urns.remove(pos));
                        break;
                    }
                }
                let mut contact_urn = match existing {
                    Some(urn) => urn,
                    None => ContactURN {
                        id: URNID(store.next_id()),
                        contact_id: None,
                        urn: urn.clone(),
                        priority: 0,
                        channel_id: None,
                        auth_tokens: Default::default(),
                    },
                };
                contact_urn.contact_id = Some(update.contact_id);
                contact_urn.priority = 1000 - i as i32;
                urns.push(contact_urn);
            }
            if let Some(contact) = contact_mut(store, update.contact_id) {
                contact.urns = urns;
            }
        }
        Ok(())
    }

    async fn update_contacts_modified_on(
        &mut self,
        contact_ids: &[ContactID],
        now: DateTime<Utc>,
    ) -> BackendResult<()> {
        let store = self.op("update_contacts_modified_on")?;
        for id in contact_ids {
            if let Some(contact) = contact_mut(store, *id) {
                contact.modified_on = now;
            }
        }
        Ok(())
    }

    async fn insert_fires(&mut self, fires: &[ContactFire]) -> BackendResult<()> {
        let store = self.op("insert_fires")?;
        for fire in fires {
            store.fires.retain(|_, f| {
                !(f.contact_id == fire.contact_id
                    && f.fire_type == fire.fire_type
                    && f.scope == fire.scope)
            });
            let mut fire = fire.clone();
            fire.id = FireID(store.next_id());
            store.fires.insert(fire.id, fire);
        }
        Ok(())
    }

    async fn delete_fires(&mut self, ids: &[FireID]) -> BackendResult<()> {
        let store = self.op("delete_fires")?;
        for id in ids {
            store.fires.remove(id);
        }
        Ok(())
    }

    async fn delete_session_fires(&mut self, contact_ids: &[ContactID]) -> BackendResult<()> {
        let store = self.op("delete_session_fires")?;
        store
            .fires
            .retain(|_, f| !(f.fire_type.is_session_timer() && contact_ids.contains(&f.contact_id)));
        Ok(())
    }

    async fn delete_campaign_fires(&mut self, keys: &[CampaignFireKey]) -> BackendResult<()> {
        let store = self.op("delete_campaign_fires")?;
        store.fires.retain(|_, f| {
            let Some((point_id, _)) = f.campaign_point() else {
                return true;
            };
            !keys
                .iter()
                .any(|k| k.contact_id == f.contact_id && k.point_id == point_id)
        });
        Ok(())
    }

    async fn delete_point_fires(&mut self, point_id: PointID) -> BackendResult<()> {
        let store = self.op("delete_point_fires")?;
        store
            .fires
            .retain(|_, f| f.campaign_point().is_none_or(|(p, _)| p != point_id));
        Ok(())
    }

    async fn insert_call(&mut self, call: &Call) -> BackendResult<CallID> {
        let store = self.op("insert_call")?;
        let mut call = call.clone();
        call.id = CallID(store.next_id());
        let id = call.id;
        store.calls.insert(id, call);
        Ok(id)
    }

    async fn update_calls(&mut self, calls: &[Call]) -> BackendResult<()> {
        let store = self.op("update_calls")?;
        for call in calls {
            store.calls.insert(call.id, call.clone());
        }
        Ok(())
    }

    async fn insert_msgs(&mut self, msgs: &[Msg]) -> BackendResult<Vec<MsgID>> {
        let store = self.op("insert_msgs")?;
        let mut ids = Vec::with_capacity(msgs.len());
        for msg in msgs {
            let mut msg = msg.clone();
            msg.id = MsgID(store.next_id());
            ids.push(msg.id);
            store.msgs.insert(msg.id, msg);
        }
        Ok(ids)
    }

    async fn mark_msgs_handled(&mut self, msgs: &[MsgHandled]) -> BackendResult<()> {
        let store = self.op("mark_msgs_handled")?;
        for handled in msgs {
            if let Some(msg) = store.msgs.get_mut(&handled.msg_id)
                && msg.status == MsgStatus::Pending
            {
                msg.status = MsgStatus::Handled;
                msg.flow_id = handled.flow_id;
                msg.ticket_id = handled.ticket_id;
                if handled.archive {
                    msg.visibility = MsgVisibility::Archived;
                }
                msg.modified_on = Utc::now();
            }
        }
        Ok(())
    }

    async fn update_msg_statuses(&mut self, updates: &[MsgStatusUpdate]) -> BackendResult<()> {
        let store = self.op("update_msg_statuses")?;
        for update in updates {
            if let Some(msg) = store.msgs.get_mut(&update.msg_id) {
                msg.status = update.status;
                if update.external_id.is_some() {
                    msg.external_id = update.external_id.clone();
                }
                match update.status {
                    MsgStatus::Wired | MsgStatus::Sent => {
                        msg.sent_on.get_or_insert(update.at);
                    }
                    MsgStatus::Errored => msg.error_count += 1,
                    MsgStatus::Failed => msg.failed_reason = update.failed_reason.clone(),
                    _ => {}
                }
                msg.modified_on = update.at;
            }
        }
        Ok(())
    }

    async fn delete_msgs(&mut self, deletions: &[MsgDeletion]) -> BackendResult<()> {
        let store = self.op("delete_msgs")?;
        for deletion in deletions {
            if let Some(msg) = store.msgs.values_mut().find(|m| {
                m.org_id == deletion.org_id
                    && m.uuid == deletion.msg_uuid
                    && m.direction == MsgDirection::In
            }) {
                msg.visibility = if deletion.by_contact {
                    MsgVisibility::DeletedBySender
                } else {
                    MsgVisibility::Deleted
                };
                msg.text.clear();
                msg.attachments.clear();
            }
        }
        Ok(())
    }

    async fn add_msg_labels(&mut self, labels: &[MsgLabel]) -> BackendResult<()> {
        let store = self.op("add_msg_labels")?;
        for label in labels {
            store.msg_labels.insert((label.msg_uuid, label.label_id));
        }
        Ok(())
    }

    async fn insert_tickets(&mut self, tickets: &[Ticket]) -> BackendResult<Vec<TicketID>> {
        let store = self.op("insert_tickets")?;
        let mut ids = Vec::with_capacity(tickets.len());
        for ticket in tickets {
            let mut ticket = ticket.clone();
            ticket.id = TicketID(store.next_id());
            ids.push(ticket.id);
            if let Some(contact) = store.contacts.get_mut(&ticket.contact_id)
                && ticket.status == TicketStatus::Open
            {
                contact.open_ticket_ids.push(ticket.id);
            }
            store.tickets.insert(ticket.id, ticket);
        }
        Ok(ids)
    }

    async fn update_tickets(&mut self, tickets: &[Ticket]) -> BackendResult<()> {
        let store = self.op("update_tickets")?;
        for ticket in tickets {
            if let Some(contact) = store.contacts.get_mut(&ticket.contact_id) {
                contact.open_ticket_ids.retain(|id| *id != ticket.id);
                if ticket.status == TicketStatus::Open {
                    contact.open_ticket_ids.push(ticket.id);
                }
            }
            store.tickets.insert(ticket.id, ticket.clone());
        }
        Ok(())
    }

    async fn insert_ticket_events(&mut self, events: &[TicketEvent]) -> BackendResult<()> {
        let store = self.op("insert_ticket_events")?;
        for event in events {
            if !store.ticket_events.iter().any(|e| e.uuid == event.uuid) {
                store.ticket_events.push(event.clone());
            }
        }
        Ok(())
    }

    async fn update_ticket_activity(
        &mut self,
        ticket_ids: &[TicketID],
        now: DateTime<Utc>,
    ) -> BackendResult<()> {
        let store = self.op("update_ticket_activity")?;
        for id in ticket_ids {
            if let Some(ticket) = store.tickets.get_mut(id) {
                ticket.last_activity_on = now;
            }
        }
        Ok(())
    }

    async fn insert_http_logs(&mut self, logs: &[HttpLog]) -> BackendResult<()> {
        let store = self.op("insert_http_logs")?;
        store.http_logs.extend(logs.iter().cloned());
        Ok(())
    }

    async fn insert_airtime_transfers(
        &mut self,
        transfers: &[AirtimeTransfer],
    ) -> BackendResult<()> {
        let store = self.op("insert_airtime_transfers")?;
        store.airtime_transfers.extend(transfers.iter().cloned());
        Ok(())
    }

    async fn insert_flow_activity(&mut self, counts: &[FlowActivityCount]) -> BackendResult<()> {
        let store = self.op("insert_flow_activity")?;
        store.flow_activity.extend(counts.iter().cloned());
        Ok(())
    }

    async fn insert_notifications(&mut self, notifications: &[Notification]) -> BackendResult<()> {
        let store = self.op("insert_notifications")?;
        store.notifications.extend(notifications.iter().cloned());
        Ok(())
    }

    async fn get_or_create_incident(
        &mut self,
        org_id: OrgID,
        incident_type: &str,
        scope: &str,
        now: DateTime<Utc>,
    ) -> BackendResult<(Incident, bool)> {
        let store = self.op("get_or_create_incident")?;
        if let Some(existing) = store.incidents.values().find(|i| {
            i.org_id == org_id
                && i.incident_type == incident_type
                && i.scope == scope
                && i.ended_on.is_none()
        }) {
            return Ok((existing.clone(), false));
        }
        let incident = Incident {
            id: IncidentID(store.next_id()),
            org_id,
            incident_type: incident_type.to_string(),
            scope: scope.to_string(),
            started_on: now,
            ended_on: None,
        };
        store.incidents.insert(incident.id, incident.clone());
        Ok((incident, true))
    }

    async fn end_incident(&mut self, id: IncidentID, now: DateTime<Utc>) -> BackendResult<()> {
        let store = self.op("end_incident")?;
        if let Some(incident) = store.incidents.get_mut(&id) {
            incident.ended_on.get_or_insert(now);
        }
        Ok(())
    }

    async fn update_point_status(
        &mut self,
        point_id: PointID,
        status: PointStatus,
    ) -> BackendResult<()> {
        let store = self.op("update_point_status")?;
        if let Some(point) = store.campaign_point_mut(point_id) {
            point.status = status;
        }
        Ok(())
    }

    async fn update_flow_start(
        &mut self,
        id: StartID,
        status: StartStatus,
        contact_count: Option<i64>,
    ) -> BackendResult<()> {
        let store = self.op("update_flow_start")?;
        if let Some(start) = store.flow_starts.get_mut(&id) {
            start.status = status;
            if let Some(count) = contact_count {
                start.contact_count = count;
            }
            start.modified_on = Utc::now();
        }
        Ok(())
    }

    async fn insert_broadcast(&mut self, broadcast: &Broadcast) -> BackendResult<BroadcastID> {
        let store = self.op("insert_broadcast")?;
        let mut broadcast = broadcast.clone();
        broadcast.id = BroadcastID(store.next_id());
        let id = broadcast.id;
        store.broadcasts.insert(id, broadcast);
        Ok(id)
    }

    async fn unsubscribe_resthooks(
        &mut self,
        unsubscribes: &[ResthookUnsubscribe],
    ) -> BackendResult<()> {
        let store = self.op("unsubscribe_resthooks")?;
        for u in unsubscribes {
            store
                .resthook_subscribers
                .remove(&(u.org_id, u.slug.clone(), u.url.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use mailroom_models::{ContactUUID, OrgUUID};

    use super::*;

    fn backend_with_contact() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.seed(|s| {
            s.orgs.insert(
                OrgID(1),
                Org {
                    id: OrgID(1),
                    uuid: OrgUUID::new(),
                    name: "Org".to_string(),
                    timezone: "UTC".to_string(),
                    language: "eng".to_string(),
                    is_active: true,
                    is_suspended: false,
                },
            );
            s.contacts.insert(
                ContactID(10),
                Contact {
                    id: ContactID(10),
                    uuid: ContactUUID::new(),
                    org_id: OrgID(1),
                    name: Some("Ann".to_string()),
                    language: None,
                    status: ContactStatus::Active,
                    timezone: None,
                    created_on: Utc::now(),
                    modified_on: Utc::now(),
                    last_seen_on: None,
                    current_session_uuid: None,
                    current_flow_id: None,
                    urns: vec![],
                    group_ids: vec![],
                    fields: BTreeMap::new(),
                    open_ticket_ids: vec![],
                },
            );
        });
        backend
    }

    #[tokio::test]
    async fn commit_applies_staged_writes() {
        let backend = backend_with_contact();
        let mut tx = backend.begin().await.expect("begin");
        tx.update_contact_names(&[(ContactID(10), Some("Annie".to_string()))])
            .await
            .expect("update");
        assert_eq!(
            backend.contact(ContactID(10)).unwrap().name.as_deref(),
            Some("Ann")
        );
        tx.commit().await.expect("commit");
        assert_eq!(
            backend.contact(ContactID(10)).unwrap().name.as_deref(),
            Some("Annie")
        );
        assert_eq!(backend.tx_log(), vec!["update_contact_names"]);
    }

    #[tokio::test]
    async fn dropped_tx_rolls_back() {
        let backend = backend_with_contact();
        {
            let mut tx = backend.begin().await.expect("begin");
            tx.add_contact_groups(&[GroupMembership {
                contact_id: ContactID(10),
                group_id: GroupID(5),
            }])
            .await
            .expect("add");
        }
        assert!(backend.contact(ContactID(10)).unwrap().group_ids.is_empty());
        assert!(backend.tx_log().is_empty());
    }

    #[tokio::test]
    async fn injected_failure_errors() {
        let backend = backend_with_contact();
        backend.fail_op("insert_msgs");
        let mut tx = backend.begin().await.expect("begin");
        let err = tx.insert_msgs(&[]).await.unwrap_err();
        assert!(matches!(err, BackendError::Injected("insert_msgs")));
    }

    #[tokio::test]
    async fn urns_are_stolen_from_other_contacts() {
        let backend = backend_with_contact();
        let tel = URN::parse("tel:+250788000001").unwrap();
        backend.seed(|s| {
            let mut other = s.contacts[&ContactID(10)].clone();
            other.id = ContactID(11);
            other.urns = vec![ContactURN {
                id: URNID(99),
                contact_id: Some(ContactID(11)),
                urn: tel.clone(),
                priority: 1000,
                channel_id: None,
                auth_tokens: BTreeMap::new(),
            }];
            s.contacts.insert(ContactID(11), other);
        });

        let mut tx = backend.begin().await.expect("begin");
        tx.update_contact_urns(&[ContactURNsUpdate {
            org_id: OrgID(1),
            contact_id: ContactID(10),
            urns: vec![tel],
        }])
        .await
        .expect("urns");
        tx.commit().await.expect("commit");

        let ann = backend.contact(ContactID(10)).unwrap();
        assert_eq!(ann.urns.len(), 1);
        assert_eq!(ann.urns[0].id, URNID(99));
        assert!(backend.contact(ContactID(11)).unwrap().urns.is_empty());
    }
}
