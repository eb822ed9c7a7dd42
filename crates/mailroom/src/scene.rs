//! The per-contact unit of work.
//!
//! A [`Scene`] owns the persisted contact, its engine view and whatever
//! engine session the current operation produced. Events are added through
//! [`Scene::add_event`], which dispatches each one to its handler; handlers
//! only attach hook payloads. Nothing touches the store until the scene is
//! committed through [`crate::commit::bulk_commit`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use mailroom_core_backend::BackendError;
use mailroom_flows::{
    EngineError, Event, EventKind, FlowContact, FlowTicket, Modifier, Resume, Session, Sprint,
    TopicRef, Trigger, UserRef,
};
use mailroom_models::{
    Call, ChannelID, Contact, ContactID, FlowUUID, MsgID, MsgUUID, NodeUUID, OrgID, RunStatus,
    SessionStatus, Ticket, TicketUUID, UserID,
};
use tracing::debug;

use crate::assets::{AssetsError, OrgAssets};
use crate::commit::{CommitError, CommitSummary, bulk_commit};
use crate::handlers;
use crate::hooks::{PostCommitHook, PreCommitHook};
use crate::runtime::Runtime;

#[derive(Debug, thiserror::Error)]
pub enum SceneError {
    #[error("no handler registered for event type {0}")]
    UnknownEventType(&'static str),
    #[error("scene for contact {0} has already been committed")]
    Committed(ContactID),
    #[error("flow contact {flow} doesn't match db contact {db}")]
    ContactMismatch { db: ContactID, flow: ContactID },
    #[error("error handling {event} event: {reason}")]
    Handler { event: &'static str, reason: String },
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Assets(#[from] AssetsError),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl SceneError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Engine(err) => err.is_not_found(),
            Self::Backend(err) => err.is_not_found(),
            Self::Assets(err) => err.is_not_found(),
            _ => false,
        }
    }
}

pub type SceneResult<T> = Result<T, SceneError>;

/// Where a modification came from, recorded for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Via {
    Api,
    Ui,
}

/// The inbound message a scene is handling.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMsg {
    pub id: MsgID,
    pub uuid: MsgUUID,
    pub channel_id: Option<ChannelID>,
}

type PayloadMap = HashMap<TypeId, Box<dyn Any + Send + Sync>>;

pub struct Scene {
    db_contact: Contact,
    contact: FlowContact,
    incoming: Option<IncomingMsg>,
    call: Option<Call>,
    tickets: Vec<Ticket>,

    session: Option<Session>,
    session_is_new: bool,
    session_created_on: Option<DateTime<Utc>>,
    sprint: Option<Sprint>,
    events: Vec<Event>,

    pre: PayloadMap,
    post: PayloadMap,

    interrupted: bool,
    committed: bool,
}

impl fmt::Debug for Scene {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scene")
            .field("contact_id", &self.db_contact.id)
            .field("session", &self.session.as_ref().map(|s| s.uuid))
            .field("events", &self.events.len())
            .field("committed", &self.committed)
            .finish_non_exhaustive()
    }
}

/// Build the engine's view of a persisted contact.
pub fn flow_contact(assets: &OrgAssets, contact: &Contact, tickets: &[Ticket]) -> FlowContact {
    let tickets = tickets
        .iter()
        .filter(|t| t.contact_id == contact.id)
        .map(|t| FlowTicket {
            uuid: t.uuid,
            status: t.status,
            topic: t
                .topic_id
                .and_then(|id| assets.topics().iter().find(|topic| topic.id == id))
                .map(|topic| TopicRef {
                    uuid: topic.uuid,
                    name: topic.name.clone(),
                }),
            assignee: t.assignee_id.and_then(|id| assets.user_by_id(id)).map(|u| UserRef {
                uuid: u.uuid,
                name: u.name.clone(),
            }),
        })
        .collect();

    FlowContact {
        id: contact.id,
        uuid: contact.uuid,
        name: contact.name.clone(),
        language: contact.language.clone(),
        status: contact.status,
        timezone: contact.timezone.clone(),
        created_on: contact.created_on,
        last_seen_on: contact.last_seen_on,
        urns: contact.urns.iter().map(|u| u.urn.clone()).collect(),
        groups: contact
            .group_ids
            .iter()
            .filter_map(|id| assets.group_ref(*id))
            .collect(),
        fields: contact.fields.clone(),
        tickets,
    }
}

impl Scene {
    /// Scene over an engine view built elsewhere. `tickets` are the rows the
    /// view's tickets were built from.
    pub fn new(
        db_contact: Contact,
        contact: FlowContact,
        tickets: Vec<Ticket>,
    ) -> SceneResult<Self> {
        if db_contact.id != contact.id {
            return Err(SceneError::ContactMismatch {
                db: db_contact.id,
                flow: contact.id,
            });
        }
        Ok(Self {
            tickets,
            ..Self::new_unchecked(db_contact, contact)
        })
    }

    /// Scene for a persisted contact and the tickets it may act on.
    pub fn for_contact(assets: &OrgAssets, db_contact: Contact, tickets: Vec<Ticket>) -> Self {
        let contact = flow_contact(assets, &db_contact, &tickets);
        Self {
            tickets,
            ..Self::new_unchecked(db_contact, contact)
        }
    }

    fn new_unchecked(db_contact: Contact, contact: FlowContact) -> Self {
        Self {
            db_contact,
            contact,
            incoming: None,
            call: None,
            tickets: Vec::new(),
            session: None,
            session_is_new: false,
            session_created_on: None,
            sprint: None,
            events: Vec::new(),
            pre: HashMap::new(),
            post: HashMap::new(),
            interrupted: false,
            committed: false,
        }
    }

    pub fn with_incoming(mut self, msg: IncomingMsg) -> Self {
        self.incoming = Some(msg);
        self
    }

    pub fn with_call(mut self, call: Call) -> Self {
        self.call = Some(call);
        self
    }

    pub fn contact_id(&self) -> ContactID {
        self.db_contact.id
    }

    pub fn org_id(&self) -> OrgID {
        self.db_contact.org_id
    }

    pub fn db_contact(&self) -> &Contact {
        &self.db_contact
    }

    pub fn contact(&self) -> &FlowContact {
        &self.contact
    }

    pub fn incoming(&self) -> Option<&IncomingMsg> {
        self.incoming.as_ref()
    }

    pub fn call(&self) -> Option<&Call> {
        self.call.as_ref()
    }

    pub fn tickets(&self) -> &[Ticket] {
        &self.tickets
    }

    pub(crate) fn ticket_mut(&mut self, uuid: TicketUUID) -> Option<&mut Ticket> {
        self.tickets.iter_mut().find(|t| t.uuid == uuid)
    }

    pub(crate) fn push_ticket(&mut self, ticket: Ticket) {
        self.tickets.push(ticket);
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Whether the current session was started by this scene rather than resumed.
    pub fn session_is_new(&self) -> bool {
        self.session_is_new
    }

    pub(crate) fn session_created_on(&self) -> Option<DateTime<Utc>> {
        self.session_created_on
    }

    pub fn sprint(&self) -> Option<&Sprint> {
        self.sprint.as_ref()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    pub(crate) fn mark_interrupted(&mut self) {
        self.interrupted = true;
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub(crate) fn mark_committed(&mut self) {
        self.committed = true;
    }

    /// Flow and node of the step in the current session that produced an event.
    pub fn locate_event(&self, event: &Event) -> Option<(FlowUUID, NodeUUID)> {
        let step = event.step_uuid?;
        self.session.as_ref()?.find_step(step)
    }

    pub(crate) fn attach_pre<H: PreCommitHook>(&mut self, payload: H::Payload) {
        let slot = self
            .pre
            .entry(TypeId::of::<H>())
            .or_insert_with(|| Box::new(Vec::<H::Payload>::new()));
        if let Some(payloads) = slot.downcast_mut::<Vec<H::Payload>>() {
            payloads.push(payload);
        }
    }

    pub(crate) fn attach_post<H: PostCommitHook>(&mut self, payload: H::Payload) {
        let slot = self
            .post
            .entry(TypeId::of::<H>())
            .or_insert_with(|| Box::new(Vec::<H::Payload>::new()));
        if let Some(payloads) = slot.downcast_mut::<Vec<H::Payload>>() {
            payloads.push(payload);
        }
    }

    pub(crate) fn pre_payloads<H: PreCommitHook>(&self) -> Option<&[H::Payload]> {
        self.pre
            .get(&TypeId::of::<H>())
            .and_then(|slot| slot.downcast_ref::<Vec<H::Payload>>())
            .filter(|payloads| !payloads.is_empty())
            .map(Vec::as_slice)
    }

    pub(crate) fn post_payloads<H: PostCommitHook>(&self) -> Option<&[H::Payload]> {
        self.post
            .get(&TypeId::of::<H>())
            .and_then(|slot| slot.downcast_ref::<Vec<H::Payload>>())
            .filter(|payloads| !payloads.is_empty())
            .map(Vec::as_slice)
    }

    /// Number of hooks this scene has attached payloads to.
    pub fn hook_count(&self) -> usize {
        self.pre.len() + self.post.len()
    }

    fn ensure_open(&self) -> SceneResult<()> {
        if self.committed {
            return Err(SceneError::Committed(self.db_contact.id));
        }
        Ok(())
    }

    /// Dispatch an event to its handler and record it.
    pub fn add_event(
        &mut self,
        assets: &OrgAssets,
        event: Event,
        user_id: Option<UserID>,
    ) -> SceneResult<()> {
        self.ensure_open()?;
        let handler = handlers::handler_for(event.type_name())
            .ok_or(SceneError::UnknownEventType(event.type_name()))?;
        handler(self, assets, &event, user_id)?;
        self.events.push(event);
        Ok(())
    }

    pub fn add_events(
        &mut self,
        assets: &OrgAssets,
        events: impl IntoIterator<Item = Event>,
        user_id: Option<UserID>,
    ) -> SceneResult<()> {
        for event in events {
            self.add_event(assets, event, user_id)?;
        }
        Ok(())
    }

    /// Start a new session from a trigger. Interactive sessions take over the
    /// contact when asked to interrupt or when they end up waiting, so a
    /// contact never has more than one waiting session.
    pub async fn start_session(
        &mut self,
        rt: &Runtime,
        assets: &OrgAssets,
        trigger: Trigger,
        interrupt: bool,
    ) -> SceneResult<()> {
        self.ensure_open()?;
        let call_uuid = self.call.as_ref().map(|c| c.uuid);
        let (session, sprint) = rt
            .engine
            .start(assets, self.contact.clone(), trigger, call_uuid)
            .await?;

        let takes_over = session.session_type.is_interactive()
            && (interrupt || session.status == SessionStatus::Waiting);
        if takes_over && self.db_contact.is_waiting() && !self.interrupted {
            self.add_event(
                assets,
                Event::new(EventKind::SessionInterrupted {
                    status: SessionStatus::Interrupted,
                }),
                None,
            )?;
        }

        self.session_is_new = true;
        self.session_created_on = Some(Utc::now());
        self.process_sprint(assets, session, sprint)
    }

    /// Resume a persisted waiting session.
    pub async fn resume_session(
        &mut self,
        rt: &Runtime,
        assets: &OrgAssets,
        row: &mailroom_models::Session,
        resume: Resume,
    ) -> SceneResult<()> {
        self.ensure_open()?;
        let session = session_from_row(row)?;
        let (session, sprint) = rt
            .engine
            .resume(assets, session, self.contact.clone(), resume)
            .await?;
        self.session_is_new = false;
        self.session_created_on = Some(row.created_on);
        self.process_sprint(assets, session, sprint)
    }

    fn process_sprint(
        &mut self,
        assets: &OrgAssets,
        session: Session,
        sprint: Sprint,
    ) -> SceneResult<()> {
        debug!(
            contact_id = %self.db_contact.id,
            session_uuid = %session.uuid,
            status = %session.status,
            events = sprint.events.len(),
            "processing sprint"
        );
        self.contact = session.contact.clone();
        let events = sprint.events.clone();
        self.session = Some(session);
        self.sprint = Some(sprint);
        self.add_events(assets, events, None)?;
        self.add_event(assets, Event::new(EventKind::SprintEnded {}), None)
    }

    /// Apply a modifier to the contact, returning the events it produced.
    pub fn apply_modifier(
        &mut self,
        rt: &Runtime,
        assets: &OrgAssets,
        modifier: &Modifier,
        user_id: Option<UserID>,
        via: Via,
    ) -> SceneResult<Vec<Event>> {
        self.ensure_open()?;
        let events = rt.engine.apply_modifier(assets, &mut self.contact, modifier);
        debug!(contact_id = %self.db_contact.id, ?via, events = events.len(), "applied modifier");
        self.add_events(assets, events.clone(), user_id)?;
        Ok(events)
    }

    /// End the contact's current waiting session with the given status.
    pub async fn interrupt_waiting(
        &mut self,
        rt: &Runtime,
        assets: &OrgAssets,
        status: SessionStatus,
    ) -> SceneResult<()> {
        self.ensure_open()?;
        if !self.db_contact.is_waiting() || self.interrupted {
            return Ok(());
        }
        for event in self.ended_run_events(rt, RunStatus::from(status)).await? {
            self.add_event(assets, event, None)?;
        }
        self.add_event(
            assets,
            Event::new(EventKind::SessionInterrupted { status }),
            None,
        )
    }

    /// Interrupt every waiting session of the contact.
    pub async fn interrupt_contact(&mut self, rt: &Runtime, assets: &OrgAssets) -> SceneResult<()> {
        self.ensure_open()?;
        for event in self.ended_run_events(rt, RunStatus::Interrupted).await? {
            self.add_event(assets, event, None)?;
        }
        self.add_event(assets, Event::new(EventKind::ContactInterrupted {}), None)
    }

    async fn ended_run_events(&self, rt: &Runtime, status: RunStatus) -> SceneResult<Vec<Event>> {
        let Some(uuid) = self.db_contact.current_session_uuid else {
            return Ok(Vec::new());
        };
        let Some(row) = rt.db.load_session(self.db_contact.org_id, uuid).await? else {
            return Ok(Vec::new());
        };
        let Ok(session) = session_from_row(&row) else {
            return Ok(Vec::new());
        };
        Ok(session
            .runs
            .iter()
            .filter(|run| !run.status.is_ended())
            .map(|run| {
                Event::new(EventKind::RunEnded {
                    run_uuid: run.uuid,
                    flow: run.flow.clone(),
                    status,
                })
            })
            .collect())
    }

    /// Commit just this scene.
    pub async fn commit(
        &mut self,
        rt: &Runtime,
        assets: &OrgAssets,
    ) -> Result<CommitSummary, CommitError> {
        bulk_commit(rt, assets, std::slice::from_mut(self)).await
    }
}

/// Rehydrate the engine session stored in a session row.
pub fn session_from_row(row: &mailroom_models::Session) -> SceneResult<Session> {
    Ok(serde_json::from_value(row.output.clone())?)
}

#[cfg(test)]
mod tests {
    use mailroom_flows::{FieldRef, GroupModification};
    use mailroom_models::ContactStatus;

    use super::*;
    use crate::test_support::{self, ANN, BOB, ORG};

    #[tokio::test]
    async fn test_mismatched_contacts_are_rejected() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let ann = fx.mem.contact(ANN).unwrap();
        let bob = fx.mem.contact(BOB).unwrap();
        let err = Scene::new(ann, flow_contact(&assets, &bob, &[]), Vec::new()).unwrap_err();
        assert!(matches!(err, SceneError::ContactMismatch { .. }));
    }

    #[tokio::test]
    async fn test_unknown_event_type_fails() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let mut scene = fx.scene(&assets, ANN);
        let err = scene
            .add_event(&assets, Event::new(EventKind::Unknown), None)
            .unwrap_err();
        assert!(matches!(err, SceneError::UnknownEventType("unknown")));
        assert!(scene.events().is_empty());
    }

    #[tokio::test]
    async fn test_modifier_events_attach_payloads() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let mut scene = fx.scene(&assets, ANN);

        let events = scene
            .apply_modifier(
                &fx.rt,
                &assets,
                &Modifier::Name {
                    name: Some("Annie".to_string()),
                },
                None,
                Via::Api,
            )
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(scene.contact().name.as_deref(), Some("Annie"));

        // same name again changes nothing
        let events = scene
            .apply_modifier(
                &fx.rt,
                &assets,
                &Modifier::Name {
                    name: Some("Annie".to_string()),
                },
                None,
                Via::Api,
            )
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(scene.events().len(), 1);
    }

    #[tokio::test]
    async fn test_committed_scene_rejects_events() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let mut scene = fx.scene(&assets, ANN);
        scene
            .apply_modifier(
                &fx.rt,
                &assets,
                &Modifier::Field {
                    field: FieldRef {
                        key: "age".to_string(),
                        name: "Age".to_string(),
                    },
                    value: Some("41".to_string()),
                },
                None,
                Via::Ui,
            )
            .unwrap();
        scene.commit(&fx.rt, &assets).await.unwrap();
        assert_eq!(fx.mem.contact(ANN).unwrap().fields["age"].text, "41");

        let err = scene
            .apply_modifier(
                &fx.rt,
                &assets,
                &Modifier::Status {
                    status: ContactStatus::Blocked,
                },
                None,
                Via::Ui,
            )
            .unwrap_err();
        assert!(matches!(err, SceneError::Committed(id) if id == ANN));
    }

    #[tokio::test]
    async fn test_start_session_locates_events() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let mut scene = fx.scene(&assets, ANN);
        scene
            .start_session(&fx.rt, &assets, fx.manual_trigger(&assets, test_support::FAVORITES), false)
            .await
            .unwrap();

        let session = scene.session().unwrap();
        assert_eq!(session.status, SessionStatus::Waiting);
        let created = scene
            .events()
            .iter()
            .find(|e| e.type_name() == "msg_created")
            .unwrap();
        let (flow, _node) = scene.locate_event(created).unwrap();
        assert_eq!(flow, assets.flow_by_id(test_support::FAVORITES).unwrap().uuid);
        assert_eq!(scene.events().last().unwrap().type_name(), "sprint_ended");
    }

    #[tokio::test]
    async fn test_interrupt_waiting_without_session_is_noop() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let mut scene = fx.scene(&assets, BOB);
        scene
            .interrupt_waiting(&fx.rt, &assets, SessionStatus::Interrupted)
            .await
            .unwrap();
        assert!(scene.events().is_empty());
        assert_eq!(scene.hook_count(), 0);
    }

    #[tokio::test]
    async fn test_group_changes_are_recorded() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let mut scene = fx.scene(&assets, BOB);
        let doctors = assets.group_ref(test_support::DOCTORS).unwrap();
        scene
            .apply_modifier(
                &fx.rt,
                &assets,
                &Modifier::Groups {
                    groups: vec![doctors.clone()],
                    modification: GroupModification::Add,
                },
                None,
                Via::Api,
            )
            .unwrap();
        assert!(scene.contact().in_group(doctors.uuid));
        assert_eq!(scene.events()[0].type_name(), "contact_groups_changed");
        assert!(scene.db_contact().current_session_uuid.is_none());
    }
}
