//! IVR call coordination.
//!
//! Calls are rows of their own. Placing one asks the channel's [`Service`]
//! to dial; the provider then calls back to start the session, to resume it
//! with input, and to report status. Every callback that touches a session
//! runs under the contact's lock, like any other scene.

pub mod twiml;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mailroom_core_backend::BackendError;
use mailroom_flows::{ChannelRef, DialStatus, Event, FlowContact, FlowRef, MsgIn, Resume, Session, Trigger};
use mailroom_kv_backend::KvError;
use mailroom_models::{
    Call, CallDirection, CallError, CallID, CallStatus, Channel, ChannelEventType, ChannelRole,
    ChannelUUID, ContactID, Flow, FlowType, MsgUUID, URN,
};
use tracing::{debug, info, warn};

use crate::assets::{AssetsError, OrgAssets};
use crate::commit::CommitError;
use crate::locker::{self, TASK_LOCK_WAIT};
use crate::runner::{self, RunnerError};
use crate::runtime::Runtime;
use crate::scene::{Scene, SceneError, flow_contact};
use crate::triggers;

/// Calls looked at per retry or throttle run.
pub const CALL_BATCH_SIZE: usize = 100;
/// Bound on every HTTP call made to a provider.
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum IvrError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Assets(#[from] AssetsError),
    #[error(transparent)]
    Scene(#[from] SceneError),
    #[error(transparent)]
    Commit(#[from] CommitError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("no IVR service for channel type {0}")]
    NoService(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("invalid request signature")]
    InvalidSignature,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("xml error: {0}")]
    Xml(String),
}

impl IvrError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Backend(err) => err.is_not_found(),
            Self::Assets(err) => err.is_not_found(),
            Self::Scene(err) => err.is_not_found(),
            Self::Commit(err) => err.is_not_found(),
            Self::Runner(err) => err.is_not_found(),
            _ => false,
        }
    }
}

pub type IvrResult<T> = Result<T, IvrError>;

/// Where the provider reports back about a call it is placing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallCallbacks {
    pub start_url: String,
    pub status_url: String,
}

/// A provider callback, already split into its parts.
#[derive(Debug, Clone, Default)]
pub struct CallbackRequest {
    /// Full URL the provider called, query string included.
    pub url: String,
    pub signature: Option<String>,
    pub query: BTreeMap<String, String>,
    pub form: BTreeMap<String, String>,
}

impl CallbackRequest {
    /// A posted value, falling back to the query string.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.form
            .get(key)
            .or_else(|| self.query.get(key))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Start,
    Handle,
    Status,
    Incoming,
}

impl CallbackAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Handle => "handle",
            Self::Status => "status",
            Self::Incoming => "incoming",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(Self::Start),
            "handle" => Some(Self::Handle),
            "status" => Some(Self::Status),
            "incoming" => Some(Self::Incoming),
            _ => None,
        }
    }
}

/// What a resume callback carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IvrResume {
    Input { digits: String },
    Recording { url: String },
    Dial { status: DialStatus, duration: i32 },
    Timeout,
}

/// A call status reported by the provider, in our terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: CallStatus,
    pub error: Option<CallError>,
    pub duration: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Media {
    pub content_type: String,
    pub url: String,
}

/// A voice provider adapter.
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// Ask the provider to dial, returning its id for the call.
    async fn request_call(
        &self,
        channel: &Channel,
        urn: &URN,
        callbacks: &CallCallbacks,
    ) -> IvrResult<String>;

    async fn hangup_call(&self, channel: &Channel, external_id: &str) -> IvrResult<()>;

    /// Turn a sprint's voice events and the session's wait into a response.
    fn write_session_response(
        &self,
        session: &Session,
        events: &[Event],
        resume_url: &str,
    ) -> IvrResult<String>;

    fn write_reject_response(&self) -> IvrResult<String>;
    fn write_error_response(&self, err: &str) -> IvrResult<String>;
    /// A response that just ends the call.
    fn write_empty_response(&self, msg: &str) -> IvrResult<String>;

    fn resume_for_request(&self, req: &CallbackRequest) -> IvrResult<IvrResume>;
    fn status_for_request(&self, req: &CallbackRequest) -> StatusUpdate;

    /// Whether a call that connected shouldn't start its session, e.g. a
    /// machine answered.
    fn check_start_request(&self, req: &CallbackRequest) -> Option<CallError>;

    /// A response to send instead of resuming, if the request needs no resume.
    fn preprocess_resume(&self, _req: &CallbackRequest) -> IvrResult<Option<String>> {
        Ok(None)
    }

    /// A response to send instead of updating the call, if the request
    /// isn't a status change.
    fn preprocess_status(&self, _req: &CallbackRequest) -> IvrResult<Option<String>> {
        Ok(None)
    }

    fn validate_request_signature(&self, channel: &Channel, req: &CallbackRequest) -> IvrResult<()>;

    async fn download_media(&self, channel: &Channel, url: &str) -> IvrResult<Media>;

    fn urn_for_request(&self, req: &CallbackRequest) -> IvrResult<URN>;
    fn call_id_for_request(&self, req: &CallbackRequest) -> IvrResult<String>;

    /// Channel secrets that must not appear in logs.
    fn redact_values(&self, channel: &Channel) -> Vec<String>;

    fn content_type(&self) -> &'static str;
}

/// IVR services by channel type.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: Arc<HashMap<String, Arc<dyn Service>>>,
}

impl ServiceRegistry {
    /// Twilio and TwiML-compatible channel types.
    pub fn standard() -> Self {
        let twiml: Arc<dyn Service> = Arc::new(twiml::TwimlService::new());
        Self::default()
            .register(twiml::TWILIO_CHANNEL_TYPE, twiml.clone())
            .register(twiml::TWIML_API_CHANNEL_TYPE, twiml)
    }

    pub fn register(mut self, channel_type: &str, service: Arc<dyn Service>) -> Self {
        Arc::make_mut(&mut self.services).insert(channel_type.to_string(), service);
        self
    }

    pub fn service_for(&self, channel: &Channel) -> IvrResult<Arc<dyn Service>> {
        self.services
            .get(&channel.channel_type)
            .cloned()
            .ok_or_else(|| IvrError::NoService(channel.channel_type.clone()))
    }
}

/// Replace each secret in `text` with asterisks.
pub fn redact(text: &str, secrets: &[String]) -> String {
    secrets
        .iter()
        .filter(|s| !s.is_empty())
        .fold(text.to_string(), |text, secret| text.replace(secret.as_str(), "********"))
}

fn callback_url(rt: &Runtime, channel: &Channel, action: CallbackAction, call_id: Option<CallID>) -> String {
    let path = format!("/mr/ivr/c/{}/{}", channel.uuid, action.as_str());
    match call_id {
        Some(id) => rt.config.callback_url(&format!("{path}?call_id={id}")),
        None => rt.config.callback_url(&path),
    }
}

/// The flow a call was placed for, from its stored trigger.
fn call_flow<'a>(assets: &'a OrgAssets, call: &Call) -> Option<&'a Flow> {
    let trigger: Trigger = serde_json::from_value(call.trigger.clone()?).ok()?;
    assets.flow_by_uuid(trigger.flow().uuid)
}

fn retry_wait(assets: &OrgAssets, call: &Call) -> Option<Duration> {
    call_flow(assets, call).and_then(Flow::ivr_retry_wait)
}

async fn save_call(rt: &Runtime, call: &Call) -> IvrResult<()> {
    let mut tx = rt.db.begin().await?;
    tx.update_calls(std::slice::from_ref(call)).await?;
    tx.commit().await?;
    Ok(())
}

/// Create and place a call to each contact for a voice flow. Contacts with
/// no URN a voice channel can call are left out.
pub async fn request_calls(
    rt: &Runtime,
    assets: &OrgAssets,
    contact_ids: &[ContactID],
    flow: &Flow,
    build_trigger: impl Fn(&FlowContact) -> Trigger,
) -> IvrResult<Vec<Call>> {
    let org_id = assets.org_id();
    let mut calls = Vec::with_capacity(contact_ids.len());
    for contact in rt.db.load_contacts(org_id, contact_ids).await? {
        let Some((urn, channel)) = contact
            .urns
            .iter()
            .find_map(|urn| assets.channel_for_urn(urn, ChannelRole::Call).map(|ch| (urn, ch)))
        else {
            debug!(contact_id = %contact.id, "no callable URN, skipping contact");
            continue;
        };

        let view = flow_contact(assets, &contact, &[]);
        let trigger = serde_json::to_value(build_trigger(&view))?;
        let mut call = Call::new_outgoing(
            org_id,
            channel.id,
            contact.id,
            urn.id,
            Some(trigger),
            Utc::now(),
        );
        let mut tx = rt.db.begin().await?;
        call.id = tx.insert_call(&call).await?;
        tx.commit().await?;

        place_call(rt, channel, &urn.urn, &mut call).await?;
        calls.push(call);
    }
    debug!(flow_uuid = %flow.uuid, calls = calls.len(), "calls requested");
    Ok(calls)
}

/// Dial a call, or throttle it when its channel is at its concurrency limit.
async fn place_call(
    rt: &Runtime,
    channel: &Channel,
    urn: &URN,
    call: &mut Call,
) -> IvrResult<()> {
    let now = Utc::now();
    if let Some(max) = channel.max_concurrent_calls()
        && rt.db.count_active_calls(channel.id).await? >= max
    {
        debug!(call_id = %call.id, channel_id = %channel.id, max, "channel at call limit, throttling");
        call.mark_throttled(now);
        return save_call(rt, call).await;
    }

    let service = rt.ivr.service_for(channel)?;
    let callbacks = CallCallbacks {
        start_url: callback_url(rt, channel, CallbackAction::Start, Some(call.id)),
        status_url: callback_url(rt, channel, CallbackAction::Status, Some(call.id)),
    };
    match service.request_call(channel, urn, &callbacks).await {
        Ok(external_id) => {
            debug!(call_id = %call.id, %external_id, "call requested");
            call.mark_wired(&external_id, now);
        }
        Err(err) => {
            let error = redact(&err.to_string(), &service.redact_values(channel));
            warn!(call_id = %call.id, error, "call request failed");
            call.mark_failed(now);
        }
    }
    save_call(rt, call).await
}

/// Place again a call that errored or was throttled.
async fn redial(rt: &Runtime, mut call: Call) -> IvrResult<CallStatus> {
    let assets = rt.org_assets(call.org_id).await?;
    let channel = assets.channel_by_id(call.channel_id).filter(|c| c.has_role(ChannelRole::Call));
    let contact = rt.db.load_contacts(call.org_id, &[call.contact_id]).await?;
    let urn = contact
        .first()
        .and_then(|c| c.urns.iter().find(|u| u.id == call.urn_id));

    match (channel, urn) {
        (Some(channel), Some(urn)) => place_call(rt, channel, &urn.urn, &mut call).await?,
        _ => {
            info!(call_id = %call.id, "channel or URN gone, failing call");
            call.mark_failed(Utc::now());
            save_call(rt, &call).await?;
        }
    }
    Ok(call.status)
}

/// Redial errored calls whose next attempt is due. Returns how many were
/// placed again.
pub async fn retry_calls(rt: &Runtime, now: DateTime<Utc>) -> IvrResult<usize> {
    let mut retried = 0;
    for call in rt.db.load_calls_to_retry(now, CALL_BATCH_SIZE).await? {
        if redial(rt, call).await? == CallStatus::Wired {
            retried += 1;
        }
    }
    Ok(retried)
}

/// Place throttled calls whose channel has room again. Returns how many
/// were placed.
pub async fn reconcile_throttled(rt: &Runtime) -> IvrResult<usize> {
    let mut placed = 0;
    for call in rt.db.load_throttled_calls(CALL_BATCH_SIZE).await? {
        if redial(rt, call).await? == CallStatus::Wired {
            placed += 1;
        }
    }
    Ok(placed)
}

pub async fn hangup_call(rt: &Runtime, assets: &OrgAssets, call: &Call) -> IvrResult<()> {
    let Some(external_id) = &call.external_id else {
        return Ok(());
    };
    let channel = assets
        .channel_by_id(call.channel_id)
        .ok_or_else(|| IvrError::NotFound(format!("channel {}", call.channel_id)))?;
    rt.ivr.service_for(channel)?.hangup_call(channel, external_id).await
}

/// Handle a provider callback for one of our channels.
pub async fn handle_callback(
    rt: &Runtime,
    channel_uuid: ChannelUUID,
    action: CallbackAction,
    req: &CallbackRequest,
) -> IvrResult<CallbackResponse> {
    let channel = rt
        .db
        .load_channel_by_uuid(channel_uuid)
        .await?
        .ok_or_else(|| IvrError::NotFound(format!("channel {channel_uuid}")))?;
    let assets = rt.org_assets(channel.org_id).await?;
    let service = rt.ivr.service_for(&channel)?;
    service.validate_request_signature(&channel, req)?;

    let ctx = Callback {
        rt,
        assets: &assets,
        channel: &channel,
        service: service.as_ref(),
        req,
    };
    let result = match action {
        CallbackAction::Start => ctx.start().await,
        CallbackAction::Handle => ctx.resume().await,
        CallbackAction::Status => ctx.status().await,
        CallbackAction::Incoming => ctx.incoming().await,
    };
    let body = match result {
        Ok(body) => body,
        Err(err) => {
            warn!(
                channel_uuid = %channel.uuid,
                action = action.as_str(),
                error = %redact(&err.to_string(), &service.redact_values(&channel)),
                "IVR callback failed"
            );
            service.write_error_response(&err.to_string())?
        }
    };
    Ok(CallbackResponse {
        status: 200,
        content_type: service.content_type(),
        body,
    })
}

struct Callback<'a> {
    rt: &'a Runtime,
    assets: &'a OrgAssets,
    channel: &'a Channel,
    service: &'a dyn Service,
    req: &'a CallbackRequest,
}

impl Callback<'_> {
    async fn load_call(&self) -> IvrResult<Call> {
        let id = self
            .req
            .query
            .get("call_id")
            .and_then(|id| id.parse::<i64>().ok())
            .map(CallID)
            .ok_or_else(|| IvrError::BadRequest("missing call_id".to_string()))?;
        self.rt
            .db
            .load_call(self.assets.org_id(), id)
            .await?
            .filter(|c| c.channel_id == self.channel.id)
            .ok_or_else(|| IvrError::NotFound(format!("call {id}")))
    }

    fn resume_url(&self, call: &Call) -> String {
        callback_url(self.rt, self.channel, CallbackAction::Handle, Some(call.id))
    }

    async fn load_scene(&self, contact_id: ContactID, call: Call) -> IvrResult<Option<Scene>> {
        let mut scenes = runner::load_scenes(self.rt, self.assets, &[contact_id]).await?;
        Ok(scenes.pop().map(|scene| scene.with_call(call)))
    }

    fn session_response(&self, scene: &Scene, call: &Call) -> IvrResult<String> {
        match (scene.session(), scene.sprint()) {
            (Some(session), Some(sprint)) => {
                self.service
                    .write_session_response(session, &sprint.events, &self.resume_url(call))
            }
            _ => self.service.write_empty_response("session ended"),
        }
    }

    /// The call connected: start its session, unless a machine answered.
    async fn start(&self) -> IvrResult<String> {
        let mut call = self.load_call().await?;
        if let Some(reason) = self.service.check_start_request(self.req) {
            info!(call_id = %call.id, reason = reason.as_str(), "call not answered by a person");
            call.mark_errored(reason, retry_wait(self.assets, &call), Utc::now());
            save_call(self.rt, &call).await?;
            return self.service.write_empty_response("call not answered by a person");
        }
        let trigger: Trigger = match call.trigger.clone() {
            Some(value) => serde_json::from_value(value)?,
            None => return self.service.write_error_response("call has no trigger"),
        };

        let Some(lock) = locker::lock_contact(self.rt, call.contact_id, TASK_LOCK_WAIT).await? else {
            return self.service.write_error_response("contact is busy");
        };
        let result = self.start_locked(call, trigger).await;
        lock.release().await;
        result
    }

    async fn start_locked(&self, call: Call, trigger: Trigger) -> IvrResult<String> {
        let Some(mut scene) = self.load_scene(call.contact_id, call.clone()).await? else {
            return self.service.write_error_response("contact not found");
        };
        scene.start_session(self.rt, self.assets, trigger, true).await?;
        scene.commit(self.rt, self.assets).await?;
        self.session_response(&scene, &call)
    }

    /// The provider is reporting input for the call's waiting session.
    async fn resume(&self) -> IvrResult<String> {
        if let Some(body) = self.service.preprocess_resume(self.req)? {
            return Ok(body);
        }
        let call = self.load_call().await?;
        let resume = self.service.resume_for_request(self.req)?;
        let resume = self.engine_resume(&call, resume).await?;

        let Some(lock) = locker::lock_contact(self.rt, call.contact_id, TASK_LOCK_WAIT).await? else {
            return self.service.write_error_response("contact is busy");
        };
        let result = self.resume_locked(call, resume).await;
        lock.release().await;
        result
    }

    async fn resume_locked(&self, call: Call, resume: Resume) -> IvrResult<String> {
        let Some(mut scene) = self.load_scene(call.contact_id, call.clone()).await? else {
            return self.service.write_error_response("contact not found");
        };
        let Some(session_uuid) = scene.db_contact().current_session_uuid else {
            return self.service.write_empty_response("no active session");
        };
        let row = self.rt.db.load_session(self.assets.org_id(), session_uuid).await?;
        let Some(row) = row.filter(|r| r.session_type == FlowType::Voice && r.call_id == Some(call.id))
        else {
            return self.service.write_empty_response("no session for this call");
        };

        if !runner::resume_session(self.rt, self.assets, &mut scene, &row, resume).await? {
            return self.service.write_empty_response("session no longer waiting");
        }
        self.session_response(&scene, &call)
    }

    async fn engine_resume(&self, call: &Call, resume: IvrResume) -> IvrResult<Resume> {
        let channel = ChannelRef {
            uuid: self.channel.uuid,
            name: self.channel.name.clone(),
        };
        let msg = |text: String, attachments: Vec<String>| Resume::Msg {
            msg: MsgIn {
                uuid: MsgUUID::new(),
                urn: None,
                channel: Some(channel.clone()),
                text,
                attachments,
                external_id: call.external_id.clone(),
            },
        };
        Ok(match resume {
            IvrResume::Input { digits } => msg(digits, vec![]),
            IvrResume::Recording { url } => {
                let media = self.service.download_media(self.channel, &url).await?;
                msg(String::new(), vec![format!("{}:{}", media.content_type, media.url)])
            }
            IvrResume::Dial { status, duration } => Resume::Dial { status, duration },
            IvrResume::Timeout => Resume::WaitTimeout {},
        })
    }

    /// The provider is reporting a change in the call's status.
    async fn status(&self) -> IvrResult<String> {
        if let Some(body) = self.service.preprocess_status(self.req)? {
            return Ok(body);
        }
        let external_id = self.service.call_id_for_request(self.req)?;
        let Some(mut call) = self
            .rt
            .db
            .load_call_by_external_id(self.channel.id, &external_id)
            .await?
        else {
            return self.service.write_empty_response("unknown call");
        };
        if call.status.is_done() {
            return self.service.write_empty_response("call already ended");
        }

        let update = self.service.status_for_request(self.req);
        let now = Utc::now();
        match update.status {
            CallStatus::InProgress => call.mark_in_progress(now),
            CallStatus::Completed => call.mark_completed(update.duration, now),
            CallStatus::Errored => {
                let wait = match call.direction {
                    CallDirection::Outgoing => retry_wait(self.assets, &call),
                    CallDirection::Incoming => None,
                };
                call.mark_errored(update.error.unwrap_or(CallError::Provider), wait, now);
            }
            CallStatus::Failed => call.mark_failed(now),
            _ => return self.service.write_empty_response("status noted"),
        }
        debug!(call_id = %call.id, status = call.status.as_str(), "call status updated");
        save_call(self.rt, &call).await?;
        self.service.write_empty_response("status updated")
    }

    /// A contact is calling us. Known contacts start the flow of the
    /// channel's incoming call trigger; anyone else is rejected.
    async fn incoming(&self) -> IvrResult<String> {
        let urn = self.service.urn_for_request(self.req)?;
        let external_id = self.service.call_id_for_request(self.req)?;
        let org_id = self.assets.org_id();
        let Some(contact_id) = self
            .rt
            .db
            .load_contact_ids_by_urns(org_id, std::slice::from_ref(&urn))
            .await?
            .first()
            .copied()
        else {
            debug!(%urn, "incoming call from unknown contact, rejecting");
            return self.service.write_reject_response();
        };

        let Some(lock) = locker::lock_contact(self.rt, contact_id, TASK_LOCK_WAIT).await? else {
            return self.service.write_error_response("contact is busy");
        };
        let result = self.incoming_locked(contact_id, &urn, &external_id).await;
        lock.release().await;
        result
    }

    async fn incoming_locked(
        &self,
        contact_id: ContactID,
        urn: &URN,
        external_id: &str,
    ) -> IvrResult<String> {
        let contacts = self.rt.db.load_contacts(self.assets.org_id(), &[contact_id]).await?;
        let Some(contact) = contacts.first() else {
            return self.service.write_reject_response();
        };
        let Some(urn_row) = contact.urns.iter().find(|u| u.urn.identity() == urn.identity()) else {
            return self.service.write_reject_response();
        };
        let Some(flow) = triggers::find_channel_trigger(
            self.assets,
            ChannelEventType::IncomingCall,
            self.channel.id,
            contact,
            None,
        )
        .and_then(|m| self.assets.flow_by_id(m.trigger.flow_id)) else {
            debug!(%contact_id, "no incoming call trigger, rejecting");
            return self.service.write_reject_response();
        };

        let trigger = Trigger::Channel {
            flow: FlowRef::from(flow),
            event: ChannelEventType::IncomingCall,
            channel: ChannelRef {
                uuid: self.channel.uuid,
                name: self.channel.name.clone(),
            },
            extra: BTreeMap::new(),
        };
        let now = Utc::now();
        let mut call = Call::new_outgoing(
            self.assets.org_id(),
            self.channel.id,
            contact_id,
            urn_row.id,
            Some(serde_json::to_value(&trigger)?),
            now,
        );
        call.direction = CallDirection::Incoming;
        call.mark_wired(external_id, now);
        call.mark_in_progress(now);
        let mut tx = self.rt.db.begin().await?;
        call.id = tx.insert_call(&call).await?;
        tx.commit().await?;

        self.start_locked(call, trigger).await
    }
}

#[cfg(test)]
mod tests {
    use mailroom_models::{CONFIG_MAX_CONCURRENT_CALLS, SessionStatus};

    use super::*;
    use crate::test_support::{self, ANN, BOB, ORG, TWILIO, VOICE_FLOW};

    fn voice_trigger(flow: &Flow) -> impl Fn(&FlowContact) -> Trigger + use<> {
        let flow = FlowRef::from(flow);
        move |_| Trigger::Manual {
            flow: flow.clone(),
            params: None,
            user: None,
        }
    }

    async fn call_ann(fx: &test_support::Fixture) -> Call {
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let flow = assets.flow_by_id(VOICE_FLOW).unwrap();
        let mut calls = request_calls(&fx.rt, &assets, &[ANN], flow, voice_trigger(flow))
            .await
            .unwrap();
        calls.remove(0)
    }

    fn stored(fx: &test_support::Fixture, id: CallID) -> Call {
        fx.mem.snapshot().calls[&id].clone()
    }

    async fn callback(
        fx: &test_support::Fixture,
        action: CallbackAction,
        call: Option<&Call>,
        form: &[(&str, &str)],
    ) -> CallbackResponse {
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let channel = assets.channel_by_id(TWILIO).unwrap();
        let mut req = CallbackRequest {
            url: callback_url(&fx.rt, channel, action, call.map(|c| c.id)),
            form: form
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        };
        if let Some(call) = call {
            req.query.insert("call_id".to_string(), call.id.to_string());
        }
        req.signature = Some(twiml::request_signature("sesame", &req.url, &req.form).unwrap());
        handle_callback(&fx.rt, channel.uuid, action, &req).await.unwrap()
    }

    #[tokio::test]
    async fn test_requested_calls_are_wired() {
        let fx = test_support::fixture().await;
        let call = call_ann(&fx).await;

        let saved = stored(&fx, call.id);
        assert_eq!(saved.status, CallStatus::Wired);
        assert_eq!(saved.external_id.as_deref(), Some("CA-1"));
        assert_eq!(saved.direction, CallDirection::Outgoing);
        let requested = fx.ivr.requested();
        assert_eq!(requested.len(), 1);
        assert!(requested[0].1.start_url.ends_with(&format!("/start?call_id={}", call.id)));
    }

    #[tokio::test]
    async fn test_calls_over_channel_limit_are_throttled() {
        let fx = test_support::fixture().await;
        fx.mem.seed(|store| {
            let channel = store
                .org_rows(ORG)
                .channels
                .iter_mut()
                .find(|c| c.id == TWILIO)
                .unwrap();
            channel
                .config
                .insert(CONFIG_MAX_CONCURRENT_CALLS.to_string(), serde_json::json!(1));
        });
        fx.rt.assets.flush();

        let first = call_ann(&fx).await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let flow = assets.flow_by_id(VOICE_FLOW).unwrap();
        let second = request_calls(&fx.rt, &assets, &[BOB], flow, voice_trigger(flow))
            .await
            .unwrap()
            .remove(0);
        assert_eq!(stored(&fx, first.id).status, CallStatus::Wired);
        assert_eq!(stored(&fx, second.id).status, CallStatus::Throttled);

        // once the first call ends the throttled one goes out
        let mut done = stored(&fx, first.id);
        done.mark_completed(30, Utc::now());
        save_call(&fx.rt, &done).await.unwrap();
        assert_eq!(reconcile_throttled(&fx.rt).await.unwrap(), 1);
        assert_eq!(stored(&fx, second.id).status, CallStatus::Wired);
    }

    #[tokio::test]
    async fn test_failed_request_fails_call() {
        let fx = test_support::fixture().await;
        fx.ivr.fail_requests(true);
        let call = call_ann(&fx).await;
        assert_eq!(stored(&fx, call.id).status, CallStatus::Failed);
    }

    #[tokio::test]
    async fn test_machine_answer_errors_call_and_hangs_up() {
        let fx = test_support::fixture().await;
        let call = call_ann(&fx).await;

        let resp = callback(
            &fx,
            CallbackAction::Start,
            Some(&call),
            &[("CallSid", "CA-1"), ("AnsweredBy", "machine_start")],
        )
        .await;
        assert!(resp.body.contains("<Hangup/>"));

        let saved = stored(&fx, call.id);
        assert_eq!(saved.status, CallStatus::Errored);
        assert_eq!(saved.error_reason, Some(CallError::Machine));
        assert!(saved.next_attempt.is_some_and(|t| t > Utc::now()));
        assert!(fx.mem.contact(ANN).unwrap().current_session_uuid.is_none());
    }

    #[tokio::test]
    async fn test_start_and_resume_voice_session() {
        let fx = test_support::fixture().await;
        let call = call_ann(&fx).await;

        let resp = callback(
            &fx,
            CallbackAction::Start,
            Some(&call),
            &[("CallSid", "CA-1"), ("AnsweredBy", "human")],
        )
        .await;
        assert_eq!(resp.content_type, "text/xml");
        assert!(resp.body.contains("<Say"));
        assert!(resp.body.contains("Press 1"));
        assert!(resp.body.contains("<Gather"));

        let contact = fx.mem.contact(ANN).unwrap();
        let session_uuid = contact.current_session_uuid.unwrap();
        let session = fx.mem.session(session_uuid).unwrap();
        assert_eq!(session.session_type, FlowType::Voice);
        assert_eq!(session.call_id, Some(call.id));
        assert_eq!(stored(&fx, call.id).status, CallStatus::InProgress);

        let resp = callback(
            &fx,
            CallbackAction::Handle,
            Some(&call),
            &[("CallSid", "CA-1"), ("wait_type", "gather"), ("Digits", "1")],
        )
        .await;
        assert!(resp.body.contains("Thanks"));
        assert!(resp.body.contains("<Hangup/>"));
        assert_eq!(
            fx.mem.session(session_uuid).unwrap().status,
            SessionStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_status_callback_completes_call() {
        let fx = test_support::fixture().await;
        let call = call_ann(&fx).await;
        callback(
            &fx,
            CallbackAction::Status,
            None,
            &[("CallSid", "CA-1"), ("CallStatus", "completed"), ("CallDuration", "42")],
        )
        .await;
        let saved = stored(&fx, call.id);
        assert_eq!(saved.status, CallStatus::Completed);
        assert_eq!(saved.duration, 42);
    }

    #[tokio::test]
    async fn test_errored_calls_are_retried() {
        let fx = test_support::fixture().await;
        let call = call_ann(&fx).await;
        callback(
            &fx,
            CallbackAction::Status,
            None,
            &[("CallSid", "CA-1"), ("CallStatus", "no-answer")],
        )
        .await;
        let errored = stored(&fx, call.id);
        assert_eq!(errored.status, CallStatus::Errored);
        assert_eq!(errored.error_reason, Some(CallError::NoAnswer));

        assert_eq!(retry_calls(&fx.rt, Utc::now()).await.unwrap(), 0);
        let later = errored.next_attempt.unwrap() + chrono::Duration::seconds(1);
        assert_eq!(retry_calls(&fx.rt, later).await.unwrap(), 1);
        let retried = stored(&fx, call.id);
        assert_eq!(retried.status, CallStatus::Wired);
        assert_eq!(retried.external_id.as_deref(), Some("CA-2"));
    }

    #[tokio::test]
    async fn test_incoming_call_from_unknown_number_is_rejected() {
        let fx = test_support::fixture().await;
        let resp = callback(
            &fx,
            CallbackAction::Incoming,
            None,
            &[("CallSid", "CA-9"), ("From", "+19995550000")],
        )
        .await;
        assert!(resp.body.contains("<Reject"));
        assert!(fx.mem.snapshot().calls.is_empty());
    }

    #[test]
    fn test_redact_hides_secrets() {
        assert_eq!(
            redact("auth sekrit failed", &["sekrit".to_string(), String::new()]),
            "auth ******** failed"
        );
    }
}
