use mailroom_models::{CallUUID, Flow, FlowID, FlowUUID, Org, SessionStatus};

use crate::{Event, FlowContact, Modifier, Resume, Session, Sprint, Trigger};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("flow {0} not found")]
    FlowNotFound(FlowUUID),
    #[error("flow {0} has an invalid definition: {1}")]
    InvalidDefinition(FlowUUID, String),
    #[error("session is {0} and can't be resumed")]
    NotWaiting(SessionStatus),
    #[error("resume of type {0} not valid for the current wait")]
    InvalidResume(&'static str),
    #[error("invalid query '{query}': {reason}")]
    InvalidQuery { query: String, reason: String },
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::FlowNotFound(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// The assets a session runs against. All lookups in one sprint resolve
/// against the same snapshot.
pub trait SessionAssets: Send + Sync {
    fn org(&self) -> &Org;
    fn flow_by_uuid(&self, uuid: FlowUUID) -> Option<&Flow>;
    fn flow_by_id(&self, id: FlowID) -> Option<&Flow>;
}

/// The flow engine the core drives. Given a trigger or resume it returns the
/// new session state and the sprint of events it produced.
#[async_trait::async_trait]
pub trait FlowEngine: Send + Sync {
    async fn start(
        &self,
        assets: &dyn SessionAssets,
        contact: FlowContact,
        trigger: Trigger,
        call: Option<CallUUID>,
    ) -> EngineResult<(Session, Sprint)>;

    async fn resume(
        &self,
        assets: &dyn SessionAssets,
        session: Session,
        contact: FlowContact,
        resume: Resume,
    ) -> EngineResult<(Session, Sprint)>;

    fn apply_modifier(
        &self,
        _assets: &dyn SessionAssets,
        contact: &mut FlowContact,
        modifier: &Modifier,
    ) -> Vec<Event> {
        modifier.apply(contact)
    }

    fn contact_matches_query(&self, contact: &FlowContact, query: &str) -> EngineResult<bool>;
}
