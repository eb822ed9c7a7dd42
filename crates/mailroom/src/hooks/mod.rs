//! Commit hooks.
//!
//! Handlers never write anything themselves: they attach typed payloads to
//! hooks on the scene. At commit time every hook runs once for the whole
//! batch of scenes, receiving each scene together with the payloads it
//! attached, so writes coalesce into one multi-row statement per hook.
//!
//! Pre-commit hooks run inside the commit transaction in ascending
//! [`PreCommitHook::ORDER`]; ties keep registration order. Post-commit hooks
//! run after the transaction commits and are best-effort.

pub mod campaigns;
pub mod contacts;
pub mod msgs;
pub mod sessions;
pub mod tickets;

use std::collections::HashSet;
use std::sync::LazyLock;

use mailroom_core_backend::{BackendError, CoreTx};
use mailroom_flows::EngineError;
use mailroom_kv_backend::KvError;

use crate::assets::OrgAssets;
use crate::runtime::Runtime;
use crate::scene::Scene;

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Queue(#[from] crate::queues::QueueError),
    #[error("{0}")]
    Message(String),
}

impl HookError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Backend(err) => err.is_not_found(),
            Self::Engine(err) => err.is_not_found(),
            _ => false,
        }
    }
}

pub type HookResult<T> = Result<T, HookError>;

/// A scene paired with the payloads it attached to one hook.
pub type SceneBatch<'a, P> = [(&'a Scene, &'a [P])];

/// A hook applied inside the commit transaction.
#[async_trait::async_trait]
pub trait PreCommitHook: Send + Sync + 'static {
    type Payload: Send + Sync + 'static;

    const NAME: &'static str;
    const ORDER: i32;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        rt: &Runtime,
        assets: &OrgAssets,
        scenes: &SceneBatch<'_, Self::Payload>,
    ) -> HookResult<()>;
}

/// A hook applied once the commit transaction has landed.
#[async_trait::async_trait]
pub trait PostCommitHook: Send + Sync + 'static {
    type Payload: Send + Sync + 'static;

    const NAME: &'static str;
    const ORDER: i32;

    async fn execute(
        &self,
        rt: &Runtime,
        assets: &OrgAssets,
        scenes: &SceneBatch<'_, Self::Payload>,
    ) -> HookResult<()>;
}

/// Object-safe face of a [`PreCommitHook`]. `run` returns whether any scene
/// had payloads, i.e. whether the hook actually executed.
#[async_trait::async_trait]
pub(crate) trait ErasedPreHook: Send + Sync {
    fn name(&self) -> &'static str;
    fn order(&self) -> i32;
    async fn run(
        &self,
        tx: &mut dyn CoreTx,
        rt: &Runtime,
        assets: &OrgAssets,
        scenes: &[&Scene],
    ) -> HookResult<bool>;
}

#[async_trait::async_trait]
pub(crate) trait ErasedPostHook: Send + Sync {
    fn name(&self) -> &'static str;
    fn order(&self) -> i32;
    async fn run(&self, rt: &Runtime, assets: &OrgAssets, scenes: &[&Scene]) -> HookResult<bool>;
}

struct Pre<H>(H);
struct Post<H>(H);

#[async_trait::async_trait]
impl<H: PreCommitHook> ErasedPreHook for Pre<H> {
    fn name(&self) -> &'static str {
        H::NAME
    }

    fn order(&self) -> i32 {
        H::ORDER
    }

    async fn run(
        &self,
        tx: &mut dyn CoreTx,
        rt: &Runtime,
        assets: &OrgAssets,
        scenes: &[&Scene],
    ) -> HookResult<bool> {
        let batch: Vec<(&Scene, &[H::Payload])> = scenes
            .iter()
            .filter_map(|scene| scene.pre_payloads::<H>().map(|p| (*scene, p)))
            .collect();
        if batch.is_empty() {
            return Ok(false);
        }
        self.0.execute(tx, rt, assets, &batch).await?;
        Ok(true)
    }
}

#[async_trait::async_trait]
impl<H: PostCommitHook> ErasedPostHook for Post<H> {
    fn name(&self) -> &'static str {
        H::NAME
    }

    fn order(&self) -> i32 {
        H::ORDER
    }

    async fn run(&self, rt: &Runtime, assets: &OrgAssets, scenes: &[&Scene]) -> HookResult<bool> {
        let batch: Vec<(&Scene, &[H::Payload])> = scenes
            .iter()
            .filter_map(|scene| scene.post_payloads::<H>().map(|p| (*scene, p)))
            .collect();
        if batch.is_empty() {
            return Ok(false);
        }
        self.0.execute(rt, assets, &batch).await?;
        Ok(true)
    }
}

pub(crate) fn pre<H: PreCommitHook>(hook: H) -> Box<dyn ErasedPreHook> {
    Box::new(Pre(hook))
}

pub(crate) fn post<H: PostCommitHook>(hook: H) -> Box<dyn ErasedPostHook> {
    Box::new(Post(hook))
}

trait Registered {
    fn registered_name(&self) -> &'static str;
    fn registered_order(&self) -> i32;
}

impl Registered for Box<dyn ErasedPreHook> {
    fn registered_name(&self) -> &'static str {
        self.name()
    }
    fn registered_order(&self) -> i32 {
        self.order()
    }
}

impl Registered for Box<dyn ErasedPostHook> {
    fn registered_name(&self) -> &'static str {
        self.name()
    }
    fn registered_order(&self) -> i32 {
        self.order()
    }
}

/// Validate a registration list and sort it by order. Registering two hooks
/// under one name is a programming error.
fn build_registry<T: Registered>(mut hooks: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::new();
    for hook in &hooks {
        if !seen.insert(hook.registered_name()) {
            panic!("hook {} registered twice", hook.registered_name());
        }
    }
    // stable, so equal orders keep registration order
    hooks.sort_by_key(Registered::registered_order);
    hooks
}

static PRE_HOOKS: LazyLock<Vec<Box<dyn ErasedPreHook>>> = LazyLock::new(|| {
    build_registry(vec![
        pre(sessions::InterruptContacts),
        pre(sessions::InterruptSessions),
        pre(sessions::InterruptRuns),
        pre(sessions::CommitSessions),
        pre(sessions::UpdateContactSession),
        pre(contacts::UpdateContactName),
        pre(contacts::UpdateContactLanguage),
        pre(contacts::UpdateContactStatus),
        pre(contacts::UpdateContactLastSeenOn),
        pre(contacts::UpdateContactFields),
        pre(contacts::UpdateContactGroups),
        pre(contacts::UpdateContactURNs),
        pre(contacts::RecalculateSmartGroups),
        pre(msgs::InsertMessages),
        pre(tickets::InsertTickets),
        pre(tickets::UpdateTickets),
        pre(tickets::UpdateTicketActivity),
        pre(msgs::InsertHttpLogs),
        pre(msgs::InsertAirtimeTransfers),
        pre(msgs::AddMessageLabels),
        pre(msgs::DeleteMessages),
        pre(sessions::UpdateCallStatus),
        pre(crate::stats::UpdateFlowStats),
        pre(crate::webhooks::UnsubscribeResthooks),
        pre(contacts::UpdateContactModifiedOn),
        pre(campaigns::UpdateCampaignFires),
        pre(msgs::MarkMsgsHandled),
    ])
});

static POST_HOOKS: LazyLock<Vec<Box<dyn ErasedPostHook>>> = LazyLock::new(|| {
    build_registry(vec![
        post(msgs::SendMessages),
        post(msgs::CreateBroadcasts),
        post(tickets::QueueTicketClosed),
        post(msgs::IncrementWarnings),
        post(crate::webhooks::MonitorWebhooks),
    ])
});

pub(crate) fn pre_hooks() -> &'static [Box<dyn ErasedPreHook>] {
    &PRE_HOOKS
}

pub(crate) fn post_hooks() -> &'static [Box<dyn ErasedPostHook>] {
    &POST_HOOKS
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop<const N: i32>;

    #[async_trait::async_trait]
    impl<const N: i32> PreCommitHook for Noop<N> {
        type Payload = ();
        const NAME: &'static str = "noop";
        const ORDER: i32 = N;

        async fn execute(
            &self,
            _tx: &mut dyn CoreTx,
            _rt: &Runtime,
            _assets: &OrgAssets,
            _scenes: &SceneBatch<'_, ()>,
        ) -> HookResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_is_sorted_by_order() {
        let orders: Vec<i32> = pre_hooks().iter().map(|h| h.order()).collect();
        let mut sorted = orders.clone();
        sorted.sort();
        assert_eq!(orders, sorted);
        assert_eq!(pre_hooks().first().map(|h| h.name()), Some("interrupt_contacts"));
        assert_eq!(pre_hooks().last().map(|h| h.name()), Some("mark_msgs_handled"));
    }

    #[test]
    fn test_equal_orders_keep_registration_order() {
        let names: Vec<&str> = pre_hooks()
            .iter()
            .filter(|h| h.order() == 0)
            .map(|h| h.name())
            .collect();
        assert_eq!(
            names,
            vec!["interrupt_contacts", "interrupt_sessions", "interrupt_runs"]
        );
    }

    #[test]
    fn test_hook_names_are_unique() {
        let mut names = HashSet::new();
        for hook in pre_hooks() {
            assert!(names.insert(hook.name()), "duplicate {}", hook.name());
        }
        for hook in post_hooks() {
            assert!(names.insert(hook.name()), "duplicate {}", hook.name());
        }
    }

    #[test]
    #[should_panic(expected = "hook noop registered twice")]
    fn test_duplicate_registration_panics() {
        build_registry(vec![pre(Noop::<1>), pre(Noop::<2>)]);
    }
}
