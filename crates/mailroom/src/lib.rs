//! Mailroom - flow execution and event handling core.
//!
//! A [`scene::Scene`] collects the events of one contact's sprint, handlers
//! turn those events into hook payloads, and [`commit::bulk_commit`] applies
//! the hooks of many scenes in one transaction. The runner, task queues,
//! crons, campaigns and IVR coordination all funnel through that pipeline.

pub mod assets;
pub mod campaigns;
pub mod commit;
pub mod config;
pub mod crons;
pub mod handlers;
pub mod hooks;
pub mod ivr;
pub mod locker;
pub mod po;
pub mod queues;
pub mod recipients;
pub mod runner;
pub mod runtime;
pub mod scene;
pub mod stats;
pub mod tasks;
#[cfg(test)]
pub mod test_support;
pub mod tickets;
pub mod triggers;
pub mod web;
pub mod webhooks;

pub use mailroom_observability_macros::obs;

pub use assets::{AssetsCache, AssetsError, OrgAssets, Refresh};
pub use commit::{CommitError, CommitSummary, bulk_commit};
pub use config::Config;
pub use runtime::Runtime;
pub use scene::{Scene, SceneError, SceneResult};
