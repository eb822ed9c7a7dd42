//! The contract between the mailroom core and a flow engine.
//!
//! The core never interprets flow definitions itself: it hands the engine a
//! contact plus a [`Trigger`] or [`Resume`], and gets back a [`Session`] and
//! the [`Sprint`] of events it produced. [`basic::BasicEngine`] implements the
//! contract for a small subset of node types.

pub mod basic;
mod contact;
mod engine;
mod events;
mod modifiers;
pub mod query;
mod session;
mod trigger;

pub use self::contact::*;
pub use self::engine::*;
pub use self::events::*;
pub use self::modifiers::*;
pub use self::session::*;
pub use self::trigger::*;
