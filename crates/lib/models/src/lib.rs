//! Data model for the mailroom core.
//!
//! These types mirror the rows the backends persist. They carry no behaviour
//! beyond parsing, formatting and small invariants (URN identity, fire scopes,
//! status transitions) that every layer relies on.

mod call;
mod campaign;
mod channel;
mod contact;
mod fire;
mod flow;
mod ids;
mod msg;
mod org;
mod session;
mod start;
mod ticket;
mod trigger;
mod urn;
pub mod uuids;

pub use self::call::*;
pub use self::campaign::*;
pub use self::channel::*;
pub use self::contact::*;
pub use self::fire::*;
pub use self::flow::*;
pub use self::ids::*;
pub use self::msg::*;
pub use self::org::*;
pub use self::session::*;
pub use self::start::*;
pub use self::ticket::*;
pub use self::trigger::*;
pub use self::urn::*;
