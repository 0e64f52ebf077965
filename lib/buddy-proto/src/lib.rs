//! Message/reply records exchanged between workers and the controller, and
//! the per-worker pending-request table.

pub mod messages;
pub mod pending;

pub use messages::{ErrorCode, Hash, Reply, Request, RequestHeader, RequestKind};
pub use pending::{PendingEntry, PendingTable};
