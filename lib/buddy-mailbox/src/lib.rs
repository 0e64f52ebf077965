//! The lock-free SPSC mailbox ring and the per-worker block pool.

pub mod pool;
pub mod ring;

pub use pool::{BlockPool, PoolSet};
pub use ring::{mailbox, Receiver, Sender};
