//! The narrow, transactional, ordered KV interface the allocator requires.
//! A concrete engine (e.g. `buddy-store`'s `fjall` adapter) implements this;
//! the allocator never depends on the engine directly. Dynamic dispatch is
//! used here deliberately — transactions are opened once per controller
//! cycle, never in a per-request hot loop, so a v-table is free.

use std::fmt;

/// Opaque wrapper around the underlying store engine's own error type.
#[derive(Debug)]
pub struct StoreError(pub Box<dyn std::error::Error + Send + Sync + 'static>);

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "metadata store error: {}", self.0)
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

impl StoreError {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(Box::new(err))
    }
}

/// A durable, ordered KV store with transactions and prefix cursors.
pub trait MetadataStore: Send + Sync {
    /// Opens a read-write transaction. The caller commits or aborts it
    /// explicitly; dropping it without either is treated as an abort by
    /// implementations, but callers should not rely on that.
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StoreError>;

    /// Opens a read-only transaction for `get`/`has`-style lookups.
    fn begin_read(&self) -> Result<Box<dyn Transaction + '_>, StoreError> {
        self.begin()
    }
}

/// A single transaction against the metadata store.
///
/// All cursor-borrowed bytes are copied into caller memory (`Vec<u8>`, not
/// borrowed slices) before any other call — the allocator never holds a
/// cursor across a commit.
pub trait Transaction {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError>;

    /// Returns the lexicographically smallest key `>= prefix`, or `None` if
    /// none exists. The caller is responsible for checking the returned key
    /// still starts with `prefix`.
    fn seek_ge(&mut self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;
    fn abort(self: Box<Self>) -> Result<(), StoreError>;
}
