use snafu::Snafu;

use crate::data_file::DataFileError;
use crate::metadata::InvalidMetadata;
use crate::store::StoreError;

/// Allocator failure taxonomy (spec.md §4.D.5 / §7).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AllocatorError {
    #[snafu(display("block not found"))]
    BlockNotFound,

    #[snafu(display("block already exists"))]
    BlockAlreadyExists,

    #[snafu(display("allocation failed: no donor block available after repeated extension"))]
    AllocationFailed,

    #[snafu(display("invalid metadata record: {source}"))]
    InvalidMetadataRecord { source: InvalidMetadata },

    #[snafu(display("corrupt free/temp list key: {key:?}"))]
    CorruptKey { key: Vec<u8> },

    #[snafu(display("metadata store failure: {source}"))]
    Store { source: StoreError },

    #[snafu(display("data file failure: {source}"))]
    DataFile { source: DataFileError },

    #[snafu(display("invariant violated: {detail}"))]
    InvariantViolation { detail: String },
}

impl AllocatorError {
    /// Maps to the error-code taxonomy exposed in `error_result` (spec.md §4.E).
    pub fn code(&self) -> &'static str {
        match self {
            AllocatorError::BlockNotFound => "block-not-found",
            AllocatorError::BlockAlreadyExists => "block-already-exists",
            AllocatorError::AllocationFailed => "allocation-failed",
            AllocatorError::InvalidMetadataRecord { .. }
            | AllocatorError::CorruptKey { .. }
            | AllocatorError::Store { .. }
            | AllocatorError::DataFile { .. }
            | AllocatorError::InvariantViolation { .. } => "internal",
        }
    }
}
