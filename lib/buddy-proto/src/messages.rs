//! Worker<->controller messages (spec.md §4.E, §4.F). Every payload is
//! by-value and small (well under 80 bytes) — no heap ownership crosses the
//! mailbox boundary (spec.md §5).

use buddy_core::SizeClass;

pub type Hash = [u8; 32];

/// Identifies which worker sent a request and which of its in-flight
/// requests it corresponds to. `request_id` is worker-local and monotonic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestHeader {
    pub worker_id: u16,
    pub request_id: u64,
}

/// The five request kinds, in the controller's fixed per-cycle execution
/// order (spec.md §4.F): reads first, then release/allocate/occupy/has.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    GetAddress,
    Release,
    Allocate,
    Occupy,
    HasBlock,
}

impl RequestKind {
    pub const EXECUTION_ORDER: [RequestKind; 5] = [
        RequestKind::GetAddress,
        RequestKind::Release,
        RequestKind::Allocate,
        RequestKind::Occupy,
        RequestKind::HasBlock,
    ];
}

#[derive(Clone, Copy, Debug)]
pub enum Request {
    AllocateBlock {
        header: RequestHeader,
        class: SizeClass,
    },
    OccupyBlock {
        header: RequestHeader,
        hash: Hash,
        class: SizeClass,
        block_num: u64,
        data_size: u64,
    },
    ReleaseBlock {
        header: RequestHeader,
        hash: Hash,
    },
    GetAddress {
        header: RequestHeader,
        hash: Hash,
    },
    HasBlock {
        header: RequestHeader,
        hash: Hash,
    },
}

impl Request {
    pub fn header(&self) -> RequestHeader {
        match *self {
            Request::AllocateBlock { header, .. }
            | Request::OccupyBlock { header, .. }
            | Request::ReleaseBlock { header, .. }
            | Request::GetAddress { header, .. }
            | Request::HasBlock { header, .. } => header,
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Request::AllocateBlock { .. } => RequestKind::Allocate,
            Request::OccupyBlock { .. } => RequestKind::Occupy,
            Request::ReleaseBlock { .. } => RequestKind::Release,
            Request::GetAddress { .. } => RequestKind::GetAddress,
            Request::HasBlock { .. } => RequestKind::HasBlock,
        }
    }
}

/// Error-code taxonomy for `error_result` (spec.md §4.E, §7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    BlockNotFound,
    BlockAlreadyExists,
    AllocationFailed,
    InvalidSize,
    Internal,
}

impl ErrorCode {
    pub fn from_allocator_code(code: &str) -> Self {
        match code {
            "block-not-found" => ErrorCode::BlockNotFound,
            "block-already-exists" => ErrorCode::BlockAlreadyExists,
            "allocation-failed" => ErrorCode::AllocationFailed,
            "invalid-size" => ErrorCode::InvalidSize,
            _ => ErrorCode::Internal,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Reply {
    AllocateResult {
        header: RequestHeader,
        offset: u64,
        class: SizeClass,
        block_num: u64,
    },
    OccupyResult {
        header: RequestHeader,
        offset: u64,
        data_size: u64,
    },
    ReleaseResult {
        header: RequestHeader,
    },
    GetAddressResult {
        header: RequestHeader,
        offset: u64,
        data_size: u64,
    },
    HasBlockResult {
        header: RequestHeader,
        exists: bool,
    },
    ErrorResult {
        header: RequestHeader,
        code: ErrorCode,
    },
}

impl Reply {
    pub fn header(&self) -> RequestHeader {
        match *self {
            Reply::AllocateResult { header, .. }
            | Reply::OccupyResult { header, .. }
            | Reply::ReleaseResult { header }
            | Reply::GetAddressResult { header, .. }
            | Reply::HasBlockResult { header, .. }
            | Reply::ErrorResult { header, .. } => header,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        let header = RequestHeader {
            worker_id: 1,
            request_id: 1,
        };
        assert_eq!(
            Request::GetAddress { header, hash: [0; 32] }.kind(),
            RequestKind::GetAddress
        );
        assert_eq!(
            Request::AllocateBlock {
                header,
                class: SizeClass::K4
            }
            .kind(),
            RequestKind::Allocate
        );
    }

    #[test]
    fn error_code_maps_from_allocator_taxonomy() {
        assert_eq!(ErrorCode::from_allocator_code("block-not-found"), ErrorCode::BlockNotFound);
        assert_eq!(ErrorCode::from_allocator_code("allocation-failed"), ErrorCode::AllocationFailed);
        assert_eq!(ErrorCode::from_allocator_code("kv-failure"), ErrorCode::Internal);
    }
}
