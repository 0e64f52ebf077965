//! Size classes, the buddy allocator, and the data-file controller for
//! Buddy Blocks — a content-addressed block storage server.

pub mod allocator;
pub mod data_file;
pub mod error;
pub mod key;
pub mod metadata;
pub mod size_class;
pub mod store;

pub use data_file::{DataFile, DataFileError, FileDataController};
pub use error::AllocatorError;
pub use metadata::BlockMetadata;
pub use size_class::{next_power_of_two, offset, SizeClass};
pub use store::{MetadataStore, StoreError, Transaction};
