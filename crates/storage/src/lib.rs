//! Storage for cyclewm workflow state.
//!
//! The whole workflow is persisted as one JSON snapshot that is replaced
//! atomically on every checkpoint. A lock file next to the snapshot keeps
//! two orchestrators from working on the same store.

#![warn(missing_docs)]

mod lock;
mod store;

pub use lock::StoreLock;
pub use store::{JsonStore, Result, Storage, StoreError};
