//! orch-blueprints — versioned blueprint store.
//!
//! Each blueprint is one git repository named `<prefix><uuid>`. Every save
//! commits a full snapshot of the content tree to the configured branch and
//! tags it `v<major>.<minor>`. Concurrent writers are resolved by letting
//! git reject the losing push and retrying from a fresh clone until the
//! save deadline.

pub mod error;
pub mod retry;
pub mod store;
pub mod tree;

pub use error::{StoreError, StoreResult};
pub use retry::RetryPolicy;
pub use store::{BlueprintStore, SavedRevision, Version};
pub use tree::copy_tree;
