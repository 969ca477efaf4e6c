//! orch-state — durable invocation log and deployment records.
//!
//! Backed by [redb](https://docs.rs/redb). Every state transition of an
//! invocation is one write transaction, so readers never observe a torn
//! record, and the store itself rejects writes that would break the
//! `PENDING → IN_PROGRESS → SUCCESS | FAILED` lifecycle.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
