//! modelgrid-state — embedded state store for the Modelgrid control plane.
//!
//! Backed by [redb](https://docs.rs/redb), provides the persisted view of
//! deployments, development instances, and the per-workspace deployment
//! lock.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Deployment rows use composite `{workspace_id}:{deployment_id}` keys so
//! one prefix scan lists a workspace's append-only deployment history.
//!
//! The lock is an atomic conditional insert inside a single write
//! transaction: redb's single-writer discipline makes "check then insert"
//! indivisible, so a second acquisition for the same workspace surfaces as
//! [`StateError::LockConflict`] and the mechanism survives process restarts.
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
