//! modelgrid-instance — development-workload lifecycle and reconciliation.
//!
//! Drives notebook/IDE instances through the same persist → provision →
//! start → converge shape as deployments, minus the workspace lock (the
//! kind+owner-derived name is the natural exclusion boundary). The
//! [`Reconciler`] is the self-healing half: it repairs drift between the
//! persisted instance rows and the backend's live inventory, best-effort
//! and fire-and-forget.

pub mod controller;
pub mod error;
pub mod reconciler;

pub use controller::{CreateInstanceRequest, InstanceController};
pub use error::{InstanceError, InstanceResult};
pub use reconciler::Reconciler;
