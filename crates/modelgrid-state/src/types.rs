//! Persisted domain types for the Modelgrid state store.
//!
//! `Deployment` rows are append-only history: created at orchestration
//! start, mutated only through the orchestrator's status-update step, never
//! deleted. `ServiceInstance` rows mirror live backend resources and are
//! kept eventually consistent by the reconciler.

use serde::{Deserialize, Serialize};

use modelgrid_core::{ServiceKind, ServiceState};

/// Unique identifier of a workspace (the lock key).
pub type WorkspaceId = String;

/// Identifier generated per deployment attempt.
pub type DeploymentId = String;

// ── Deployment ────────────────────────────────────────────────────

/// One attempt to serve a specific model version for a workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub workspace_id: WorkspaceId,
    pub deployment_id: DeploymentId,
    /// Model version being served.
    pub version: u32,
    pub status: DeploymentStatus,
    pub created_by: String,
    /// Unix timestamp (seconds) when this attempt was recorded.
    pub created_at: u64,
}

/// Deployment lifecycle. `Running` and `Failed` are terminal; a workspace's
/// active deployment is superseded by a later attempt, never transitioned
/// in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Failed,
}

impl Deployment {
    /// Build the composite key for the deployments table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.workspace_id, self.deployment_id)
    }
}

// ── Service instance ──────────────────────────────────────────────

/// A development workload (notebook/IDE) owned by a user.
///
/// Persisted independently of the live backend so listing never requires a
/// backend round-trip; the reconciler repairs drift.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceInstance {
    pub name: String,
    pub kind: ServiceKind,
    pub state: ServiceState,
    pub runtime: Option<String>,
    pub cpus: Option<f64>,
    pub memory_gb: Option<f64>,
    #[serde(default)]
    pub packages: Vec<String>,
    pub username: String,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Deployment lock ───────────────────────────────────────────────

/// Mutual-exclusion record guarding concurrent deployments of a workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentLock {
    pub workspace_id: WorkspaceId,
    pub version: u32,
    pub acquired_at: u64,
}
