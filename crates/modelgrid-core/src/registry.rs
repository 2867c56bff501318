//! Model-registry collaborator seam.
//!
//! The experiment/workspace CRUD layer that records trained model versions
//! lives outside this control plane. The deployment orchestrator only needs
//! to resolve "workspace W at version N" into framework/runtime facts, so
//! the seam is a narrow trait with an in-memory implementation seeded from
//! config (and used directly by tests).

use std::collections::HashMap;
use std::sync::RwLock;

/// A model version recorded by the (external) registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredModel {
    pub workspace_id: String,
    pub version: u32,
    /// Training framework, e.g. "sklearn", "tensorflow".
    pub framework: String,
    /// Runtime tag the serving image is selected by, e.g. "py311".
    pub runtime: String,
}

/// Resolves a workspace's registered model versions.
pub trait ModelRegistry: Send + Sync {
    /// Resolve a specific version, or the latest one when `version` is None.
    /// Returns None when the workspace has no matching registration.
    fn resolve(&self, workspace_id: &str, version: Option<u32>) -> Option<RegisteredModel>;
}

/// In-memory registry keyed by workspace id.
#[derive(Default)]
pub struct StaticRegistry {
    models: RwLock<HashMap<String, Vec<RegisteredModel>>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a model version. Re-registering the same version replaces it.
    pub fn register(&self, model: RegisteredModel) {
        let mut models = self.models.write().expect("registry lock poisoned");
        let versions = models.entry(model.workspace_id.clone()).or_default();
        versions.retain(|m| m.version != model.version);
        versions.push(model);
    }
}

impl ModelRegistry for StaticRegistry {
    fn resolve(&self, workspace_id: &str, version: Option<u32>) -> Option<RegisteredModel> {
        let models = self.models.read().expect("registry lock poisoned");
        let versions = models.get(workspace_id)?;
        match version {
            Some(v) => versions.iter().find(|m| m.version == v).cloned(),
            None => versions.iter().max_by_key(|m| m.version).cloned(),
        }
    }
}
