//! StateStore — redb-backed state persistence for Modelgrid.
//!
//! Typed operations over deployment history, development instances, and the
//! per-workspace deployment lock. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(LOCKS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Record a new deployment attempt. Rows are append-only history;
    /// re-inserting an existing key overwrites it, which callers avoid by
    /// generating a fresh `deployment_id` per attempt.
    pub fn create_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        let key = deployment.table_key();
        let value = serde_json::to_vec(deployment).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "deployment recorded");
        Ok(())
    }

    /// Get a deployment by workspace and deployment id.
    pub fn get_deployment(
        &self,
        workspace_id: &str,
        deployment_id: &str,
    ) -> StateResult<Option<Deployment>> {
        let key = format!("{workspace_id}:{deployment_id}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let deployment: Deployment =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(deployment))
            }
            None => Ok(None),
        }
    }

    /// List a workspace's deployment history.
    pub fn list_deployments(&self, workspace_id: &str) -> StateResult<Vec<Deployment>> {
        let prefix = format!("{workspace_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let deployment: Deployment =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(deployment);
            }
        }
        results.sort_by_key(|d| d.created_at);
        Ok(results)
    }

    /// The most recent deployment attempt for a workspace, if any.
    ///
    /// Deployment rows are immutable history; the workspace's "active"
    /// deployment is the latest row, not an in-place transition.
    pub fn latest_deployment(&self, workspace_id: &str) -> StateResult<Option<Deployment>> {
        let history = self.list_deployments(workspace_id)?;
        Ok(history.into_iter().last())
    }

    /// Update a deployment's status.
    ///
    /// Only forward transitions out of `Pending` are allowed; a terminal
    /// row never changes again.
    pub fn update_deployment_status(
        &self,
        workspace_id: &str,
        deployment_id: &str,
        status: DeploymentStatus,
    ) -> StateResult<()> {
        let key = format!("{workspace_id}:{deployment_id}");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let mut deployment: Deployment = {
                let guard = table
                    .get(key.as_str())
                    .map_err(map_err!(Read))?
                    .ok_or_else(|| StateError::NotFound(key.clone()))?;
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
            };

            if deployment.status != DeploymentStatus::Pending && deployment.status != status {
                return Err(StateError::InvalidTransition(format!(
                    "{key}: {:?} -> {:?}",
                    deployment.status, status
                )));
            }

            deployment.status = status;
            let value = serde_json::to_vec(&deployment).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, ?status, "deployment status updated");
        Ok(())
    }

    // ── Deployment locks ───────────────────────────────────────────

    /// Acquire the per-workspace deployment lock.
    ///
    /// Atomic conditional insert: the check and the insert happen inside
    /// one write transaction, so a concurrent acquisition for the same
    /// workspace fails with [`StateError::LockConflict`].
    pub fn acquire_lock(&self, workspace_id: &str, version: u32) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            if table
                .get(workspace_id)
                .map_err(map_err!(Read))?
                .is_some()
            {
                return Err(StateError::LockConflict(workspace_id.to_string()));
            }
            let lock = DeploymentLock {
                workspace_id: workspace_id.to_string(),
                version,
                acquired_at: epoch_secs(),
            };
            let value = serde_json::to_vec(&lock).map_err(map_err!(Serialize))?;
            table
                .insert(workspace_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%workspace_id, version, "deployment lock acquired");
        Ok(())
    }

    /// Release the per-workspace deployment lock. Returns true if a lock
    /// was held; releasing an absent lock is a no-op.
    pub fn release_lock(&self, workspace_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            existed = table.remove(workspace_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%workspace_id, existed, "deployment lock released");
        Ok(existed)
    }

    /// Read the current lock for a workspace, if held.
    pub fn get_lock(&self, workspace_id: &str) -> StateResult<Option<DeploymentLock>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
        match table.get(workspace_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let lock: DeploymentLock =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(lock))
            }
            None => Ok(None),
        }
    }

    // ── Service instances ──────────────────────────────────────────

    /// Insert or update a development instance row.
    pub fn put_instance(&self, instance: &ServiceInstance) -> StateResult<()> {
        let value = serde_json::to_vec(instance).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            table
                .insert(instance.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get an instance by name.
    pub fn get_instance(&self, name: &str) -> StateResult<Option<ServiceInstance>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let instance: ServiceInstance =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(instance))
            }
            None => Ok(None),
        }
    }

    /// List all instances owned by a user.
    pub fn list_instances_for_user(&self, username: &str) -> StateResult<Vec<ServiceInstance>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let instance: ServiceInstance =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if instance.username == username {
                results.push(instance);
            }
        }
        Ok(results)
    }

    /// Delete an instance row. Returns true if it existed.
    ///
    /// Called only once the backend resource itself is gone.
    pub fn delete_instance(&self, name: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            existed = table.remove(name).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelgrid_core::{ServiceKind, ServiceState};

    fn test_deployment(workspace: &str, id: &str, created_at: u64) -> Deployment {
        Deployment {
            workspace_id: workspace.to_string(),
            deployment_id: id.to_string(),
            version: 3,
            status: DeploymentStatus::Pending,
            created_by: "alice".to_string(),
            created_at,
        }
    }

    fn test_instance(name: &str, username: &str) -> ServiceInstance {
        ServiceInstance {
            name: name.to_string(),
            kind: ServiceKind::Jupyter,
            state: ServiceState::Running,
            runtime: Some("py311".to_string()),
            cpus: Some(1.0),
            memory_gb: Some(2.0),
            packages: vec![],
            username: username.to_string(),
            created_at: 1000,
            updated_at: 1000,
        }
    }

    // ── Deployment history ─────────────────────────────────────────

    #[test]
    fn deployment_create_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let deployment = test_deployment("c1", "d-1", 1000);

        store.create_deployment(&deployment).unwrap();
        let retrieved = store.get_deployment("c1", "d-1").unwrap();

        assert_eq!(retrieved, Some(deployment));
    }

    #[test]
    fn deployment_get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_deployment("c1", "nope").unwrap().is_none());
    }

    #[test]
    fn deployment_history_is_scoped_and_ordered() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_deployment(&test_deployment("c1", "d-2", 2000)).unwrap();
        store.create_deployment(&test_deployment("c1", "d-1", 1000)).unwrap();
        store.create_deployment(&test_deployment("c2", "d-9", 500)).unwrap();

        let history = store.list_deployments("c1").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].deployment_id, "d-1");
        assert_eq!(history[1].deployment_id, "d-2");

        let latest = store.latest_deployment("c1").unwrap().unwrap();
        assert_eq!(latest.deployment_id, "d-2");
    }

    #[test]
    fn deployment_status_forward_transitions() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_deployment(&test_deployment("c1", "d-1", 1000)).unwrap();

        store
            .update_deployment_status("c1", "d-1", DeploymentStatus::Running)
            .unwrap();
        let deployment = store.get_deployment("c1", "d-1").unwrap().unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Running);
    }

    #[test]
    fn deployment_status_never_regresses() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_deployment(&test_deployment("c1", "d-1", 1000)).unwrap();
        store
            .update_deployment_status("c1", "d-1", DeploymentStatus::Running)
            .unwrap();

        let result = store.update_deployment_status("c1", "d-1", DeploymentStatus::Pending);
        assert!(matches!(result, Err(StateError::InvalidTransition(_))));

        let result = store.update_deployment_status("c1", "d-1", DeploymentStatus::Failed);
        assert!(matches!(result, Err(StateError::InvalidTransition(_))));

        // Re-asserting the current status is harmless.
        store
            .update_deployment_status("c1", "d-1", DeploymentStatus::Running)
            .unwrap();
    }

    #[test]
    fn deployment_status_update_requires_existing_row() {
        let store = StateStore::open_in_memory().unwrap();
        let result = store.update_deployment_status("c1", "ghost", DeploymentStatus::Failed);
        assert!(matches!(result, Err(StateError::NotFound(_))));
    }

    // ── Locks ──────────────────────────────────────────────────────

    #[test]
    fn lock_acquire_and_release() {
        let store = StateStore::open_in_memory().unwrap();

        store.acquire_lock("c1", 3).unwrap();
        let lock = store.get_lock("c1").unwrap().unwrap();
        assert_eq!(lock.version, 3);

        assert!(store.release_lock("c1").unwrap());
        assert!(store.get_lock("c1").unwrap().is_none());
    }

    #[test]
    fn second_acquisition_conflicts() {
        let store = StateStore::open_in_memory().unwrap();
        store.acquire_lock("c1", 3).unwrap();

        let result = store.acquire_lock("c1", 4);
        assert!(matches!(result, Err(StateError::LockConflict(ws)) if ws == "c1"));

        // A different workspace is unaffected.
        store.acquire_lock("c2", 1).unwrap();
    }

    #[test]
    fn conflicting_acquisition_leaves_original_lock() {
        let store = StateStore::open_in_memory().unwrap();
        store.acquire_lock("c1", 3).unwrap();
        let _ = store.acquire_lock("c1", 4);

        let lock = store.get_lock("c1").unwrap().unwrap();
        assert_eq!(lock.version, 3);
    }

    #[test]
    fn lock_reacquirable_after_release() {
        let store = StateStore::open_in_memory().unwrap();
        store.acquire_lock("c1", 3).unwrap();
        store.release_lock("c1").unwrap();
        store.acquire_lock("c1", 4).unwrap();
    }

    #[test]
    fn releasing_absent_lock_is_noop() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(!store.release_lock("c1").unwrap());
    }

    // ── Instances ──────────────────────────────────────────────────

    #[test]
    fn instance_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let instance = test_instance("i-jupyter-alice", "alice");

        store.put_instance(&instance).unwrap();
        let retrieved = store.get_instance("i-jupyter-alice").unwrap();

        assert_eq!(retrieved, Some(instance));
    }

    #[test]
    fn instance_list_for_user() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&test_instance("i-jupyter-alice", "alice")).unwrap();
        store.put_instance(&test_instance("i-vscode-alice", "alice")).unwrap();
        store.put_instance(&test_instance("i-jupyter-bob", "bob")).unwrap();

        let alice = store.list_instances_for_user("alice").unwrap();
        assert_eq!(alice.len(), 2);

        let bob = store.list_instances_for_user("bob").unwrap();
        assert_eq!(bob.len(), 1);
    }

    #[test]
    fn instance_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&test_instance("i-jupyter-alice", "alice")).unwrap();

        assert!(store.delete_instance("i-jupyter-alice").unwrap());
        assert!(!store.delete_instance("i-jupyter-alice").unwrap());
        assert!(store.get_instance("i-jupyter-alice").unwrap().is_none());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.create_deployment(&test_deployment("c1", "d-1", 1000)).unwrap();
            store.acquire_lock("c1", 3).unwrap();
        }

        // Reopen the same database file: history and lock survive.
        let store = StateStore::open(&db_path).unwrap();
        assert!(store.get_deployment("c1", "d-1").unwrap().is_some());
        let result = store.acquire_lock("c1", 4);
        assert!(matches!(result, Err(StateError::LockConflict(_))));
    }

    // ── Edge cases ─────────────────────────────────────────────────

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_deployments("any").unwrap().is_empty());
        assert!(store.latest_deployment("any").unwrap().is_none());
        assert!(store.list_instances_for_user("any").unwrap().is_empty());
        assert!(!store.delete_instance("nope").unwrap());
        assert!(!store.release_lock("nope").unwrap());
    }
}
