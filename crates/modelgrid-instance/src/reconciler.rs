//! State reconciler — repairs drift between persisted instance rows and
//! the backend's live inventory.
//!
//! Runs after any failed lifecycle flow (and on demand). Best-effort by
//! design: its own failures are observability signal only and never reach
//! the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use modelgrid_core::ServiceState;
use modelgrid_provider::Provider;
use modelgrid_state::StateStore;

use crate::error::InstanceResult;

/// Compares the provider's live inventory against the instance rows and
/// overwrites persisted state with observed state.
#[derive(Clone)]
pub struct Reconciler {
    provider: Arc<Provider>,
    store: StateStore,
}

impl Reconciler {
    pub fn new(provider: Arc<Provider>, store: StateStore) -> Self {
        Self { provider, store }
    }

    /// Reconcile all of a user's instances. Errors are logged, never
    /// surfaced.
    pub async fn reconcile_user(&self, username: &str) {
        match self.run(username).await {
            Ok(corrected) => {
                debug!(username, corrected, "reconciliation finished");
            }
            Err(e) => {
                warn!(username, error = %e, "reconciliation failed");
            }
        }
    }

    /// Spawn a fire-and-forget reconciliation for a user.
    pub fn spawn_for_user(&self, username: &str) {
        let reconciler = self.clone();
        let username = username.to_string();
        tokio::spawn(async move {
            reconciler.reconcile_user(&username).await;
        });
    }

    async fn run(&self, username: &str) -> InstanceResult<u32> {
        let live = self.provider.list_services().await?;
        let live_states: HashMap<String, ServiceState> = live
            .into_iter()
            .map(|descriptor| (descriptor.name, descriptor.state))
            .collect();

        let mut corrected = 0;
        for mut instance in self.store.list_instances_for_user(username)? {
            // Absent from the live inventory means the backend has no
            // record of it at all.
            let observed = live_states
                .get(&instance.name)
                .copied()
                .unwrap_or(ServiceState::Inactive);
            if instance.state != observed {
                debug!(
                    name = %instance.name,
                    persisted = %instance.state,
                    %observed,
                    "correcting drifted instance state"
                );
                instance.state = observed;
                instance.updated_at = epoch_secs();
                self.store.put_instance(&instance)?;
                corrected += 1;
            }
        }
        Ok(corrected)
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
    use modelgrid_core::ServiceKind;
    use modelgrid_provider::Provider;
    use modelgrid_state::ServiceInstance;

    fn persisted_instance(name: &str, username: &str, state: ServiceState) -> ServiceInstance {
        ServiceInstance {
            name: name.to_string(),
            kind: ServiceKind::Jupyter,
            state,
            runtime: None,
            cpus: None,
            memory_gb: None,
            packages: vec![],
            username: username.to_string(),
            created_at: 1000,
            updated_at: 1000,
        }
    }

    #[tokio::test]
    async fn live_state_overwrites_persisted_state() {
        let (provider, handle) = Provider::mock();
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_instance(&persisted_instance("i-jupyter-alice", "alice", ServiceState::Running))
            .unwrap();
        handle.insert_service("i-jupyter-alice", ServiceKind::Jupyter, ServiceState::Stopped);

        let reconciler = Reconciler::new(Arc::new(provider), store.clone());
        reconciler.reconcile_user("alice").await;

        let instance = store.get_instance("i-jupyter-alice").unwrap().unwrap();
        assert_eq!(instance.state, ServiceState::Stopped);
    }

    #[tokio::test]
    async fn absent_instances_become_inactive() {
        let (provider, _handle) = Provider::mock();
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_instance(&persisted_instance("i-jupyter-alice", "alice", ServiceState::Running))
            .unwrap();

        let reconciler = Reconciler::new(Arc::new(provider), store.clone());
        reconciler.reconcile_user("alice").await;

        let instance = store.get_instance("i-jupyter-alice").unwrap().unwrap();
        assert_eq!(instance.state, ServiceState::Inactive);
    }

    #[tokio::test]
    async fn matching_state_is_left_untouched() {
        let (provider, handle) = Provider::mock();
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_instance(&persisted_instance("i-jupyter-alice", "alice", ServiceState::Running))
            .unwrap();
        handle.insert_service("i-jupyter-alice", ServiceKind::Jupyter, ServiceState::Running);

        let reconciler = Reconciler::new(Arc::new(provider), store.clone());
        reconciler.reconcile_user("alice").await;

        let instance = store.get_instance("i-jupyter-alice").unwrap().unwrap();
        // updated_at untouched proves no write happened.
        assert_eq!(instance.updated_at, 1000);
    }

    #[tokio::test]
    async fn only_the_users_instances_are_touched() {
        let (provider, _handle) = Provider::mock();
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_instance(&persisted_instance("i-jupyter-alice", "alice", ServiceState::Running))
            .unwrap();
        store
            .put_instance(&persisted_instance("i-jupyter-bob", "bob", ServiceState::Running))
            .unwrap();

        let reconciler = Reconciler::new(Arc::new(provider), store.clone());
        reconciler.reconcile_user("alice").await;

        assert_eq!(
            store.get_instance("i-jupyter-alice").unwrap().unwrap().state,
            ServiceState::Inactive
        );
        assert_eq!(
            store.get_instance("i-jupyter-bob").unwrap().unwrap().state,
            ServiceState::Running
        );
    }

    #[tokio::test]
    async fn convergence_over_mixed_inventory() {
        let (provider, handle) = Provider::mock();
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_instance(&persisted_instance("i-jupyter-alice", "alice", ServiceState::Pending))
            .unwrap();
        store
            .put_instance(&persisted_instance("i-vscode-alice", "alice", ServiceState::Running))
            .unwrap();
        store
            .put_instance(&persisted_instance("i-jupyterlab-alice", "alice", ServiceState::Running))
            .unwrap();
        handle.insert_service("i-jupyter-alice", ServiceKind::Jupyter, ServiceState::Running);
        handle.insert_service("i-vscode-alice", ServiceKind::VsCode, ServiceState::Running);

        let reconciler = Reconciler::new(Arc::new(provider), store.clone());
        reconciler.reconcile_user("alice").await;

        // Every persisted row now equals the live inventory's view.
        assert_eq!(
            store.get_instance("i-jupyter-alice").unwrap().unwrap().state,
            ServiceState::Running
        );
        assert_eq!(
            store.get_instance("i-vscode-alice").unwrap().unwrap().state,
            ServiceState::Running
        );
        assert_eq!(
            store.get_instance("i-jupyterlab-alice").unwrap().unwrap().state,
            ServiceState::Inactive
        );
    }
}
