//! Instance lifecycle controller — create/stop/delete for development
//! workloads.
//!
//! The flows mirror deployment orchestration (persist Pending → provision
//! → start → converge → persist Running) but carry no workspace lock: the
//! instance name is derived from kind + owner, so the name itself is the
//! exclusion boundary. Any failed flow hands the user over to the
//! reconciler.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use modelgrid_core::{
    DeployTuning, ExecOutput, InstanceParams, RoutingConfig, ServiceDescriptor, ServiceKind,
    ServiceState,
};
use modelgrid_provider::{Provider, ProviderResult, poll_until};
use modelgrid_state::{ServiceInstance, StateStore};

use crate::error::{InstanceError, InstanceResult};
use crate::reconciler::Reconciler;

/// Parameters for creating a development instance.
#[derive(Debug, Clone)]
pub struct CreateInstanceRequest {
    pub username: String,
    pub kind: ServiceKind,
    pub runtime: Option<String>,
    pub cpus: Option<f64>,
    pub memory_gb: Option<f64>,
    pub packages: Vec<String>,
}

/// Drives development instances against the active provider.
#[derive(Clone)]
pub struct InstanceController {
    provider: Arc<Provider>,
    store: StateStore,
    routing: RoutingConfig,
    tuning: DeployTuning,
    reconciler: Reconciler,
}

impl InstanceController {
    pub fn new(
        provider: Arc<Provider>,
        store: StateStore,
        routing: RoutingConfig,
        tuning: DeployTuning,
    ) -> Self {
        let reconciler = Reconciler::new(provider.clone(), store.clone());
        Self {
            provider,
            store,
            routing,
            tuning,
            reconciler,
        }
    }

    /// Create an instance: record it Pending and return immediately; the
    /// provision/start/converge tail runs in the background.
    pub async fn create(&self, request: CreateInstanceRequest) -> InstanceResult<ServiceInstance> {
        let (instance, descriptor) = self.begin_create(&request)?;

        let this = self.clone();
        let record = instance.clone();
        tokio::spawn(async move {
            let _ = this.finish_create(record, descriptor).await;
        });

        Ok(instance)
    }

    /// Like [`create`](Self::create) but waits for the tail. Used by tests
    /// and the CLI.
    pub async fn create_and_wait(
        &self,
        request: CreateInstanceRequest,
    ) -> InstanceResult<ServiceInstance> {
        let (instance, descriptor) = self.begin_create(&request)?;
        self.finish_create(instance.clone(), descriptor).await?;
        Ok(self
            .store
            .get_instance(&instance.name)?
            .unwrap_or(instance))
    }

    fn begin_create(
        &self,
        request: &CreateInstanceRequest,
    ) -> InstanceResult<(ServiceInstance, ServiceDescriptor)> {
        let name = self.routing.instance_name(request.kind, &request.username);
        let descriptor = self.provider.build_development_config(&InstanceParams {
            name: name.clone(),
            kind: request.kind,
            runtime: request.runtime.clone(),
            cpus: request.cpus,
            memory_gb: request.memory_gb,
            packages: request.packages.clone(),
        });

        let now = epoch_secs();
        let instance = ServiceInstance {
            name: name.clone(),
            kind: request.kind,
            state: ServiceState::Pending,
            runtime: request.runtime.clone(),
            cpus: request.cpus,
            memory_gb: request.memory_gb,
            packages: request.packages.clone(),
            username: request.username.clone(),
            created_at: now,
            updated_at: now,
        };
        self.store.put_instance(&instance)?;
        info!(%name, username = %request.username, kind = %request.kind, "instance accepted");
        Ok((instance, descriptor))
    }

    /// Provision/start/converge tail; failures trigger reconciliation.
    pub async fn finish_create(
        &self,
        instance: ServiceInstance,
        descriptor: ServiceDescriptor,
    ) -> InstanceResult<()> {
        match self.start_and_converge(descriptor).await {
            Ok(()) => {
                self.persist_state(instance, ServiceState::Running)?;
                Ok(())
            }
            Err(e) => {
                warn!(name = %instance.name, error = %e, "instance start failed");
                self.reconciler.spawn_for_user(&instance.username);
                Err(e.into())
            }
        }
    }

    /// Stop an instance: persist Stopping, stop on the backend, converge
    /// to a settled state, persist it.
    pub async fn stop(&self, name: &str) -> InstanceResult<ServiceInstance> {
        let instance = self
            .store
            .get_instance(name)?
            .ok_or_else(|| InstanceError::NotFound(name.to_string()))?;
        let descriptor = self.descriptor_for(&instance);

        self.persist_state(instance.clone(), ServiceState::Stopping)?;

        let result: ProviderResult<ServiceState> = async {
            self.provider.stop(descriptor.clone()).await?;
            self.converge_to_settled(&descriptor).await
        }
        .await;

        match result {
            Ok(observed) => {
                let settled = persistable(observed);
                let updated = self.persist_state(instance, settled)?;
                info!(%name, state = %settled, "instance stopped");
                Ok(updated)
            }
            Err(e) => {
                warn!(%name, error = %e, "instance stop failed");
                self.reconciler.spawn_for_user(&instance.username);
                Err(e.into())
            }
        }
    }

    /// Delete an instance: stop, delete the backend resource, and only
    /// then remove the persisted row.
    pub async fn delete(&self, name: &str) -> InstanceResult<()> {
        let instance = self
            .store
            .get_instance(name)?
            .ok_or_else(|| InstanceError::NotFound(name.to_string()))?;
        let descriptor = self.descriptor_for(&instance);

        self.persist_state(instance.clone(), ServiceState::Stopping)?;

        let result: ProviderResult<()> = async {
            self.provider.stop(descriptor.clone()).await?;
            self.provider.delete(descriptor.clone()).await?;
            self.converge_to_settled(&descriptor).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.store.delete_instance(name)?;
                info!(%name, "instance deleted");
                Ok(())
            }
            Err(e) => {
                warn!(%name, error = %e, "instance delete failed");
                self.reconciler.spawn_for_user(&instance.username);
                Err(e.into())
            }
        }
    }

    /// Persisted listing; no live backend call on the read path.
    pub fn list(&self, username: &str) -> InstanceResult<Vec<ServiceInstance>> {
        Ok(self.store.list_instances_for_user(username)?)
    }

    pub fn get(&self, name: &str) -> InstanceResult<ServiceInstance> {
        self.store
            .get_instance(name)?
            .ok_or_else(|| InstanceError::NotFound(name.to_string()))
    }

    /// Live state straight from the backend.
    pub async fn live_state(&self, name: &str) -> InstanceResult<ServiceState> {
        let instance = self.get(name)?;
        let observed = self.provider.get_state(self.descriptor_for(&instance)).await?;
        Ok(observed.state)
    }

    pub async fn logs(&self, name: &str) -> InstanceResult<String> {
        let instance = self.get(name)?;
        Ok(self.provider.get_logs(&self.descriptor_for(&instance)).await?)
    }

    pub async fn exec(&self, name: &str, command: &[String]) -> InstanceResult<ExecOutput> {
        // Existence check keeps exec from reaching arbitrary backend names.
        let _ = self.get(name)?;
        Ok(self.provider.exec(name, command).await?)
    }

    /// Expose the reconciler for callers that repair on their own schedule.
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    // ── Internals ──────────────────────────────────────────────────

    /// Rebuild the backend descriptor from a persisted row. Names are
    /// deterministic and builders are pure, so this needs no backend call.
    fn descriptor_for(&self, instance: &ServiceInstance) -> ServiceDescriptor {
        self.provider.build_development_config(&InstanceParams {
            name: instance.name.clone(),
            kind: instance.kind,
            runtime: instance.runtime.clone(),
            cpus: instance.cpus,
            memory_gb: instance.memory_gb,
            packages: instance.packages.clone(),
        })
    }

    async fn start_and_converge(&self, descriptor: ServiceDescriptor) -> ProviderResult<()> {
        let descriptor = self.provider.provision(descriptor).await?;
        let descriptor = self.provider.start(descriptor).await?;

        let provider = self.provider.clone();
        let target = Arc::new(descriptor);
        poll_until(
            move || {
                let provider = provider.clone();
                let target = target.clone();
                async move {
                    let observed = provider.get_state((*target).clone()).await?;
                    Ok(observed.state == ServiceState::Running)
                }
            },
            self.tuning.ready_timeout(),
            self.tuning.poll_interval(),
        )
        .await
    }

    /// Wait until the backend reports a settled (non-transitional) state
    /// and return it.
    async fn converge_to_settled(
        &self,
        descriptor: &ServiceDescriptor,
    ) -> ProviderResult<ServiceState> {
        let provider = self.provider.clone();
        let target = Arc::new(descriptor.clone());
        let observed = Arc::new(std::sync::Mutex::new(ServiceState::Unknown));

        let observed_in_poll = observed.clone();
        poll_until(
            move || {
                let provider = provider.clone();
                let target = target.clone();
                let observed = observed_in_poll.clone();
                async move {
                    let current = provider.get_state((*target).clone()).await?.state;
                    *observed.lock().expect("state slot lock poisoned") = current;
                    Ok(!matches!(
                        current,
                        ServiceState::Running | ServiceState::Pending | ServiceState::Stopping
                    ))
                }
            },
            self.tuning.ready_timeout(),
            self.tuning.poll_interval(),
        )
        .await?;

        let state = *observed.lock().expect("state slot lock poisoned");
        Ok(state)
    }

    fn persist_state(
        &self,
        mut instance: ServiceInstance,
        state: ServiceState,
    ) -> InstanceResult<ServiceInstance> {
        instance.state = state;
        instance.updated_at = epoch_secs();
        self.store.put_instance(&instance)?;
        Ok(instance)
    }
}

/// `Unknown` never lands in the store as a terminal fact; a backend with
/// no record of the resource persists as Inactive.
fn persistable(state: ServiceState) -> ServiceState {
    match state {
        ServiceState::Unknown => ServiceState::Inactive,
        other => other,
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
    use std::time::Duration;

    use modelgrid_provider::mock::MockBackend;

    fn controller() -> (InstanceController, MockBackend, StateStore) {
        let (provider, handle) = Provider::mock();
        let store = StateStore::open_in_memory().unwrap();
        let controller = InstanceController::new(
            Arc::new(provider),
            store.clone(),
            RoutingConfig::default(),
            DeployTuning {
                ready_timeout_secs: 0,
                poll_interval_secs: 0,
            },
        );
        (controller, handle, store)
    }

    fn jupyter_request(username: &str) -> CreateInstanceRequest {
        CreateInstanceRequest {
            username: username.to_string(),
            kind: ServiceKind::Jupyter,
            runtime: Some("py311".to_string()),
            cpus: Some(1.0),
            memory_gb: Some(2.0),
            packages: vec!["numpy".to_string()],
        }
    }

    #[tokio::test]
    async fn create_converges_to_running() {
        let (controller, handle, store) = controller();

        let instance = controller.create_and_wait(jupyter_request("alice")).await.unwrap();

        assert_eq!(instance.name, "i-jupyter-alice");
        assert_eq!(instance.state, ServiceState::Running);
        assert_eq!(
            store.get_instance("i-jupyter-alice").unwrap().unwrap().state,
            ServiceState::Running
        );
        assert_eq!(
            handle.calls(),
            vec!["provision i-jupyter-alice", "start i-jupyter-alice"]
        );
    }

    #[tokio::test]
    async fn create_returns_pending_immediately() {
        let (controller, _handle, store) = controller();

        let instance = controller.create(jupyter_request("alice")).await.unwrap();
        assert_eq!(instance.state, ServiceState::Pending);

        // The background tail eventually persists Running.
        let mut state = instance.state;
        for _ in 0..100 {
            state = store.get_instance("i-jupyter-alice").unwrap().unwrap().state;
            if state == ServiceState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, ServiceState::Running);
    }

    #[tokio::test]
    async fn failed_create_triggers_reconciliation() {
        let (controller, handle, store) = controller();
        handle.fail_start(true);

        let result = controller.create_and_wait(jupyter_request("alice")).await;
        assert!(result.is_err());

        // The fire-and-forget reconciler marks the orphaned row Inactive.
        let mut state = ServiceState::Pending;
        for _ in 0..100 {
            state = store.get_instance("i-jupyter-alice").unwrap().unwrap().state;
            if state == ServiceState::Inactive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, ServiceState::Inactive);
    }

    #[tokio::test]
    async fn stop_persists_settled_state() {
        let (controller, _handle, store) = controller();
        controller.create_and_wait(jupyter_request("alice")).await.unwrap();

        let stopped = controller.stop("i-jupyter-alice").await.unwrap();

        assert_eq!(stopped.state, ServiceState::Stopped);
        assert_eq!(
            store.get_instance("i-jupyter-alice").unwrap().unwrap().state,
            ServiceState::Stopped
        );
    }

    #[tokio::test]
    async fn stop_of_absent_backend_resource_settles_inactive() {
        let (controller, _handle, store) = controller();
        // Row exists but the backend never heard of it.
        let now = 1000;
        store
            .put_instance(&ServiceInstance {
                name: "i-jupyter-alice".to_string(),
                kind: ServiceKind::Jupyter,
                state: ServiceState::Running,
                runtime: None,
                cpus: None,
                memory_gb: None,
                packages: vec![],
                username: "alice".to_string(),
                created_at: now,
                updated_at: now,
            })
            .unwrap();

        let stopped = controller.stop("i-jupyter-alice").await.unwrap();
        assert_eq!(stopped.state, ServiceState::Inactive);
    }

    #[tokio::test]
    async fn delete_removes_row_only_after_backend_teardown() {
        let (controller, handle, store) = controller();
        controller.create_and_wait(jupyter_request("alice")).await.unwrap();

        controller.delete("i-jupyter-alice").await.unwrap();

        assert!(store.get_instance("i-jupyter-alice").unwrap().is_none());
        let calls = handle.calls();
        assert!(calls.contains(&"stop i-jupyter-alice".to_string()));
        assert!(calls.contains(&"delete i-jupyter-alice".to_string()));
    }

    #[tokio::test]
    async fn stop_unknown_instance_is_not_found() {
        let (controller, _handle, _store) = controller();
        let result = controller.stop("i-jupyter-ghost").await;
        assert!(matches!(result, Err(InstanceError::NotFound(_))));
    }

    #[tokio::test]
    async fn listing_reads_only_the_store() {
        let (controller, handle, _store) = controller();
        controller.create_and_wait(jupyter_request("alice")).await.unwrap();
        let calls_before = handle.calls().len();

        let listed = controller.list("alice").unwrap();
        assert_eq!(listed.len(), 1);
        // No backend traffic for a listing.
        assert_eq!(handle.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn exec_round_trips_through_provider() {
        let (controller, _handle, _store) = controller();
        controller.create_and_wait(jupyter_request("alice")).await.unwrap();

        let output = controller
            .exec("i-jupyter-alice", &["pip".to_string(), "list".to_string()])
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.stdout, "pip list");
    }
}
