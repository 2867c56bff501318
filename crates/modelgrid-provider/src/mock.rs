//! In-memory backend for tests and dry runs.
//!
//! Keeps a name → service map behind a mutex and records every call so
//! orchestration tests can assert on sequencing and failure handling
//! without a real backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use modelgrid_core::{
    BackendSpec, DeploymentParams, ExecOutput, InstanceParams, RoutingConfig, ServiceDescriptor,
    ServiceKind, ServiceState,
};

use crate::error::{ProviderError, ProviderResult};

#[derive(Debug, Clone, Copy)]
struct MockService {
    kind: ServiceKind,
    state: ServiceState,
}

struct MockState {
    services: HashMap<String, MockService>,
    calls: Vec<String>,
    fail_start: bool,
    /// State a started service lands in (Running by default so convergence
    /// polls finish on their first tick).
    start_state: ServiceState,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            services: HashMap::new(),
            calls: Vec::new(),
            fail_start: false,
            start_state: ServiceState::Running,
        }
    }
}

/// Mock resource provider.
#[derive(Clone)]
pub struct MockBackend {
    inner: Arc<Mutex<MockState>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Make subsequent `start` calls fail with a backend error.
    pub fn fail_start(&self, fail: bool) {
        self.lock().fail_start = fail;
    }

    /// Override the state a started service reports.
    pub fn set_start_state(&self, state: ServiceState) {
        self.lock().start_state = state;
    }

    /// Seed a live service (for reconciliation tests).
    pub fn insert_service(&self, name: &str, kind: ServiceKind, state: ServiceState) {
        self.lock()
            .services
            .insert(name.to_string(), MockService { kind, state });
    }

    /// Every operation performed, in order, as `"op name"` strings.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.inner.lock().expect("mock state lock poisoned")
    }

    fn record(&self, op: &str, name: &str) {
        self.lock().calls.push(format!("{op} {name}"));
    }

    // ── Capability set ─────────────────────────────────────────────

    pub async fn provision(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        self.record("provision", &descriptor.name);
        Ok(descriptor)
    }

    pub async fn start(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        self.record("start", &descriptor.name);
        let mut state = self.lock();
        if state.fail_start {
            return Err(ProviderError::Backend("mock start failure".to_string()));
        }
        let start_state = state.start_state;
        state.services.insert(
            descriptor.name.clone(),
            MockService {
                kind: descriptor.kind,
                state: start_state,
            },
        );
        drop(state);
        Ok(descriptor.with_state(ServiceState::Pending))
    }

    pub async fn stop(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        self.record("stop", &descriptor.name);
        // Stopping an absent service is a no-op.
        if let Some(service) = self.lock().services.get_mut(&descriptor.name) {
            service.state = ServiceState::Stopped;
        }
        Ok(descriptor.with_state(ServiceState::Stopping))
    }

    pub async fn delete(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        self.record("delete", &descriptor.name);
        self.lock().services.remove(&descriptor.name);
        Ok(descriptor.with_state(ServiceState::Stopped))
    }

    pub async fn update(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        self.record("update", &descriptor.name);
        self.start(descriptor).await
    }

    pub async fn get_state(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        let state = self
            .lock()
            .services
            .get(&descriptor.name)
            .map(|s| s.state)
            .unwrap_or(ServiceState::Unknown);
        Ok(descriptor.with_state(state))
    }

    pub async fn get_logs(&self, descriptor: &ServiceDescriptor) -> ProviderResult<String> {
        self.record("logs", &descriptor.name);
        Ok(format!("mock logs for {}\n", descriptor.name))
    }

    pub async fn exec(&self, name: &str, command: &[String]) -> ProviderResult<ExecOutput> {
        self.record("exec", name);
        Ok(ExecOutput {
            exit_code: Some(0),
            stdout: command.join(" "),
            stderr: String::new(),
        })
    }

    pub async fn list_services(&self) -> ProviderResult<Vec<ServiceDescriptor>> {
        let services = self.lock().services.clone();
        Ok(services
            .into_iter()
            .map(|(name, service)| ServiceDescriptor {
                kind: service.kind,
                name,
                state: service.state,
                vars: HashMap::new(),
                backend: BackendSpec::Mock,
            })
            .collect())
    }
}

// ── Config builder ────────────────────────────────────────────────

/// Pure builder producing mock descriptors with the shared naming scheme.
#[derive(Debug, Clone, Default)]
pub struct MockConfigBuilder {
    pub routing: RoutingConfig,
}

impl MockConfigBuilder {
    pub fn deployment_config(&self, params: &DeploymentParams) -> ServiceDescriptor {
        ServiceDescriptor {
            kind: params.kind,
            name: self.routing.deployment_name(&params.workspace_id),
            state: ServiceState::Pending,
            vars: HashMap::new(),
            backend: BackendSpec::Mock,
        }
    }

    pub fn development_config(&self, params: &InstanceParams) -> ServiceDescriptor {
        ServiceDescriptor {
            kind: params.kind,
            name: params.name.clone(),
            state: ServiceState::Pending,
            vars: HashMap::new(),
            backend: BackendSpec::Mock,
        }
    }
}
