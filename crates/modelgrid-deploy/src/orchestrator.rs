//! Deployment orchestrator — drives "serve version V of workspace W".
//!
//! The caller-facing `deploy` performs resolution, config building, lock
//! acquisition, and the Pending record synchronously, then returns; the
//! provision/start/converge tail runs in a spawned task and reports its
//! outcome only through the deployment record. The workspace lock is
//! released on every exit path of that tail, exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{error, info, warn};

use modelgrid_core::{DeployTuning, DeploymentParams, ModelRegistry, ServiceDescriptor, ServiceKind, ServiceState};
use modelgrid_provider::{Provider, ProviderResult, poll_until};
use modelgrid_state::{Deployment, DeploymentStatus, StateError, StateStore};

use crate::error::{DeployError, DeployResult};

/// Monotonic discriminator for deployment ids minted in this process.
static DEPLOY_SEQ: AtomicU64 = AtomicU64::new(0);

/// Orchestrates model-serving deployments against the active provider.
#[derive(Clone)]
pub struct DeployOrchestrator {
    registry: Arc<dyn ModelRegistry>,
    provider: Arc<Provider>,
    store: StateStore,
    tuning: DeployTuning,
}

impl DeployOrchestrator {
    pub fn new(
        registry: Arc<dyn ModelRegistry>,
        provider: Arc<Provider>,
        store: StateStore,
        tuning: DeployTuning,
    ) -> Self {
        Self {
            registry,
            provider,
            store,
            tuning,
        }
    }

    /// Deploy a workspace's registered model.
    ///
    /// Returns the Pending deployment record as soon as the lock is held
    /// and the row is written; the backend work continues in the
    /// background and is observed by polling the record.
    pub async fn deploy(
        &self,
        workspace_id: &str,
        version: Option<u32>,
        created_by: &str,
    ) -> DeployResult<Deployment> {
        let (deployment, descriptor) = self.begin(workspace_id, version, created_by)?;

        let this = self.clone();
        let record = deployment.clone();
        tokio::spawn(async move {
            this.run_provisioning(record, descriptor).await;
        });

        Ok(deployment)
    }

    /// Like [`deploy`](Self::deploy) but waits for the provisioning tail,
    /// returning the final record. Used by tests and the CLI.
    pub async fn deploy_and_wait(
        &self,
        workspace_id: &str,
        version: Option<u32>,
        created_by: &str,
    ) -> DeployResult<Deployment> {
        let (deployment, descriptor) = self.begin(workspace_id, version, created_by)?;
        self.run_provisioning(deployment.clone(), descriptor).await;
        Ok(self
            .store
            .get_deployment(&deployment.workspace_id, &deployment.deployment_id)?
            .unwrap_or(deployment))
    }

    /// Steps 1-4: resolve, build, lock, record.
    fn begin(
        &self,
        workspace_id: &str,
        version: Option<u32>,
        created_by: &str,
    ) -> DeployResult<(Deployment, ServiceDescriptor)> {
        let model = self
            .registry
            .resolve(workspace_id, version)
            .ok_or_else(|| DeployError::ModelNotFound(workspace_id.to_string()))?;
        let kind = ServiceKind::from_framework(&model.framework)
            .ok_or_else(|| DeployError::UnsupportedFramework(model.framework.clone()))?;

        let descriptor = self.provider.build_deployment_config(&DeploymentParams {
            kind,
            workspace_id: workspace_id.to_string(),
            version: Some(model.version),
            runtime: Some(model.runtime.clone()),
            framework: Some(model.framework.clone()),
            cpus: None,
            memory_gb: None,
        });

        // Atomic conditional insert: a concurrent attempt for the same
        // workspace fails here and never writes a deployment row.
        match self.store.acquire_lock(workspace_id, model.version) {
            Ok(()) => {}
            Err(StateError::LockConflict(ws)) => return Err(DeployError::InProgress(ws)),
            Err(e) => return Err(e.into()),
        }

        let deployment = Deployment {
            workspace_id: workspace_id.to_string(),
            deployment_id: next_deployment_id(),
            version: model.version,
            status: DeploymentStatus::Pending,
            created_by: created_by.to_string(),
            created_at: epoch_secs(),
        };
        if let Err(e) = self.store.create_deployment(&deployment) {
            // The attempt never got off the ground; don't leak the lock.
            let _ = self.store.release_lock(workspace_id);
            return Err(e.into());
        }

        info!(
            workspace_id,
            deployment_id = %deployment.deployment_id,
            version = model.version,
            backend = self.provider.name(),
            "deployment accepted"
        );
        Ok((deployment, descriptor))
    }

    /// Steps 5-8: provision, start, converge, persist the outcome, and
    /// always release the workspace lock.
    pub async fn run_provisioning(&self, deployment: Deployment, descriptor: ServiceDescriptor) {
        let status = match self.provision_and_converge(descriptor).await {
            Ok(()) => DeploymentStatus::Running,
            Err(e) => {
                warn!(
                    workspace_id = %deployment.workspace_id,
                    deployment_id = %deployment.deployment_id,
                    error = %e,
                    "deployment failed"
                );
                DeploymentStatus::Failed
            }
        };

        if let Err(e) = self.store.update_deployment_status(
            &deployment.workspace_id,
            &deployment.deployment_id,
            status,
        ) {
            error!(
                workspace_id = %deployment.workspace_id,
                deployment_id = %deployment.deployment_id,
                error = %e,
                "failed to persist deployment status"
            );
        }

        match self.store.release_lock(&deployment.workspace_id) {
            Ok(_) => info!(
                workspace_id = %deployment.workspace_id,
                deployment_id = %deployment.deployment_id,
                ?status,
                "deployment finished, lock released"
            ),
            Err(e) => error!(
                workspace_id = %deployment.workspace_id,
                error = %e,
                "failed to release deployment lock"
            ),
        }
    }

    /// No compensating teardown happens on failure: partial backend
    /// resources stay put, and the next deployment replaces them in place.
    async fn provision_and_converge(&self, descriptor: ServiceDescriptor) -> ProviderResult<()> {
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
}

fn next_deployment_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let seq = DEPLOY_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("d-{millis:x}-{seq}")
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
