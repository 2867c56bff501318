//! The resource provider: one variant per backend, selected once at
//! startup from configuration and injected into the orchestrators.
//!
//! Dispatch lives here so orchestration logic never branches on the active
//! backend. Each variant owns its explicitly-constructed client handle and
//! its paired config builder.

use modelgrid_core::{
    BackendConfig, DeploymentParams, ExecOutput, InstanceParams, ModelgridConfig, ServiceDescriptor,
};

use crate::batch::{BatchBackend, BatchConfigBuilder};
use crate::docker::{DockerBackend, DockerConfigBuilder};
use crate::error::{ProviderError, ProviderResult};
use crate::kubernetes::{KubeBackend, KubeConfigBuilder};
use crate::mock::{MockBackend, MockConfigBuilder};
use crate::tasks::{TaskBackend, TaskConfigBuilder};

/// A compute backend plus its config builder.
pub enum Provider {
    Docker {
        backend: DockerBackend,
        builder: DockerConfigBuilder,
    },
    Kubernetes {
        backend: KubeBackend,
        builder: KubeConfigBuilder,
    },
    Batch {
        backend: BatchBackend,
        builder: BatchConfigBuilder,
    },
    Tasks {
        backend: TaskBackend,
        builder: TaskConfigBuilder,
    },
    Mock {
        backend: MockBackend,
        builder: MockConfigBuilder,
    },
}

impl Provider {
    /// Construct the configured backend with explicitly-owned clients.
    pub async fn from_config(config: &ModelgridConfig) -> ProviderResult<Self> {
        let routing = config.routing.clone();
        let images = config.images.clone();
        match &config.backend {
            BackendConfig::Docker(docker) => Ok(Self::Docker {
                backend: DockerBackend::new(docker)?,
                builder: DockerConfigBuilder::new(docker, routing, images),
            }),
            BackendConfig::Kubernetes(kube) => Ok(Self::Kubernetes {
                backend: KubeBackend::connect(kube).await?,
                builder: KubeConfigBuilder::new(kube, routing, images),
            }),
            BackendConfig::Batch(batch) => Ok(Self::Batch {
                backend: BatchBackend::new(batch)?,
                builder: BatchConfigBuilder::new(batch, routing, images),
            }),
            BackendConfig::Tasks(tasks) => Ok(Self::Tasks {
                backend: TaskBackend::new(tasks)?,
                builder: TaskConfigBuilder::new(tasks, routing, images),
            }),
            BackendConfig::Mock => Ok(Self::Mock {
                backend: MockBackend::new(),
                builder: MockConfigBuilder { routing },
            }),
        }
    }

    /// A mock provider plus a handle to its backend, for tests.
    pub fn mock() -> (Self, MockBackend) {
        let backend = MockBackend::new();
        let provider = Self::Mock {
            backend: backend.clone(),
            builder: MockConfigBuilder::default(),
        };
        (provider, backend)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Docker { .. } => "docker",
            Self::Kubernetes { .. } => "kubernetes",
            Self::Batch { .. } => "batch",
            Self::Tasks { .. } => "tasks",
            Self::Mock { .. } => "mock",
        }
    }

    // ── Config builders ────────────────────────────────────────────

    pub fn build_deployment_config(&self, params: &DeploymentParams) -> ServiceDescriptor {
        match self {
            Self::Docker { builder, .. } => builder.deployment_config(params),
            Self::Kubernetes { builder, .. } => builder.deployment_config(params),
            Self::Batch { builder, .. } => builder.deployment_config(params),
            Self::Tasks { builder, .. } => builder.deployment_config(params),
            Self::Mock { builder, .. } => builder.deployment_config(params),
        }
    }

    pub fn build_development_config(&self, params: &InstanceParams) -> ServiceDescriptor {
        match self {
            Self::Docker { builder, .. } => builder.development_config(params),
            Self::Kubernetes { builder, .. } => builder.development_config(params),
            Self::Batch { builder, .. } => builder.development_config(params),
            Self::Tasks { builder, .. } => builder.development_config(params),
            Self::Mock { builder, .. } => builder.development_config(params),
        }
    }

    // ── Capability set ─────────────────────────────────────────────

    /// Prepare backend prerequisites (image pull, definition registration).
    /// Must complete before `start`.
    pub async fn provision(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        match self {
            Self::Docker { backend, .. } => backend.provision(descriptor).await,
            Self::Kubernetes { backend, .. } => backend.provision(descriptor).await,
            Self::Batch { backend, .. } => backend.provision(descriptor).await,
            Self::Tasks { backend, .. } => backend.provision(descriptor).await,
            Self::Mock { backend, .. } => backend.provision(descriptor).await,
        }
    }

    pub async fn start(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        match self {
            Self::Docker { backend, .. } => backend.start(descriptor).await,
            Self::Kubernetes { backend, .. } => backend.start(descriptor).await,
            Self::Batch { backend, .. } => backend.start(descriptor).await,
            Self::Tasks { backend, .. } => backend.start(descriptor).await,
            Self::Mock { backend, .. } => backend.start(descriptor).await,
        }
    }

    /// Idempotent with respect to "resource absent".
    pub async fn stop(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        match self {
            Self::Docker { backend, .. } => backend.stop(descriptor).await,
            Self::Kubernetes { backend, .. } => backend.stop(descriptor).await,
            Self::Batch { backend, .. } => backend.stop(descriptor).await,
            Self::Tasks { backend, .. } => backend.stop(descriptor).await,
            Self::Mock { backend, .. } => backend.stop(descriptor).await,
        }
    }

    /// Idempotent with respect to "resource absent".
    pub async fn delete(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        match self {
            Self::Docker { backend, .. } => backend.delete(descriptor).await,
            Self::Kubernetes { backend, .. } => backend.delete(descriptor).await,
            Self::Batch { backend, .. } => backend.delete(descriptor).await,
            Self::Tasks { backend, .. } => backend.delete(descriptor).await,
            Self::Mock { backend, .. } => backend.delete(descriptor).await,
        }
    }

    pub async fn update(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        match self {
            Self::Docker { backend, .. } => backend.update(descriptor).await,
            Self::Kubernetes { backend, .. } => backend.update(descriptor).await,
            Self::Batch { backend, .. } => backend.update(descriptor).await,
            Self::Tasks { backend, .. } => backend.update(descriptor).await,
            Self::Mock { backend, .. } => backend.update(descriptor).await,
        }
    }

    /// Never errors on a transient lookup failure: callers always get a
    /// state back (`Unknown` when the backend can't be consulted).
    pub async fn get_state(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        match self {
            Self::Docker { backend, .. } => backend.get_state(descriptor).await,
            Self::Kubernetes { backend, .. } => backend.get_state(descriptor).await,
            Self::Batch { backend, .. } => backend.get_state(descriptor).await,
            Self::Tasks { backend, .. } => backend.get_state(descriptor).await,
            Self::Mock { backend, .. } => backend.get_state(descriptor).await,
        }
    }

    pub async fn get_logs(&self, descriptor: &ServiceDescriptor) -> ProviderResult<String> {
        match self {
            Self::Docker { backend, .. } => backend.get_logs(descriptor).await,
            Self::Kubernetes { backend, .. } => backend.get_logs(descriptor).await,
            Self::Batch { backend, .. } => backend.get_logs(descriptor).await,
            Self::Tasks { backend, .. } => backend.get_logs(descriptor).await,
            Self::Mock { backend, .. } => backend.get_logs(descriptor).await,
        }
    }

    /// Interactive backends only.
    pub async fn exec(&self, name: &str, command: &[String]) -> ProviderResult<ExecOutput> {
        match self {
            Self::Docker { backend, .. } => backend.exec(name, command).await,
            Self::Kubernetes { backend, .. } => backend.exec(name, command).await,
            Self::Batch { .. } | Self::Tasks { .. } => Err(ProviderError::Unsupported("exec")),
            Self::Mock { backend, .. } => backend.exec(name, command).await,
        }
    }

    /// Interactive backends only: the live inventory used by the reconciler.
    pub async fn list_services(&self) -> ProviderResult<Vec<ServiceDescriptor>> {
        match self {
            Self::Docker { backend, .. } => backend.list_services().await,
            Self::Kubernetes { backend, .. } => backend.list_services().await,
            Self::Batch { .. } | Self::Tasks { .. } => {
                Err(ProviderError::Unsupported("list_services"))
            }
            Self::Mock { backend, .. } => backend.list_services().await,
        }
    }
}
