//! modelgrid.toml configuration parser.
//!
//! Backend selection, per-backend endpoints and credentials, identity and
//! routing conventions, image templates, and deploy tuning all live here so
//! nothing backend-specific is hard-coded into orchestration logic.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::ServiceKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelgridConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub images: ImageConfig,
    #[serde(default)]
    pub deploy: DeployTuning,
    /// Registered models seeding the in-memory registry.
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_port() -> u16 {
    8600
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/modelgrid")
}

/// Which compute backend this process drives, selected once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Docker(DockerBackendConfig),
    Kubernetes(KubeBackendConfig),
    Batch(BatchBackendConfig),
    Tasks(TasksBackendConfig),
    /// In-memory backend for tests and dry runs.
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerBackendConfig {
    /// Engine API endpoint, e.g. `http://127.0.0.1:2375` (DOCKER_HOST tcp).
    #[serde(default = "default_docker_endpoint")]
    pub endpoint: String,
    /// Optional user-defined network to attach containers to.
    pub network: Option<String>,
}

fn default_docker_endpoint() -> String {
    "http://127.0.0.1:2375".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeBackendConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Host for ingress rules; None produces host-less path rules.
    pub ingress_host: Option<String>,
}

fn default_namespace() -> String {
    "modelgrid".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchBackendConfig {
    pub region: String,
    pub job_queue: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Override endpoint (local emulators); None derives the regional one.
    pub endpoint: Option<String>,
    #[serde(default = "default_batch_log_group")]
    pub log_group: String,
}

fn default_batch_log_group() -> String {
    "/aws/batch/job".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksBackendConfig {
    pub region: String,
    pub cluster: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Override endpoint (local emulators); None derives the regional one.
    pub endpoint: Option<String>,
    #[serde(default = "default_tasks_log_group")]
    pub log_group: String,
    #[serde(default = "default_launch_type")]
    pub launch_type: String,
}

fn default_tasks_log_group() -> String {
    "/modelgrid/tasks".to_string()
}

fn default_launch_type() -> String {
    "EC2".to_string()
}

// ── Identity & routing conventions ────────────────────────────────

/// Name and path conventions shared by all backends.
///
/// Deployments are exposed under `/{service_prefix}/{workspace_id}` and
/// instances under `/{instance_prefix}/{name}`; resource names reuse the
/// same prefixes so identity is computable without backend round-trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_service_prefix")]
    pub service_prefix: String,
    #[serde(default = "default_instance_prefix")]
    pub instance_prefix: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            service_prefix: default_service_prefix(),
            instance_prefix: default_instance_prefix(),
        }
    }
}

fn default_service_prefix() -> String {
    "s".to_string()
}

fn default_instance_prefix() -> String {
    "i".to_string()
}

impl RoutingConfig {
    /// Stable resource name for a workspace's serving deployment.
    pub fn deployment_name(&self, workspace_id: &str) -> String {
        format!("{}-{workspace_id}", self.service_prefix)
    }

    /// Stable resource name for a user's development instance.
    pub fn instance_name(&self, kind: ServiceKind, username: &str) -> String {
        format!("{}-{}-{username}", self.instance_prefix, kind.slug())
    }

    /// Ingress/routing path for a workspace's serving deployment.
    pub fn service_route(&self, workspace_id: &str) -> String {
        format!("/{}/{workspace_id}", self.service_prefix)
    }

    /// Ingress/routing path for a development instance.
    pub fn instance_route(&self, name: &str) -> String {
        format!("/{}/{name}", self.instance_prefix)
    }
}

// ── Image templates ───────────────────────────────────────────────

/// Container image templates per workload kind.
///
/// Templates may reference `{runtime}`; model servers receive the workspace
/// and version through environment variables, not the image tag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub overrides: HashMap<String, String>,
}

impl ImageConfig {
    /// Resolve the image for a kind, expanding the `{runtime}` placeholder.
    pub fn resolve(&self, kind: ServiceKind, runtime: &str) -> String {
        let template = self
            .overrides
            .get(kind.slug())
            .map(String::as_str)
            .unwrap_or(default_image_template(kind));
        template.replace("{runtime}", runtime)
    }
}

fn default_image_template(kind: ServiceKind) -> &'static str {
    match kind {
        ServiceKind::SklearnServer => "modelgrid/sklearn-server:{runtime}",
        ServiceKind::TensorflowServer => "tensorflow/serving:{runtime}",
        ServiceKind::TorchServer => "pytorch/torchserve:{runtime}",
        ServiceKind::Jupyter => "jupyter/base-notebook:{runtime}",
        ServiceKind::JupyterLab => "jupyter/datascience-notebook:{runtime}",
        ServiceKind::VsCode => "codercom/code-server:{runtime}",
    }
}

// ── Deploy tuning ─────────────────────────────────────────────────

/// Bounds for the readiness convergence poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployTuning {
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for DeployTuning {
    fn default() -> Self {
        Self {
            ready_timeout_secs: default_ready_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_ready_timeout_secs() -> u64 {
    900
}

fn default_poll_interval_secs() -> u64 {
    5
}

impl DeployTuning {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// A registered model entry seeding the in-memory registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub workspace_id: String,
    pub version: u32,
    pub framework: String,
    pub runtime: String,
}

impl ModelgridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ModelgridConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// A minimal local-runtime config, used by tests and `--example-config`.
    pub fn example() -> Self {
        ModelgridConfig {
            server: ServerConfig::default(),
            backend: BackendConfig::Docker(DockerBackendConfig {
                endpoint: default_docker_endpoint(),
                network: None,
            }),
            routing: RoutingConfig::default(),
            images: ImageConfig::default(),
            deploy: DeployTuning::default(),
            models: vec![ModelEntry {
                workspace_id: "example".to_string(),
                version: 1,
                framework: "sklearn".to_string(),
                runtime: "py311".to_string(),
            }],
        }
    }
}
