//! Domain types for the Modelgrid control plane.
//!
//! [`ServiceDescriptor`] is the backend-agnostic description of a workload
//! that every backend adapter consumes and returns. Backend-native fields
//! live in the [`BackendSpec`] sum type so orchestration code never branches
//! on the active backend itself.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Workload kind served or hosted by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Scikit-learn model server.
    SklearnServer,
    /// TensorFlow Serving model server.
    TensorflowServer,
    /// TorchServe model server.
    TorchServer,
    /// Classic Jupyter notebook.
    Jupyter,
    /// JupyterLab workbench.
    JupyterLab,
    /// Browser VS Code (code-server).
    VsCode,
}

impl ServiceKind {
    /// Map a registered model's framework to its serving workload kind.
    pub fn from_framework(framework: &str) -> Option<Self> {
        match framework.to_ascii_lowercase().as_str() {
            "sklearn" | "scikit-learn" => Some(Self::SklearnServer),
            "tensorflow" | "keras" => Some(Self::TensorflowServer),
            "pytorch" | "torch" => Some(Self::TorchServer),
            _ => None,
        }
    }

    /// Whether this kind serves a registered model (vs. an interactive workbench).
    pub fn is_model_server(&self) -> bool {
        matches!(
            self,
            Self::SklearnServer | Self::TensorflowServer | Self::TorchServer
        )
    }

    /// Stable slug used in resource names and image template lookups.
    pub fn slug(&self) -> &'static str {
        match self {
            Self::SklearnServer => "sklearn",
            Self::TensorflowServer => "tensorflow",
            Self::TorchServer => "torch",
            Self::Jupyter => "jupyter",
            Self::JupyterLab => "jupyterlab",
            Self::VsCode => "vscode",
        }
    }

    /// Inverse of [`ServiceKind::slug`], used when rehydrating descriptors
    /// from backend labels.
    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "sklearn" => Some(Self::SklearnServer),
            "tensorflow" => Some(Self::TensorflowServer),
            "torch" => Some(Self::TorchServer),
            "jupyter" => Some(Self::Jupyter),
            "jupyterlab" => Some(Self::JupyterLab),
            "vscode" => Some(Self::VsCode),
            _ => None,
        }
    }

    /// Container port the workload listens on.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::SklearnServer | Self::TorchServer | Self::VsCode => 8080,
            Self::TensorflowServer => 8501,
            Self::Jupyter | Self::JupyterLab => 8888,
        }
    }

    /// HTTP path probed to decide readiness.
    pub fn health_path(&self) -> &'static str {
        match self {
            Self::SklearnServer => "/health",
            Self::TensorflowServer => "/v1/models",
            Self::TorchServer => "/ping",
            Self::Jupyter | Self::JupyterLab => "/api",
            Self::VsCode => "/healthz",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Observed lifecycle state of a backend resource.
///
/// `Unknown` means the backend could not be consulted. It is never persisted
/// as a terminal fact; it triggers reconciliation instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    Inactive,
    Unknown,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Inactive => "inactive",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

// ── Descriptor ────────────────────────────────────────────────────

/// Backend-agnostic description of a single service/workload instance.
///
/// `name` is the stable identity: derived deterministically from
/// workspace/instance identity, unique within a backend, and the only key
/// used to look up live state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub kind: ServiceKind,
    pub name: String,
    pub state: ServiceState,
    /// Free-form environment overrides layered on top of the builder's env.
    #[serde(default)]
    pub vars: HashMap<String, String>,
    pub backend: BackendSpec,
}

impl ServiceDescriptor {
    /// Return a copy of this descriptor with a different observed state.
    pub fn with_state(mut self, state: ServiceState) -> Self {
        self.state = state;
        self
    }
}

/// Backend-native fields extending the descriptor, one variant per backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BackendSpec {
    Docker(DockerSpec),
    Kubernetes(KubeSpec),
    Batch(BatchSpec),
    Tasks(TaskSpec),
    /// No backend-native fields; used by the mock provider.
    Mock,
}

/// Container image + host config for the local container runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockerSpec {
    pub image: String,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortBinding>,
    pub memory_bytes: Option<u64>,
    pub nano_cpus: Option<i64>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub network: Option<String>,
    /// Health check command in Engine form, e.g. `["CMD-SHELL", "curl ..."]`.
    pub health_cmd: Option<Vec<String>>,
}

/// A container-port to host-port mapping. `host` 0 lets the runtime pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub container: u16,
    pub host: u16,
}

/// Namespace + object parameters for the cluster orchestration backend.
///
/// The adapter materializes these into a Service/Ingress/Deployment triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KubeSpec {
    pub namespace: String,
    pub image: String,
    pub replicas: i32,
    pub port: u16,
    /// Path prefix the ingress routes to this service.
    pub route_path: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub cpu_milli: u32,
    pub memory_bytes: u64,
    pub ingress_host: Option<String>,
}

/// Job queue + job definition for the managed batch compute backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSpec {
    pub job_queue: String,
    pub job_definition: String,
    pub image: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Job id assigned by the backend after submission.
    pub job_id: Option<String>,
}

/// Cluster + task definition for the managed container-task backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub cluster: String,
    pub task_definition: String,
    pub image: String,
    pub cpu_units: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    pub log_group: String,
    /// Task ARN assigned by the backend after RunTask.
    pub task_arn: Option<String>,
}

/// Captured output of an `exec` in a running instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
}

// ── Builder inputs ────────────────────────────────────────────────

/// Parameters for building a model-serving deployment descriptor.
#[derive(Debug, Clone)]
pub struct DeploymentParams {
    pub kind: ServiceKind,
    pub workspace_id: String,
    pub version: Option<u32>,
    pub runtime: Option<String>,
    pub framework: Option<String>,
    pub cpus: Option<f64>,
    pub memory_gb: Option<f64>,
}

/// Parameters for building a development-instance descriptor.
#[derive(Debug, Clone)]
pub struct InstanceParams {
    pub name: String,
    pub kind: ServiceKind,
    pub runtime: Option<String>,
    pub cpus: Option<f64>,
    pub memory_gb: Option<f64>,
    pub packages: Vec<String>,
}

// ── Unit conversions ──────────────────────────────────────────────

/// Fractional CPU count → container-runtime nano-CPUs.
pub fn cpus_to_nano(cpus: f64) -> i64 {
    (cpus * 1_000_000_000.0) as i64
}

/// Fractional CPU count → scheduling quota in milli-CPUs.
pub fn cpus_to_milli(cpus: f64) -> u32 {
    (cpus * 1000.0).round() as u32
}

/// Gigabytes → bytes.
pub fn gb_to_bytes(gb: f64) -> u64 {
    (gb * 1024.0 * 1024.0 * 1024.0) as u64
}

/// Gigabytes → megabytes (managed-compute memory unit).
pub fn gb_to_mb(gb: f64) -> u64 {
    (gb * 1024.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framework_mapping() {
        assert_eq!(
            ServiceKind::from_framework("sklearn"),
            Some(ServiceKind::SklearnServer)
        );
        assert_eq!(
            ServiceKind::from_framework("Scikit-Learn"),
            Some(ServiceKind::SklearnServer)
        );
        assert_eq!(
            ServiceKind::from_framework("TensorFlow"),
            Some(ServiceKind::TensorflowServer)
        );
        assert_eq!(
            ServiceKind::from_framework("pytorch"),
            Some(ServiceKind::TorchServer)
        );
        assert_eq!(ServiceKind::from_framework("prolog"), None);
    }

    #[test]
    fn model_server_kinds() {
        assert!(ServiceKind::SklearnServer.is_model_server());
        assert!(ServiceKind::TorchServer.is_model_server());
        assert!(!ServiceKind::Jupyter.is_model_server());
        assert!(!ServiceKind::VsCode.is_model_server());
    }

    #[test]
    fn unit_conversions() {
        assert_eq!(cpus_to_nano(0.5), 500_000_000);
        assert_eq!(cpus_to_nano(2.0), 2_000_000_000);
        assert_eq!(cpus_to_milli(0.25), 250);
        assert_eq!(cpus_to_milli(1.0), 1000);
        assert_eq!(gb_to_bytes(1.0), 1024 * 1024 * 1024);
        assert_eq!(gb_to_mb(0.5), 512);
    }

    #[test]
    fn descriptor_round_trips_through_json() {
        let descriptor = ServiceDescriptor {
            kind: ServiceKind::Jupyter,
            name: "i-jupyter-alice".to_string(),
            state: ServiceState::Pending,
            vars: HashMap::from([("NB_TOKEN".to_string(), "x".to_string())]),
            backend: BackendSpec::Docker(DockerSpec {
                image: "jupyter/base-notebook:python-3.11".to_string(),
                cmd: vec![],
                env: HashMap::new(),
                ports: vec![PortBinding {
                    container: 8888,
                    host: 0,
                }],
                memory_bytes: Some(2 * 1024 * 1024 * 1024),
                nano_cpus: Some(1_000_000_000),
                labels: HashMap::new(),
                network: None,
                health_cmd: None,
            }),
        };

        let json = serde_json::to_string(&descriptor).unwrap();
        let back: ServiceDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, descriptor);
    }

    #[test]
    fn with_state_replaces_only_state() {
        let descriptor = ServiceDescriptor {
            kind: ServiceKind::SklearnServer,
            name: "s-ws1".to_string(),
            state: ServiceState::Pending,
            vars: HashMap::new(),
            backend: BackendSpec::Mock,
        };

        let running = descriptor.clone().with_state(ServiceState::Running);
        assert_eq!(running.state, ServiceState::Running);
        assert_eq!(running.name, descriptor.name);
    }
}
