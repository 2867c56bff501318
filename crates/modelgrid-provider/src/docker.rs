//! Local container runtime backend.
//!
//! `start` has replace-in-place semantics: a pre-existing container with
//! the same name is stopped and removed before the replacement is created.
//! State is derived from the live container inspection, mapping runtime
//! status strings onto the four-state model.

use std::collections::HashMap;

use tracing::debug;

use modelgrid_core::{
    BackendSpec, DeploymentParams, DockerBackendConfig, DockerSpec, ExecOutput, ImageConfig,
    InstanceParams, PortBinding, RoutingConfig, ServiceDescriptor, ServiceKind, ServiceState,
    cpus_to_nano, gb_to_bytes,
};

use crate::docker_client::{ContainerState, DockerClient};
use crate::error::{ProviderError, ProviderResult};

/// Label marking containers owned by this control plane.
const MANAGED_LABEL: &str = "modelgrid.managed";
const KIND_LABEL: &str = "modelgrid.kind";

/// Adapter over the local container runtime.
pub struct DockerBackend {
    client: DockerClient,
}

impl DockerBackend {
    pub fn new(config: &DockerBackendConfig) -> ProviderResult<Self> {
        Ok(Self {
            client: DockerClient::new(&config.endpoint)?,
        })
    }

    pub async fn provision(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        let spec = docker_spec(&descriptor)?;
        self.client.pull_image(&spec.image).await?;
        Ok(descriptor)
    }

    /// Replace-in-place: any same-named container is torn down first.
    pub async fn start(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        let spec = docker_spec(&descriptor)?;

        match self.client.stop_container(&descriptor.name).await {
            Ok(()) => debug!(name = %descriptor.name, "stopped previous container"),
            Err(ProviderError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        match self.client.remove_container(&descriptor.name).await {
            Ok(()) => debug!(name = %descriptor.name, "removed previous container"),
            Err(ProviderError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let body = container_create_body(&descriptor, spec);
        self.client.create_container(&descriptor.name, &body).await?;
        self.client.start_container(&descriptor.name).await?;
        Ok(descriptor.with_state(ServiceState::Pending))
    }

    pub async fn stop(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        match self.client.stop_container(&descriptor.name).await {
            Ok(()) | Err(ProviderError::NotFound(_)) => {
                Ok(descriptor.with_state(ServiceState::Stopping))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn delete(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        match self.client.remove_container(&descriptor.name).await {
            Ok(()) | Err(ProviderError::NotFound(_)) => {
                Ok(descriptor.with_state(ServiceState::Stopped))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn update(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        self.start(descriptor).await
    }

    pub async fn get_state(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        let state = match self.client.inspect_container(&descriptor.name).await {
            Ok(Some(inspect)) => map_container_state(&inspect.state),
            Ok(None) => ServiceState::Unknown,
            Err(e) => {
                debug!(name = %descriptor.name, error = %e, "state lookup failed");
                ServiceState::Unknown
            }
        };
        Ok(descriptor.with_state(state))
    }

    pub async fn get_logs(&self, descriptor: &ServiceDescriptor) -> ProviderResult<String> {
        self.client.logs(&descriptor.name, 100).await
    }

    pub async fn exec(&self, name: &str, command: &[String]) -> ProviderResult<ExecOutput> {
        self.client.exec(name, command).await
    }

    pub async fn list_services(&self) -> ProviderResult<Vec<ServiceDescriptor>> {
        let summaries = self
            .client
            .list_containers(&format!("{MANAGED_LABEL}=true"))
            .await?;

        let mut descriptors = Vec::new();
        for summary in summaries {
            let Some(kind) = summary
                .labels
                .get(KIND_LABEL)
                .and_then(|slug| ServiceKind::from_slug(slug))
            else {
                continue;
            };
            let Some(name) = summary.names.first() else {
                continue;
            };
            descriptors.push(ServiceDescriptor {
                kind,
                name: name.trim_start_matches('/').to_string(),
                state: map_summary_state(&summary.state, &summary.status),
                vars: HashMap::new(),
                backend: BackendSpec::Docker(DockerSpec {
                    image: summary.image,
                    cmd: vec![],
                    env: HashMap::new(),
                    ports: vec![],
                    memory_bytes: None,
                    nano_cpus: None,
                    labels: summary.labels,
                    network: None,
                    health_cmd: None,
                }),
            });
        }
        Ok(descriptors)
    }
}

fn docker_spec(descriptor: &ServiceDescriptor) -> ProviderResult<&DockerSpec> {
    match &descriptor.backend {
        BackendSpec::Docker(spec) => Ok(spec),
        _ => Err(ProviderError::Descriptor(format!(
            "descriptor {} does not carry container-runtime fields",
            descriptor.name
        ))),
    }
}

/// Map an inspected container state onto the four-state model.
fn map_container_state(state: &ContainerState) -> ServiceState {
    if let Some(health) = &state.health {
        return match health.status.as_str() {
            "healthy" => ServiceState::Running,
            "starting" => ServiceState::Pending,
            _ => ServiceState::Inactive,
        };
    }
    match state.status.as_str() {
        "running" | "created" => ServiceState::Pending,
        _ => ServiceState::Inactive,
    }
}

/// Map a container-list entry onto the four-state model.
///
/// The list endpoint folds health into the human status string, e.g.
/// `"Up 5 minutes (healthy)"`.
fn map_summary_state(state: &str, status: &str) -> ServiceState {
    if status.contains("(healthy)") {
        ServiceState::Running
    } else if state == "running" || state == "created" {
        ServiceState::Pending
    } else {
        ServiceState::Inactive
    }
}

/// Build the Engine container-create body from a descriptor.
fn container_create_body(descriptor: &ServiceDescriptor, spec: &DockerSpec) -> serde_json::Value {
    let mut env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    env.extend(descriptor.vars.iter().map(|(k, v)| format!("{k}={v}")));
    env.sort();

    let mut labels = spec.labels.clone();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
    labels.insert(KIND_LABEL.to_string(), descriptor.kind.slug().to_string());

    let mut exposed = serde_json::Map::new();
    let mut port_bindings = serde_json::Map::new();
    for binding in &spec.ports {
        let key = format!("{}/tcp", binding.container);
        exposed.insert(key.clone(), serde_json::json!({}));
        let host_port = if binding.host == 0 {
            String::new()
        } else {
            binding.host.to_string()
        };
        port_bindings.insert(key, serde_json::json!([{ "HostPort": host_port }]));
    }

    let mut body = serde_json::json!({
        "Image": spec.image,
        "Env": env,
        "Labels": labels,
        "ExposedPorts": exposed,
        "HostConfig": {
            "PortBindings": port_bindings,
            "RestartPolicy": { "Name": "unless-stopped" },
        },
    });
    if !spec.cmd.is_empty() {
        body["Cmd"] = serde_json::json!(spec.cmd);
    }
    if let Some(memory) = spec.memory_bytes {
        body["HostConfig"]["Memory"] = serde_json::json!(memory);
    }
    if let Some(nano_cpus) = spec.nano_cpus {
        body["HostConfig"]["NanoCpus"] = serde_json::json!(nano_cpus);
    }
    if let Some(network) = &spec.network {
        body["HostConfig"]["NetworkMode"] = serde_json::json!(network);
    }
    if let Some(health_cmd) = &spec.health_cmd {
        body["Healthcheck"] = serde_json::json!({
            "Test": health_cmd,
            "Interval": 10_000_000_000u64,
            "Retries": 3,
        });
    }
    body
}

// ── Config builder ────────────────────────────────────────────────

/// Expands deployment/instance parameters into container-runtime
/// descriptors. Pure; all variability comes in through the config.
#[derive(Debug, Clone)]
pub struct DockerConfigBuilder {
    pub routing: RoutingConfig,
    pub images: ImageConfig,
    pub network: Option<String>,
}

impl DockerConfigBuilder {
    pub fn new(config: &DockerBackendConfig, routing: RoutingConfig, images: ImageConfig) -> Self {
        Self {
            routing,
            images,
            network: config.network.clone(),
        }
    }

    pub fn deployment_config(&self, params: &DeploymentParams) -> ServiceDescriptor {
        let name = self.routing.deployment_name(&params.workspace_id);
        let port = params.kind.default_port();

        let mut env = HashMap::new();
        env.insert("MG_WORKSPACE_ID".to_string(), params.workspace_id.clone());
        if let Some(version) = params.version {
            env.insert("MG_MODEL_VERSION".to_string(), version.to_string());
        }
        if let Some(framework) = &params.framework {
            env.insert("MG_FRAMEWORK".to_string(), framework.clone());
        }

        let labels = HashMap::from([(
            "modelgrid.workspace".to_string(),
            params.workspace_id.clone(),
        )]);

        ServiceDescriptor {
            kind: params.kind,
            name,
            state: ServiceState::Pending,
            vars: HashMap::new(),
            backend: BackendSpec::Docker(self.docker_spec(
                params.kind,
                port,
                params.runtime.as_deref(),
                params.cpus,
                params.memory_gb,
                env,
                labels,
            )),
        }
    }

    pub fn development_config(&self, params: &InstanceParams) -> ServiceDescriptor {
        let port = params.kind.default_port();

        let mut env = HashMap::new();
        if !params.packages.is_empty() {
            env.insert("MG_PACKAGES".to_string(), params.packages.join(" "));
        }

        ServiceDescriptor {
            kind: params.kind,
            name: params.name.clone(),
            state: ServiceState::Pending,
            vars: HashMap::new(),
            backend: BackendSpec::Docker(self.docker_spec(
                params.kind,
                port,
                params.runtime.as_deref(),
                params.cpus,
                params.memory_gb,
                env,
                HashMap::new(),
            )),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn docker_spec(
        &self,
        kind: ServiceKind,
        port: u16,
        runtime: Option<&str>,
        cpus: Option<f64>,
        memory_gb: Option<f64>,
        env: HashMap<String, String>,
        labels: HashMap<String, String>,
    ) -> DockerSpec {
        DockerSpec {
            image: self.images.resolve(kind, runtime.unwrap_or("latest")),
            cmd: vec![],
            env,
            ports: vec![PortBinding {
                container: port,
                host: 0,
            }],
            memory_bytes: Some(gb_to_bytes(memory_gb.unwrap_or(2.0))),
            nano_cpus: Some(cpus_to_nano(cpus.unwrap_or(1.0))),
            labels,
            network: self.network.clone(),
            health_cmd: Some(vec![
                "CMD-SHELL".to_string(),
                format!(
                    "curl -fs http://localhost:{port}{} || exit 1",
                    kind.health_path()
                ),
            ]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker_client::ContainerHealth;

    fn builder() -> DockerConfigBuilder {
        DockerConfigBuilder {
            routing: RoutingConfig::default(),
            images: ImageConfig::default(),
            network: Some("modelgrid".to_string()),
        }
    }

    fn deployment_params() -> DeploymentParams {
        DeploymentParams {
            kind: ServiceKind::SklearnServer,
            workspace_id: "c1".to_string(),
            version: Some(3),
            runtime: Some("py311".to_string()),
            framework: Some("sklearn".to_string()),
            cpus: Some(0.5),
            memory_gb: Some(1.0),
        }
    }

    #[test]
    fn deployment_config_derives_identity_and_limits() {
        let descriptor = builder().deployment_config(&deployment_params());

        assert_eq!(descriptor.name, "s-c1");
        assert_eq!(descriptor.state, ServiceState::Pending);
        let BackendSpec::Docker(spec) = &descriptor.backend else {
            panic!("expected docker fields");
        };
        assert_eq!(spec.image, "modelgrid/sklearn-server:py311");
        assert_eq!(spec.nano_cpus, Some(500_000_000));
        assert_eq!(spec.memory_bytes, Some(1024 * 1024 * 1024));
        assert_eq!(spec.env["MG_MODEL_VERSION"], "3");
        assert_eq!(spec.network.as_deref(), Some("modelgrid"));
        assert_eq!(spec.ports, vec![PortBinding { container: 8080, host: 0 }]);
    }

    #[test]
    fn development_config_carries_packages() {
        let descriptor = builder().development_config(&InstanceParams {
            name: "i-jupyter-alice".to_string(),
            kind: ServiceKind::Jupyter,
            runtime: None,
            cpus: None,
            memory_gb: None,
            packages: vec!["numpy".to_string(), "pandas".to_string()],
        });

        assert_eq!(descriptor.name, "i-jupyter-alice");
        let BackendSpec::Docker(spec) = &descriptor.backend else {
            panic!("expected docker fields");
        };
        assert_eq!(spec.image, "jupyter/base-notebook:latest");
        assert_eq!(spec.env["MG_PACKAGES"], "numpy pandas");
        // Defaults apply when the caller leaves limits unset.
        assert_eq!(spec.nano_cpus, Some(1_000_000_000));
        assert_eq!(spec.memory_bytes, Some(2 * 1024 * 1024 * 1024));
    }

    #[test]
    fn healthy_container_is_running() {
        let state = ContainerState {
            status: "running".to_string(),
            running: true,
            health: Some(ContainerHealth {
                status: "healthy".to_string(),
            }),
        };
        assert_eq!(map_container_state(&state), ServiceState::Running);
    }

    #[test]
    fn running_without_health_is_pending() {
        let state = ContainerState {
            status: "running".to_string(),
            running: true,
            health: None,
        };
        assert_eq!(map_container_state(&state), ServiceState::Pending);

        let created = ContainerState {
            status: "created".to_string(),
            running: false,
            health: None,
        };
        assert_eq!(map_container_state(&created), ServiceState::Pending);
    }

    #[test]
    fn exited_container_is_inactive() {
        let state = ContainerState {
            status: "exited".to_string(),
            running: false,
            health: None,
        };
        assert_eq!(map_container_state(&state), ServiceState::Inactive);

        let unhealthy = ContainerState {
            status: "running".to_string(),
            running: true,
            health: Some(ContainerHealth {
                status: "unhealthy".to_string(),
            }),
        };
        assert_eq!(map_container_state(&unhealthy), ServiceState::Inactive);
    }

    #[test]
    fn summary_state_mapping() {
        assert_eq!(
            map_summary_state("running", "Up 5 minutes (healthy)"),
            ServiceState::Running
        );
        assert_eq!(
            map_summary_state("running", "Up 5 minutes"),
            ServiceState::Pending
        );
        assert_eq!(
            map_summary_state("exited", "Exited (0) 2 hours ago"),
            ServiceState::Inactive
        );
    }

    #[test]
    fn create_body_merges_vars_and_sets_labels() {
        let mut descriptor = builder().deployment_config(&deployment_params());
        descriptor
            .vars
            .insert("EXTRA".to_string(), "1".to_string());
        let BackendSpec::Docker(spec) = descriptor.backend.clone() else {
            panic!("expected docker fields");
        };

        let body = container_create_body(&descriptor, &spec);
        let env: Vec<String> = body["Env"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert!(env.contains(&"EXTRA=1".to_string()));
        assert!(env.contains(&"MG_WORKSPACE_ID=c1".to_string()));
        assert_eq!(body["Labels"]["modelgrid.managed"], "true");
        assert_eq!(body["Labels"]["modelgrid.kind"], "sklearn");
        assert_eq!(body["HostConfig"]["NetworkMode"], "modelgrid");
        assert!(body["Healthcheck"]["Test"][1]
            .as_str()
            .unwrap()
            .contains("/health"));
    }
}
