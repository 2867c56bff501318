//! Cluster orchestration backend.
//!
//! Every workload materializes as a fixed triple: a ClusterIP Service, a
//! path-routing Ingress, and a Deployment. `start`/`stop` apply/delete the
//! three objects concurrently and independently; a failure on one object is
//! logged and swallowed so it never blocks the others (eventual consistency
//! over stop-the-world failure). `get_state` reads the workload object's
//! condition list; a read failure maps to `Inactive` since the cluster is
//! the source of truth and absence means torn down.

use std::collections::HashMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::Client;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, LogParams, Patch, PatchParams};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use modelgrid_core::{
    BackendSpec, DeploymentParams, ExecOutput, ImageConfig, InstanceParams, KubeBackendConfig,
    KubeSpec, RoutingConfig, ServiceDescriptor, ServiceKind, ServiceState, cpus_to_milli,
    gb_to_bytes,
};

use crate::error::{ProviderError, ProviderResult};

const MANAGER: &str = "modelgrid";
const MANAGED_LABEL: &str = "modelgrid.managed";
const KIND_LABEL: &str = "modelgrid.kind";

/// Adapter over the cluster orchestration API.
pub struct KubeBackend {
    client: Client,
    namespace: String,
}

impl KubeBackend {
    /// Connect using the ambient kubeconfig/in-cluster environment.
    pub async fn connect(config: &KubeBackendConfig) -> ProviderResult<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| ProviderError::Backend(format!("cluster client: {e}")))?;
        Ok(Self {
            client,
            namespace: config.namespace.clone(),
        })
    }

    /// Images are pulled by the cluster itself; provisioning is a no-op.
    pub async fn provision(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        Ok(descriptor)
    }

    pub async fn start(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        let spec = kube_spec(&descriptor)?;
        let name = descriptor.name.as_str();
        let pp = PatchParams::apply(MANAGER).force();

        let services: Api<Service> = Api::namespaced(self.client.clone(), &spec.namespace);
        let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), &spec.namespace);
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &spec.namespace);

        let service = service_manifest(&descriptor, spec);
        let ingress = ingress_manifest(&descriptor, spec);
        let workload = deployment_manifest(&descriptor, spec);

        let service_patch = Patch::Apply(&service);
        let ingress_patch = Patch::Apply(&ingress);
        let workload_patch = Patch::Apply(&workload);
        let (svc, ing, dep) = tokio::join!(
            services.patch(name, &pp, &service_patch),
            ingresses.patch(name, &pp, &ingress_patch),
            deployments.patch(name, &pp, &workload_patch),
        );
        if let Some(e) = svc.err() {
            warn!(%name, error = %e, "service apply failed");
        }
        if let Some(e) = ing.err() {
            warn!(%name, error = %e, "ingress apply failed");
        }
        if let Some(e) = dep.err() {
            warn!(%name, error = %e, "workload apply failed");
        }

        Ok(descriptor.with_state(ServiceState::Pending))
    }

    pub async fn stop(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        let spec = kube_spec(&descriptor)?;
        let name = descriptor.name.as_str();
        let dp = DeleteParams::default();

        let services: Api<Service> = Api::namespaced(self.client.clone(), &spec.namespace);
        let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), &spec.namespace);
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &spec.namespace);

        let (svc, ing, dep) = tokio::join!(
            services.delete(name, &dp),
            ingresses.delete(name, &dp),
            deployments.delete(name, &dp),
        );
        for (object, error) in [
            ("service", svc.err()),
            ("ingress", ing.err()),
            ("workload", dep.err()),
        ] {
            match error {
                None => {}
                Some(e) if is_not_found(&e) => {}
                Some(e) => warn!(%name, object, error = %e, "object delete failed"),
            }
        }

        Ok(descriptor.with_state(ServiceState::Stopping))
    }

    /// Teardown and stop coincide here: deleting the triple is the whole
    /// cleanup.
    pub async fn delete(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        let stopped = self.stop(descriptor).await?;
        Ok(stopped.with_state(ServiceState::Stopped))
    }

    /// Server-side apply is idempotent, so update re-applies the triple.
    pub async fn update(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        self.start(descriptor).await
    }

    pub async fn get_state(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        let spec = kube_spec(&descriptor)?;
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &spec.namespace);
        let state = match deployments.get(&descriptor.name).await {
            Ok(workload) => map_workload_state(&workload),
            Err(e) => {
                debug!(name = %descriptor.name, error = %e, "workload read failed");
                ServiceState::Inactive
            }
        };
        Ok(descriptor.with_state(state))
    }

    pub async fn get_logs(&self, descriptor: &ServiceDescriptor) -> ProviderResult<String> {
        let spec = kube_spec(descriptor)?;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &spec.namespace);
        let pod_name = self.find_pod(&pods, &descriptor.name).await?;
        pods.logs(
            &pod_name,
            &LogParams {
                tail_lines: Some(100),
                ..LogParams::default()
            },
        )
        .await
        .map_err(|e| ProviderError::Backend(format!("logs {pod_name}: {e}")))
    }

    pub async fn exec(&self, name: &str, command: &[String]) -> ProviderResult<ExecOutput> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let pod_name = self.find_pod(&pods, name).await?;

        let ap = AttachParams::default().stdout(true).stderr(true);
        let mut process = pods
            .exec(&pod_name, command.to_vec(), &ap)
            .await
            .map_err(|e| ProviderError::Backend(format!("exec {pod_name}: {e}")))?;

        let mut stdout = String::new();
        if let Some(mut reader) = process.stdout() {
            let mut buf = Vec::new();
            reader
                .read_to_end(&mut buf)
                .await
                .map_err(|e| ProviderError::Backend(format!("exec stdout: {e}")))?;
            stdout = String::from_utf8_lossy(&buf).into_owned();
        }
        let mut stderr = String::new();
        if let Some(mut reader) = process.stderr() {
            let mut buf = Vec::new();
            reader
                .read_to_end(&mut buf)
                .await
                .map_err(|e| ProviderError::Backend(format!("exec stderr: {e}")))?;
            stderr = String::from_utf8_lossy(&buf).into_owned();
        }

        let exit_code = match process.take_status() {
            Some(status) => status.await.and_then(|s| match s.status.as_deref() {
                Some("Success") => Some(0),
                _ => None,
            }),
            None => None,
        };
        process
            .join()
            .await
            .map_err(|e| ProviderError::Backend(format!("exec join: {e}")))?;

        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    pub async fn list_services(&self) -> ProviderResult<Vec<ServiceDescriptor>> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let lp = ListParams::default().labels(&format!("{MANAGED_LABEL}=true"));
        let list = deployments
            .list(&lp)
            .await
            .map_err(|e| ProviderError::Backend(format!("workload list: {e}")))?;

        let mut descriptors = Vec::new();
        for workload in list.items {
            let Some(name) = workload.metadata.name.clone() else {
                continue;
            };
            let Some(kind) = workload
                .metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(KIND_LABEL))
                .and_then(|slug| ServiceKind::from_slug(slug))
            else {
                continue;
            };
            let state = map_workload_state(&workload);
            let image = workload
                .spec
                .as_ref()
                .and_then(|s| s.template.spec.as_ref())
                .and_then(|s| s.containers.first())
                .and_then(|c| c.image.clone())
                .unwrap_or_default();
            descriptors.push(ServiceDescriptor {
                kind,
                name,
                state,
                vars: HashMap::new(),
                backend: BackendSpec::Kubernetes(KubeSpec {
                    namespace: self.namespace.clone(),
                    image,
                    replicas: 1,
                    port: kind.default_port(),
                    route_path: String::new(),
                    env: HashMap::new(),
                    labels: HashMap::new(),
                    cpu_milli: 0,
                    memory_bytes: 0,
                    ingress_host: None,
                }),
            });
        }
        Ok(descriptors)
    }

    async fn find_pod(&self, pods: &Api<Pod>, name: &str) -> ProviderResult<String> {
        let lp = ListParams::default().labels(&format!("app={name}"));
        let list = pods
            .list(&lp)
            .await
            .map_err(|e| ProviderError::Backend(format!("pod list {name}: {e}")))?;
        list.items
            .first()
            .and_then(|pod| pod.metadata.name.clone())
            .ok_or_else(|| ProviderError::NotFound(name.to_string()))
    }
}

fn kube_spec(descriptor: &ServiceDescriptor) -> ProviderResult<&KubeSpec> {
    match &descriptor.backend {
        BackendSpec::Kubernetes(spec) => Ok(spec),
        _ => Err(ProviderError::Descriptor(format!(
            "descriptor {} does not carry cluster fields",
            descriptor.name
        ))),
    }
}

fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

/// Available=True on the workload means serving traffic; everything else is
/// still converging.
fn map_workload_state(workload: &Deployment) -> ServiceState {
    let available = workload
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Available" && c.status == "True")
        })
        .unwrap_or(false);
    if available {
        ServiceState::Running
    } else {
        ServiceState::Pending
    }
}

// ── Manifests ─────────────────────────────────────────────────────

fn object_labels(descriptor: &ServiceDescriptor, spec: &KubeSpec) -> serde_json::Value {
    let mut labels = spec.labels.clone();
    labels.insert("app".to_string(), descriptor.name.clone());
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
    labels.insert(KIND_LABEL.to_string(), descriptor.kind.slug().to_string());
    serde_json::json!(labels)
}

fn deployment_manifest(descriptor: &ServiceDescriptor, spec: &KubeSpec) -> serde_json::Value {
    let labels = object_labels(descriptor, spec);

    let mut env: Vec<(String, String)> = spec
        .env
        .iter()
        .chain(descriptor.vars.iter())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.sort();
    let env: Vec<serde_json::Value> = env
        .into_iter()
        .map(|(name, value)| serde_json::json!({ "name": name, "value": value }))
        .collect();

    serde_json::json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": descriptor.name,
            "namespace": spec.namespace,
            "labels": labels,
        },
        "spec": {
            "replicas": spec.replicas,
            "selector": { "matchLabels": { "app": descriptor.name } },
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "containers": [{
                        "name": descriptor.name,
                        "image": spec.image,
                        "ports": [{ "containerPort": spec.port }],
                        "env": env,
                        "resources": {
                            "limits": {
                                "cpu": format!("{}m", spec.cpu_milli),
                                "memory": spec.memory_bytes.to_string(),
                            },
                        },
                        "readinessProbe": {
                            "httpGet": {
                                "path": descriptor.kind.health_path(),
                                "port": spec.port,
                            },
                            "initialDelaySeconds": 5,
                            "periodSeconds": 10,
                        },
                    }],
                },
            },
        },
    })
}

fn service_manifest(descriptor: &ServiceDescriptor, spec: &KubeSpec) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": descriptor.name,
            "namespace": spec.namespace,
            "labels": object_labels(descriptor, spec),
        },
        "spec": {
            "type": "ClusterIP",
            "selector": { "app": descriptor.name },
            "ports": [{ "port": 80, "targetPort": spec.port }],
        },
    })
}

fn ingress_manifest(descriptor: &ServiceDescriptor, spec: &KubeSpec) -> serde_json::Value {
    let http_rule = serde_json::json!({
        "paths": [{
            "path": spec.route_path,
            "pathType": "Prefix",
            "backend": {
                "service": {
                    "name": descriptor.name,
                    "port": { "number": 80 },
                },
            },
        }],
    });
    let rule = match &spec.ingress_host {
        Some(host) => serde_json::json!({ "host": host, "http": http_rule }),
        None => serde_json::json!({ "http": http_rule }),
    };
    serde_json::json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": {
            "name": descriptor.name,
            "namespace": spec.namespace,
            "labels": object_labels(descriptor, spec),
        },
        "spec": { "rules": [rule] },
    })
}

// ── Config builder ────────────────────────────────────────────────

/// Expands deployment/instance parameters into cluster descriptors.
/// Pure; namespace, ingress host, and routing conventions come from config.
#[derive(Debug, Clone)]
pub struct KubeConfigBuilder {
    pub routing: RoutingConfig,
    pub images: ImageConfig,
    pub namespace: String,
    pub ingress_host: Option<String>,
}

impl KubeConfigBuilder {
    pub fn new(config: &KubeBackendConfig, routing: RoutingConfig, images: ImageConfig) -> Self {
        Self {
            routing,
            images,
            namespace: config.namespace.clone(),
            ingress_host: config.ingress_host.clone(),
        }
    }

    pub fn deployment_config(&self, params: &DeploymentParams) -> ServiceDescriptor {
        let name = self.routing.deployment_name(&params.workspace_id);
        let route_path = self.routing.service_route(&params.workspace_id);

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
            backend: BackendSpec::Kubernetes(self.kube_spec(
                params.kind,
                route_path,
                params.runtime.as_deref(),
                params.cpus,
                params.memory_gb,
                env,
                labels,
            )),
        }
    }

    pub fn development_config(&self, params: &InstanceParams) -> ServiceDescriptor {
        let route_path = self.routing.instance_route(&params.name);

        let mut env = HashMap::new();
        if !params.packages.is_empty() {
            env.insert("MG_PACKAGES".to_string(), params.packages.join(" "));
        }

        ServiceDescriptor {
            kind: params.kind,
            name: params.name.clone(),
            state: ServiceState::Pending,
            vars: HashMap::new(),
            backend: BackendSpec::Kubernetes(self.kube_spec(
                params.kind,
                route_path,
                params.runtime.as_deref(),
                params.cpus,
                params.memory_gb,
                env,
                HashMap::new(),
            )),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn kube_spec(
        &self,
        kind: ServiceKind,
        route_path: String,
        runtime: Option<&str>,
        cpus: Option<f64>,
        memory_gb: Option<f64>,
        env: HashMap<String, String>,
        labels: HashMap<String, String>,
    ) -> KubeSpec {
        KubeSpec {
            namespace: self.namespace.clone(),
            image: self.images.resolve(kind, runtime.unwrap_or("latest")),
            replicas: 1,
            port: kind.default_port(),
            route_path,
            env,
            labels,
            cpu_milli: cpus_to_milli(cpus.unwrap_or(1.0)),
            memory_bytes: gb_to_bytes(memory_gb.unwrap_or(2.0)),
            ingress_host: self.ingress_host.clone(),
        }
    }
}
