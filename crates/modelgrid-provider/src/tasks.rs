//! Managed container-task backend.
//!
//! Mirrors the batch backend over the task-compute API: `provision`
//! registers the task definition, `start` runs a task with container
//! overrides, teardown stops the task without waiting. Logs come from the
//! log stream keyed by the deterministic `{definition}/{name}/{task_id}`
//! path the definition's log configuration produces.

use bytes::Bytes;
use serde::Deserialize;
use tracing::debug;

use modelgrid_core::{
    BackendSpec, DeploymentParams, ImageConfig, InstanceParams, RoutingConfig, ServiceDescriptor,
    ServiceKind, ServiceState, TaskSpec, TasksBackendConfig, cpus_to_milli, gb_to_mb,
};

use crate::aws::{AwsClient, AwsCredentials};
use crate::error::{ProviderError, ProviderResult};

const ECS_PREFIX: &str = "AmazonEC2ContainerServiceV20141113";
const LOGS_TARGET_GET_EVENTS: &str = "Logs_20140328.GetLogEvents";

/// Adapter over the managed container-task service.
pub struct TaskBackend {
    ecs: AwsClient,
    logs: AwsClient,
    launch_type: String,
}

// ── Wire types ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunTaskResponse {
    #[serde(default)]
    tasks: Vec<TaskDetail>,
    #[serde(default)]
    failures: Vec<TaskFailure>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeTasksResponse {
    #[serde(default)]
    tasks: Vec<TaskDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskDetail {
    task_arn: String,
    last_status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskFailure {
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListTasksResponse {
    #[serde(default)]
    task_arns: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogEventsResponse {
    #[serde(default)]
    events: Vec<LogEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogEvent {
    message: String,
}

impl TaskBackend {
    pub fn new(config: &TasksBackendConfig) -> ProviderResult<Self> {
        let credentials = AwsCredentials {
            access_key_id: config.access_key_id.clone(),
            secret_access_key: config.secret_access_key.clone(),
        };
        Ok(Self {
            ecs: AwsClient::new(
                "ecs",
                &config.region,
                config.endpoint.as_deref(),
                credentials.clone(),
            )?,
            logs: AwsClient::new(
                "logs",
                &config.region,
                config.endpoint.as_deref(),
                credentials,
            )?,
            launch_type: config.launch_type.clone(),
        })
    }

    /// Register the task definition; the log configuration pins the stream
    /// prefix to the definition name so streams come out as
    /// `{definition}/{container}/{task_id}`.
    pub async fn provision(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        let spec = task_spec(&descriptor)?;
        let body = serde_json::json!({
            "family": spec.task_definition,
            "containerDefinitions": [{
                "name": descriptor.name,
                "image": spec.image,
                "cpu": spec.cpu_units,
                "memory": spec.memory_mb,
                "essential": true,
                "environment": env_pairs(spec, &descriptor),
                "logConfiguration": {
                    "logDriver": "awslogs",
                    "options": {
                        "awslogs-group": spec.log_group,
                        "awslogs-region": self.ecs.region(),
                        "awslogs-stream-prefix": spec.task_definition,
                    },
                },
            }],
        });
        self.ecs
            .post_json("/", Some(&target("RegisterTaskDefinition")), &body)
            .await?;
        debug!(definition = %spec.task_definition, "task definition registered");
        Ok(descriptor)
    }

    pub async fn start(&self, mut descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        let spec = task_spec(&descriptor)?;
        let body = serde_json::json!({
            "cluster": spec.cluster,
            "taskDefinition": spec.task_definition,
            "launchType": self.launch_type,
            "startedBy": descriptor.name,
            "overrides": {
                "containerOverrides": [{
                    "name": descriptor.name,
                    "environment": env_pairs(spec, &descriptor),
                }],
            },
        });
        let bytes = self.ecs.post_json("/", Some(&target("RunTask")), &body).await?;
        let response: RunTaskResponse = parse(&bytes)?;
        let Some(task) = response.tasks.into_iter().next() else {
            let reason = response
                .failures
                .first()
                .map(|f| f.reason.clone())
                .unwrap_or_else(|| "no task placed".to_string());
            return Err(ProviderError::Backend(format!(
                "run task {}: {reason}",
                descriptor.name
            )));
        };
        debug!(name = %descriptor.name, task_arn = %task.task_arn, "task started");

        if let BackendSpec::Tasks(spec) = &mut descriptor.backend {
            spec.task_arn = Some(task.task_arn);
        }
        Ok(descriptor.with_state(ServiceState::Pending))
    }

    /// Stop the task; does not wait for the kill to take effect.
    pub async fn stop(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        let spec = task_spec(&descriptor)?;
        let Some(task_arn) = self.resolve_task_arn(&descriptor).await? else {
            return Ok(descriptor.with_state(ServiceState::Stopping));
        };
        let body = serde_json::json!({
            "cluster": spec.cluster,
            "task": task_arn,
            "reason": "stopped by operator",
        });
        self.fire_teardown(&body).await?;
        Ok(descriptor.with_state(ServiceState::Stopping))
    }

    /// Teardown coincides with stop; stopped tasks are garbage-collected by
    /// the service.
    pub async fn delete(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        let stopped = self.stop(descriptor).await?;
        Ok(stopped.with_state(ServiceState::Stopped))
    }

    /// A fresh run supersedes the old task.
    pub async fn update(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        self.start(descriptor).await
    }

    pub async fn get_state(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        let state = match self.lookup_status(&descriptor).await {
            Ok(Some(status)) => map_task_status(&status),
            Ok(None) => ServiceState::Unknown,
            Err(e) => {
                debug!(name = %descriptor.name, error = %e, "state lookup failed");
                ServiceState::Unknown
            }
        };
        Ok(descriptor.with_state(state))
    }

    /// Read up to the most recent 100 lines from the task's log stream.
    pub async fn get_logs(&self, descriptor: &ServiceDescriptor) -> ProviderResult<String> {
        let spec = task_spec(descriptor)?;
        let task_arn = self
            .resolve_task_arn(descriptor)
            .await?
            .ok_or_else(|| ProviderError::NotFound(descriptor.name.clone()))?;
        let task_id = task_arn.rsplit('/').next().unwrap_or(&task_arn);
        let stream = format!("{}/{}/{task_id}", spec.task_definition, descriptor.name);

        let body = serde_json::json!({
            "logGroupName": spec.log_group,
            "logStreamName": stream,
            "limit": 100,
            "startFromHead": false,
        });
        let bytes = self
            .logs
            .post_json("/", Some(LOGS_TARGET_GET_EVENTS), &body)
            .await?;
        let events: LogEventsResponse = parse(&bytes)?;
        let mut text = String::new();
        for event in events.events {
            text.push_str(&event.message);
            text.push('\n');
        }
        Ok(text)
    }

    // ── Internals ──────────────────────────────────────────────────

    async fn resolve_task_arn(&self, descriptor: &ServiceDescriptor) -> ProviderResult<Option<String>> {
        let spec = task_spec(descriptor)?;
        if let Some(task_arn) = &spec.task_arn {
            return Ok(Some(task_arn.clone()));
        }
        // Tasks are tagged with startedBy = name; check live ones first,
        // then recently stopped.
        for desired_status in ["RUNNING", "STOPPED"] {
            let body = serde_json::json!({
                "cluster": spec.cluster,
                "startedBy": descriptor.name,
                "desiredStatus": desired_status,
            });
            let bytes = self.ecs.post_json("/", Some(&target("ListTasks")), &body).await?;
            let listed: ListTasksResponse = parse(&bytes)?;
            if let Some(task_arn) = listed.task_arns.into_iter().next() {
                return Ok(Some(task_arn));
            }
        }
        Ok(None)
    }

    async fn lookup_status(&self, descriptor: &ServiceDescriptor) -> ProviderResult<Option<String>> {
        let spec = task_spec(descriptor)?;
        let Some(task_arn) = self.resolve_task_arn(descriptor).await? else {
            return Ok(None);
        };
        let body = serde_json::json!({ "cluster": spec.cluster, "tasks": [task_arn] });
        let bytes = self
            .ecs
            .post_json("/", Some(&target("DescribeTasks")), &body)
            .await?;
        let described: DescribeTasksResponse = parse(&bytes)?;
        Ok(described.tasks.into_iter().next().and_then(|t| t.last_status))
    }

    /// Stop calls tolerate client errors: stopping an already-stopped or
    /// unknown task is a no-op.
    async fn fire_teardown(&self, body: &serde_json::Value) -> ProviderResult<()> {
        let (status, bytes) = self
            .ecs
            .post_json_raw("/", Some(&target("StopTask")), body)
            .await?;
        if status.is_success() || status.is_client_error() {
            return Ok(());
        }
        Err(ProviderError::Backend(format!(
            "stop task: {status}: {}",
            String::from_utf8_lossy(&bytes).trim()
        )))
    }
}

fn target(operation: &str) -> String {
    format!("{ECS_PREFIX}.{operation}")
}

fn task_spec(descriptor: &ServiceDescriptor) -> ProviderResult<&TaskSpec> {
    match &descriptor.backend {
        BackendSpec::Tasks(spec) => Ok(spec),
        _ => Err(ProviderError::Descriptor(format!(
            "descriptor {} does not carry task fields",
            descriptor.name
        ))),
    }
}

/// STOPPED → Stopped, RUNNING → Running, provisioning/pending → Pending.
fn map_task_status(status: &str) -> ServiceState {
    match status {
        "STOPPED" | "DEPROVISIONING" => ServiceState::Stopped,
        "RUNNING" => ServiceState::Running,
        _ => ServiceState::Pending,
    }
}

fn env_pairs(spec: &TaskSpec, descriptor: &ServiceDescriptor) -> Vec<serde_json::Value> {
    let mut pairs: Vec<(String, String)> = spec
        .environment
        .iter()
        .chain(descriptor.vars.iter())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(name, value)| serde_json::json!({ "name": name, "value": value }))
        .collect()
}

fn parse<T: serde::de::DeserializeOwned>(bytes: &Bytes) -> ProviderResult<T> {
    serde_json::from_slice(bytes).map_err(|e| ProviderError::Serialize(e.to_string()))
}

// ── Config builder ────────────────────────────────────────────────

/// Expands deployment/instance parameters into task descriptors.
#[derive(Debug, Clone)]
pub struct TaskConfigBuilder {
    pub routing: RoutingConfig,
    pub images: ImageConfig,
    pub cluster: String,
    pub log_group: String,
}

impl TaskConfigBuilder {
    pub fn new(config: &TasksBackendConfig, routing: RoutingConfig, images: ImageConfig) -> Self {
        Self {
            routing,
            images,
            cluster: config.cluster.clone(),
            log_group: config.log_group.clone(),
        }
    }

    pub fn deployment_config(&self, params: &DeploymentParams) -> ServiceDescriptor {
        let name = self.routing.deployment_name(&params.workspace_id);

        let mut environment = std::collections::HashMap::new();
        environment.insert("MG_WORKSPACE_ID".to_string(), params.workspace_id.clone());
        if let Some(version) = params.version {
            environment.insert("MG_MODEL_VERSION".to_string(), version.to_string());
        }
        if let Some(framework) = &params.framework {
            environment.insert("MG_FRAMEWORK".to_string(), framework.clone());
        }

        ServiceDescriptor {
            kind: params.kind,
            name: name.clone(),
            state: ServiceState::Pending,
            vars: std::collections::HashMap::new(),
            backend: BackendSpec::Tasks(self.task_spec(
                params.kind,
                &name,
                params.runtime.as_deref(),
                params.cpus,
                params.memory_gb,
                environment,
            )),
        }
    }

    pub fn development_config(&self, params: &InstanceParams) -> ServiceDescriptor {
        let mut environment = std::collections::HashMap::new();
        if !params.packages.is_empty() {
            environment.insert("MG_PACKAGES".to_string(), params.packages.join(" "));
        }

        ServiceDescriptor {
            kind: params.kind,
            name: params.name.clone(),
            state: ServiceState::Pending,
            vars: std::collections::HashMap::new(),
            backend: BackendSpec::Tasks(self.task_spec(
                params.kind,
                &params.name,
                params.runtime.as_deref(),
                params.cpus,
                params.memory_gb,
                environment,
            )),
        }
    }

    fn task_spec(
        &self,
        kind: ServiceKind,
        name: &str,
        runtime: Option<&str>,
        cpus: Option<f64>,
        memory_gb: Option<f64>,
        environment: std::collections::HashMap<String, String>,
    ) -> TaskSpec {
        TaskSpec {
            cluster: self.cluster.clone(),
            task_definition: format!("{name}-def"),
            image: self.images.resolve(kind, runtime.unwrap_or("latest")),
            cpu_units: cpus_to_milli(cpus.unwrap_or(1.0)) * 1024 / 1000,
            memory_mb: gb_to_mb(memory_gb.unwrap_or(2.0)),
            environment,
            log_group: self.log_group.clone(),
            task_arn: None,
        }
    }
}
