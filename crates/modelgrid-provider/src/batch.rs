//! Managed batch compute backend.
//!
//! Model servers run as long-lived batch jobs: `provision` registers the
//! job definition, `start` submits a job with container overrides, and
//! teardown issues cancel/terminate requests without waiting for their
//! effect (convergence is the caller's responsibility via the poller).

use bytes::Bytes;
use serde::Deserialize;
use tracing::debug;

use modelgrid_core::{
    BackendSpec, BatchBackendConfig, BatchSpec, DeploymentParams, ImageConfig, InstanceParams,
    RoutingConfig, ServiceDescriptor, ServiceKind, ServiceState, gb_to_mb,
};

use crate::aws::{AwsClient, AwsCredentials};
use crate::error::{ProviderError, ProviderResult};

const LOGS_TARGET_GET_EVENTS: &str = "Logs_20140328.GetLogEvents";

/// Adapter over the managed batch compute service.
pub struct BatchBackend {
    batch: AwsClient,
    logs: AwsClient,
    log_group: String,
}

// ── Wire types ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitJobResponse {
    job_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeJobsResponse {
    #[serde(default)]
    jobs: Vec<JobDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobDetail {
    #[allow(dead_code)]
    job_id: String,
    status: String,
    container: Option<JobContainer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobContainer {
    log_stream_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListJobsResponse {
    #[serde(default)]
    job_summary_list: Vec<JobSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobSummary {
    job_id: String,
    status: String,
    #[serde(default)]
    created_at: i64,
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

impl BatchBackend {
    pub fn new(config: &BatchBackendConfig) -> ProviderResult<Self> {
        let credentials = AwsCredentials {
            access_key_id: config.access_key_id.clone(),
            secret_access_key: config.secret_access_key.clone(),
        };
        Ok(Self {
            batch: AwsClient::new(
                "batch",
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
            log_group: config.log_group.clone(),
        })
    }

    /// Register the job definition so submissions can reference it.
    pub async fn provision(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        let spec = batch_spec(&descriptor)?;
        let body = serde_json::json!({
            "jobDefinitionName": spec.job_definition,
            "type": "container",
            "containerProperties": {
                "image": spec.image,
                "vcpus": spec.vcpus,
                "memory": spec.memory_mb,
                "command": spec.command,
                "environment": env_pairs(spec, &descriptor),
            },
        });
        self.batch
            .post_json("/v1/registerjobdefinition", None, &body)
            .await?;
        debug!(definition = %spec.job_definition, "job definition registered");
        Ok(descriptor)
    }

    pub async fn start(&self, mut descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        let spec = batch_spec(&descriptor)?;
        let body = serde_json::json!({
            "jobName": descriptor.name,
            "jobQueue": spec.job_queue,
            "jobDefinition": spec.job_definition,
            "containerOverrides": {
                "environment": env_pairs(spec, &descriptor),
            },
        });
        let bytes = self.batch.post_json("/v1/submitjob", None, &body).await?;
        let submitted: SubmitJobResponse = parse(&bytes)?;
        debug!(name = %descriptor.name, job_id = %submitted.job_id, "job submitted");

        if let BackendSpec::Batch(spec) = &mut descriptor.backend {
            spec.job_id = Some(submitted.job_id);
        }
        Ok(descriptor.with_state(ServiceState::Pending))
    }

    /// Terminate the job; does not wait for the kill to take effect.
    pub async fn stop(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        let Some(job_id) = self.resolve_job_id(&descriptor).await? else {
            // Nothing submitted under this name: teardown is a no-op.
            return Ok(descriptor.with_state(ServiceState::Stopping));
        };
        let body = serde_json::json!({ "jobId": job_id, "reason": "stopped by operator" });
        self.fire_teardown("/v1/terminatejob", &body).await?;
        Ok(descriptor.with_state(ServiceState::Stopping))
    }

    /// Cancel the job (clears queued work); does not wait.
    pub async fn delete(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        let Some(job_id) = self.resolve_job_id(&descriptor).await? else {
            return Ok(descriptor.with_state(ServiceState::Stopped));
        };
        let body = serde_json::json!({ "jobId": job_id, "reason": "deleted by operator" });
        self.fire_teardown("/v1/canceljob", &body).await?;
        Ok(descriptor.with_state(ServiceState::Stopped))
    }

    /// A new submission supersedes the old job.
    pub async fn update(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        self.start(descriptor).await
    }

    pub async fn get_state(&self, descriptor: ServiceDescriptor) -> ProviderResult<ServiceDescriptor> {
        let state = match self.lookup_status(&descriptor).await {
            Ok(Some(status)) => map_job_status(&status),
            Ok(None) => ServiceState::Unknown,
            Err(e) => {
                debug!(name = %descriptor.name, error = %e, "state lookup failed");
                ServiceState::Unknown
            }
        };
        Ok(descriptor.with_state(state))
    }

    pub async fn get_logs(&self, descriptor: &ServiceDescriptor) -> ProviderResult<String> {
        let job_id = self
            .resolve_job_id(descriptor)
            .await?
            .ok_or_else(|| ProviderError::NotFound(descriptor.name.clone()))?;
        let detail = self
            .describe_job(&job_id)
            .await?
            .ok_or_else(|| ProviderError::NotFound(descriptor.name.clone()))?;
        let stream = detail
            .container
            .and_then(|c| c.log_stream_name)
            .ok_or_else(|| ProviderError::NotFound(format!("{}: no log stream", descriptor.name)))?;
        self.read_log_events(&stream).await
    }

    // ── Internals ──────────────────────────────────────────────────

    async fn resolve_job_id(&self, descriptor: &ServiceDescriptor) -> ProviderResult<Option<String>> {
        let spec = batch_spec(descriptor)?;
        if let Some(job_id) = &spec.job_id {
            return Ok(Some(job_id.clone()));
        }
        // The name is the only stable key; fall back to a queue scan.
        let body = serde_json::json!({
            "jobQueue": spec.job_queue,
            "filters": [{ "name": "JOB_NAME", "values": [descriptor.name] }],
        });
        let bytes = self.batch.post_json("/v1/listjobs", None, &body).await?;
        let listed: ListJobsResponse = parse(&bytes)?;
        Ok(listed
            .job_summary_list
            .into_iter()
            .max_by_key(|job| job.created_at)
            .map(|job| job.job_id))
    }

    async fn lookup_status(&self, descriptor: &ServiceDescriptor) -> ProviderResult<Option<String>> {
        let Some(job_id) = self.resolve_job_id(descriptor).await? else {
            return Ok(None);
        };
        Ok(self.describe_job(&job_id).await?.map(|job| job.status))
    }

    async fn describe_job(&self, job_id: &str) -> ProviderResult<Option<JobDetail>> {
        let body = serde_json::json!({ "jobs": [job_id] });
        let bytes = self.batch.post_json("/v1/describejobs", None, &body).await?;
        let described: DescribeJobsResponse = parse(&bytes)?;
        Ok(described.jobs.into_iter().next())
    }

    /// Teardown calls tolerate client errors: terminating a job that has
    /// already finished (or never existed) is a no-op.
    async fn fire_teardown(&self, path: &str, body: &serde_json::Value) -> ProviderResult<()> {
        let (status, bytes) = self.batch.post_json_raw(path, None, body).await?;
        if status.is_success() || status.is_client_error() {
            return Ok(());
        }
        Err(ProviderError::Backend(format!(
            "batch {path}: {status}: {}",
            String::from_utf8_lossy(&bytes).trim()
        )))
    }

    async fn read_log_events(&self, stream: &str) -> ProviderResult<String> {
        let body = serde_json::json!({
            "logGroupName": self.log_group,
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
}

fn batch_spec(descriptor: &ServiceDescriptor) -> ProviderResult<&BatchSpec> {
    match &descriptor.backend {
        BackendSpec::Batch(spec) => Ok(spec),
        _ => Err(ProviderError::Descriptor(format!(
            "descriptor {} does not carry batch fields",
            descriptor.name
        ))),
    }
}

/// {SUCCEEDED, FAILED} → Stopped, RUNNING → Running, everything queued or
/// starting → Pending.
fn map_job_status(status: &str) -> ServiceState {
    match status {
        "SUCCEEDED" | "FAILED" => ServiceState::Stopped,
        "RUNNING" => ServiceState::Running,
        _ => ServiceState::Pending,
    }
}

fn env_pairs(spec: &BatchSpec, descriptor: &ServiceDescriptor) -> Vec<serde_json::Value> {
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

/// Expands deployment/instance parameters into batch descriptors.
#[derive(Debug, Clone)]
pub struct BatchConfigBuilder {
    pub routing: RoutingConfig,
    pub images: ImageConfig,
    pub job_queue: String,
}

impl BatchConfigBuilder {
    pub fn new(config: &BatchBackendConfig, routing: RoutingConfig, images: ImageConfig) -> Self {
        Self {
            routing,
            images,
            job_queue: config.job_queue.clone(),
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
            backend: BackendSpec::Batch(self.batch_spec(
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
            backend: BackendSpec::Batch(self.batch_spec(
                params.kind,
                &params.name,
                params.runtime.as_deref(),
                params.cpus,
                params.memory_gb,
                environment,
            )),
        }
    }

    fn batch_spec(
        &self,
        kind: ServiceKind,
        name: &str,
        runtime: Option<&str>,
        cpus: Option<f64>,
        memory_gb: Option<f64>,
        environment: std::collections::HashMap<String, String>,
    ) -> BatchSpec {
        BatchSpec {
            job_queue: self.job_queue.clone(),
            job_definition: format!("{name}-def"),
            image: self.images.resolve(kind, runtime.unwrap_or("latest")),
            vcpus: cpus.unwrap_or(1.0).ceil() as u32,
            memory_mb: gb_to_mb(memory_gb.unwrap_or(2.0)),
            command: vec![],
            environment,
            job_id: None,
        }
    }
}
