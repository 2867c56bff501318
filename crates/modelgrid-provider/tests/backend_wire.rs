//! Wire-level backend adapter tests.
//!
//! Runs the hyper-based clients against an in-process HTTP server that
//! plays the backend: canned responses per path, every request recorded.
//! Covers replace-in-place container starts, idempotent teardown, state
//! mapping over the wire, and SigV4 header emission.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use modelgrid_core::{
    BackendSpec, BatchBackendConfig, DockerBackendConfig, DockerSpec, ImageConfig, RoutingConfig,
    ServiceDescriptor, ServiceKind, ServiceState,
};
use modelgrid_provider::batch::{BatchBackend, BatchConfigBuilder};
use modelgrid_provider::docker::{DockerBackend, DockerConfigBuilder};

/// One recorded request: method, path+query, selected headers, body.
#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    path: String,
    authorization: Option<String>,
    amz_target: Option<String>,
    body: String,
}

type Script = dyn Fn(&Recorded) -> (StatusCode, String) + Send + Sync;

/// Spawn a one-connection-at-a-time HTTP/1.1 server driven by `script`.
async fn spawn_backend(script: Arc<Script>) -> (SocketAddr, Arc<Mutex<Vec<Recorded>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: Arc<Mutex<Vec<Recorded>>> = Arc::new(Mutex::new(Vec::new()));

    let log_for_server = log.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let script = script.clone();
            let log = log_for_server.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let script = script.clone();
                    let log = log.clone();
                    async move {
                        let method = req.method().to_string();
                        let path = req
                            .uri()
                            .path_and_query()
                            .map(|pq| pq.to_string())
                            .unwrap_or_default();
                        let authorization = req
                            .headers()
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        let amz_target = req
                            .headers()
                            .get("x-amz-target")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        let body = req.into_body().collect().await.unwrap().to_bytes();
                        let recorded = Recorded {
                            method,
                            path,
                            authorization,
                            amz_target,
                            body: String::from_utf8_lossy(&body).into_owned(),
                        };
                        let (status, response_body) = script(&recorded);
                        log.lock().unwrap().push(recorded);
                        Ok::<_, std::convert::Infallible>(
                            Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::from(response_body)))
                                .unwrap(),
                        )
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, log)
}

fn docker_backend(addr: SocketAddr) -> (DockerBackend, DockerConfigBuilder) {
    let config = DockerBackendConfig {
        endpoint: format!("http://{addr}"),
        network: None,
    };
    let backend = DockerBackend::new(&config).unwrap();
    let builder = DockerConfigBuilder::new(&config, RoutingConfig::default(), ImageConfig::default());
    (backend, builder)
}

fn jupyter_descriptor() -> ServiceDescriptor {
    ServiceDescriptor {
        kind: ServiceKind::Jupyter,
        name: "i-jupyter-alice".to_string(),
        state: ServiceState::Pending,
        vars: HashMap::new(),
        backend: BackendSpec::Docker(DockerSpec {
            image: "jupyter/base-notebook:latest".to_string(),
            cmd: vec![],
            env: HashMap::new(),
            ports: vec![],
            memory_bytes: None,
            nano_cpus: None,
            labels: HashMap::new(),
            network: None,
            health_cmd: None,
        }),
    }
}

// ── Container runtime over the wire ───────────────────────────────

#[tokio::test]
async fn container_start_replaces_in_place() {
    let script: Arc<Script> = Arc::new(|req: &Recorded| {
        match (req.method.as_str(), req.path.as_str()) {
            // A previous container exists: stop and remove succeed.
            ("POST", p) if p.contains("/stop") => (StatusCode::NO_CONTENT, String::new()),
            ("DELETE", _) => (StatusCode::NO_CONTENT, String::new()),
            ("POST", p) if p.contains("/containers/create") => (
                StatusCode::CREATED,
                r#"{"Id":"abc123","Warnings":[]}"#.to_string(),
            ),
            ("POST", p) if p.contains("/start") => (StatusCode::NO_CONTENT, String::new()),
            _ => (StatusCode::NOT_FOUND, String::new()),
        }
    });
    let (addr, log) = spawn_backend(script).await;
    let (backend, _) = docker_backend(addr);

    let started = backend.start(jupyter_descriptor()).await.unwrap();
    assert_eq!(started.state, ServiceState::Pending);

    let requests = log.lock().unwrap().clone();
    let sequence: Vec<&str> = requests
        .iter()
        .map(|r| {
            if r.path.contains("/stop") {
                "stop"
            } else if r.method == "DELETE" {
                "remove"
            } else if r.path.contains("/create") {
                "create"
            } else {
                "start"
            }
        })
        .collect();
    assert_eq!(sequence, vec!["stop", "remove", "create", "start"]);
}

#[tokio::test]
async fn container_teardown_is_idempotent_on_absent() {
    let script: Arc<Script> =
        Arc::new(|_req: &Recorded| (StatusCode::NOT_FOUND, r#"{"message":"no such container"}"#.to_string()));
    let (addr, _log) = spawn_backend(script).await;
    let (backend, _) = docker_backend(addr);

    // Both calls hit 404s and still succeed.
    backend.stop(jupyter_descriptor()).await.unwrap();
    backend.delete(jupyter_descriptor()).await.unwrap();
}

#[tokio::test]
async fn container_state_maps_over_the_wire() {
    let script: Arc<Script> = Arc::new(|_req: &Recorded| {
        (
            StatusCode::OK,
            r#"{"Id":"abc","State":{"Status":"running","Running":true,"Health":{"Status":"healthy"}}}"#
                .to_string(),
        )
    });
    let (addr, _log) = spawn_backend(script).await;
    let (backend, _) = docker_backend(addr);

    let observed = backend.get_state(jupyter_descriptor()).await.unwrap();
    assert_eq!(observed.state, ServiceState::Running);
}

#[tokio::test]
async fn unreachable_runtime_reports_unknown() {
    // Nothing is listening on this port.
    let config = DockerBackendConfig {
        endpoint: "http://127.0.0.1:1".to_string(),
        network: None,
    };
    let backend = DockerBackend::new(&config).unwrap();

    let observed = backend.get_state(jupyter_descriptor()).await.unwrap();
    assert_eq!(observed.state, ServiceState::Unknown);
}

// ── Managed batch compute over the wire ───────────────────────────

fn batch_backend(addr: SocketAddr) -> (BatchBackend, BatchConfigBuilder) {
    let config = BatchBackendConfig {
        region: "eu-west-1".to_string(),
        job_queue: "modelgrid-queue".to_string(),
        access_key_id: "AKIDEXAMPLE".to_string(),
        secret_access_key: "secret".to_string(),
        endpoint: Some(format!("http://{addr}")),
        log_group: "/aws/batch/job".to_string(),
    };
    let backend = BatchBackend::new(&config).unwrap();
    let builder = BatchConfigBuilder::new(&config, RoutingConfig::default(), ImageConfig::default());
    (backend, builder)
}

#[tokio::test]
async fn batch_submit_records_job_id_and_signs_requests() {
    let script: Arc<Script> = Arc::new(|req: &Recorded| match req.path.as_str() {
        "/v1/registerjobdefinition" => (
            StatusCode::OK,
            r#"{"jobDefinitionName":"s-c1-def","jobDefinitionArn":"arn","revision":1}"#.to_string(),
        ),
        "/v1/submitjob" => (
            StatusCode::OK,
            r#"{"jobName":"s-c1","jobId":"job-42"}"#.to_string(),
        ),
        _ => (StatusCode::BAD_REQUEST, String::new()),
    });
    let (addr, log) = spawn_backend(script).await;
    let (backend, builder) = batch_backend(addr);

    let descriptor = builder.deployment_config(&modelgrid_core::DeploymentParams {
        kind: ServiceKind::SklearnServer,
        workspace_id: "c1".to_string(),
        version: Some(3),
        runtime: Some("py311".to_string()),
        framework: Some("sklearn".to_string()),
        cpus: None,
        memory_gb: None,
    });

    let descriptor = backend.provision(descriptor).await.unwrap();
    let started = backend.start(descriptor).await.unwrap();

    let BackendSpec::Batch(spec) = &started.backend else {
        panic!("expected batch fields");
    };
    assert_eq!(spec.job_id.as_deref(), Some("job-42"));

    let requests = log.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        let authorization = request.authorization.as_deref().unwrap();
        assert!(authorization.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
        assert!(authorization.contains("/eu-west-1/batch/aws4_request"));
        assert!(authorization.contains("SignedHeaders="));
    }
    assert!(requests[1].body.contains("\"jobQueue\":\"modelgrid-queue\""));
}

#[tokio::test]
async fn batch_state_maps_job_status() {
    let script: Arc<Script> = Arc::new(|req: &Recorded| match req.path.as_str() {
        "/v1/describejobs" => (
            StatusCode::OK,
            r#"{"jobs":[{"jobId":"job-42","status":"RUNNING"}]}"#.to_string(),
        ),
        _ => (StatusCode::BAD_REQUEST, String::new()),
    });
    let (addr, _log) = spawn_backend(script).await;
    let (backend, builder) = batch_backend(addr);

    let mut descriptor = builder.deployment_config(&modelgrid_core::DeploymentParams {
        kind: ServiceKind::SklearnServer,
        workspace_id: "c1".to_string(),
        version: Some(3),
        runtime: None,
        framework: Some("sklearn".to_string()),
        cpus: None,
        memory_gb: None,
    });
    if let BackendSpec::Batch(spec) = &mut descriptor.backend {
        spec.job_id = Some("job-42".to_string());
    }

    let observed = backend.get_state(descriptor).await.unwrap();
    assert_eq!(observed.state, ServiceState::Running);
}

#[tokio::test]
async fn batch_teardown_tolerates_finished_jobs() {
    let script: Arc<Script> = Arc::new(|req: &Recorded| match req.path.as_str() {
        // Terminating an already-finished job is a client error upstream.
        "/v1/terminatejob" => (
            StatusCode::BAD_REQUEST,
            r#"{"message":"job already completed"}"#.to_string(),
        ),
        _ => (StatusCode::BAD_REQUEST, String::new()),
    });
    let (addr, _log) = spawn_backend(script).await;
    let (backend, builder) = batch_backend(addr);

    let mut descriptor = builder.deployment_config(&modelgrid_core::DeploymentParams {
        kind: ServiceKind::SklearnServer,
        workspace_id: "c1".to_string(),
        version: None,
        runtime: None,
        framework: Some("sklearn".to_string()),
        cpus: None,
        memory_gb: None,
    });
    if let BackendSpec::Batch(spec) = &mut descriptor.backend {
        spec.job_id = Some("job-42".to_string());
    }

    backend.stop(descriptor).await.unwrap();
}

#[tokio::test]
async fn batch_unreachable_endpoint_reports_unknown() {
    let config = BatchBackendConfig {
        region: "eu-west-1".to_string(),
        job_queue: "q".to_string(),
        access_key_id: "k".to_string(),
        secret_access_key: "s".to_string(),
        endpoint: Some("http://127.0.0.1:1".to_string()),
        log_group: "/aws/batch/job".to_string(),
    };
    let backend = BatchBackend::new(&config).unwrap();
    let builder = BatchConfigBuilder::new(&config, RoutingConfig::default(), ImageConfig::default());
    let descriptor = builder.deployment_config(&modelgrid_core::DeploymentParams {
        kind: ServiceKind::SklearnServer,
        workspace_id: "c1".to_string(),
        version: None,
        runtime: None,
        framework: Some("sklearn".to_string()),
        cpus: None,
        memory_gb: None,
    });

    let observed = backend.get_state(descriptor).await.unwrap();
    assert_eq!(observed.state, ServiceState::Unknown);
}
