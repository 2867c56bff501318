//! REST API handlers.
//!
//! Each handler delegates to the orchestrator/controller and wraps the
//! result in a consistent JSON envelope. Synchronous failures map to
//! 4xx; backend provisioning failures are observed asynchronously through
//! the persisted records.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;

use modelgrid_core::ServiceKind;
use modelgrid_deploy::DeployError;
use modelgrid_instance::{CreateInstanceRequest, InstanceError};
use modelgrid_provider::ProviderError;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn deploy_error_response(error: DeployError) -> axum::response::Response {
    let status = match &error {
        DeployError::InProgress(_) => StatusCode::CONFLICT,
        DeployError::ModelNotFound(_) | DeployError::UnsupportedFramework(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        DeployError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&error.to_string(), status).into_response()
}

fn instance_error_response(error: InstanceError) -> axum::response::Response {
    let status = match &error {
        InstanceError::NotFound(_) => StatusCode::NOT_FOUND,
        InstanceError::Provider(ProviderError::NotFound(_)) => StatusCode::NOT_FOUND,
        InstanceError::Provider(ProviderError::Unsupported(_)) => StatusCode::BAD_REQUEST,
        InstanceError::Provider(_) => StatusCode::BAD_GATEWAY,
        InstanceError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&error.to_string(), status).into_response()
}

// ── Deployments ────────────────────────────────────────────────

#[derive(Deserialize, Default)]
pub struct DeployRequest {
    pub version: Option<u32>,
    pub created_by: Option<String>,
}

/// POST /api/v1/workspaces/{id}/deployments
pub async fn create_deployment(
    State(state): State<ApiState>,
    Path(workspace_id): Path<String>,
    Json(req): Json<DeployRequest>,
) -> impl IntoResponse {
    let created_by = req.created_by.as_deref().unwrap_or("api");
    match state
        .orchestrator
        .deploy(&workspace_id, req.version, created_by)
        .await
    {
        Ok(deployment) => {
            (StatusCode::ACCEPTED, ApiResponse::ok(deployment)).into_response()
        }
        Err(e) => deploy_error_response(e),
    }
}

/// GET /api/v1/workspaces/{id}/deployments
pub async fn list_deployments(
    State(state): State<ApiState>,
    Path(workspace_id): Path<String>,
) -> impl IntoResponse {
    match state.store.list_deployments(&workspace_id) {
        Ok(history) => ApiResponse::ok(history).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/workspaces/{id}/deployments/latest
pub async fn latest_deployment(
    State(state): State<ApiState>,
    Path(workspace_id): Path<String>,
) -> impl IntoResponse {
    match state.store.latest_deployment(&workspace_id) {
        Ok(Some(deployment)) => ApiResponse::ok(deployment).into_response(),
        Ok(None) => error_response("no deployments", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/workspaces/{id}/deployments/{deployment_id}
pub async fn get_deployment(
    State(state): State<ApiState>,
    Path((workspace_id, deployment_id)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.store.get_deployment(&workspace_id, &deployment_id) {
        Ok(Some(deployment)) => ApiResponse::ok(deployment).into_response(),
        Ok(None) => error_response("deployment not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Instances ──────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateInstanceBody {
    pub username: String,
    pub kind: ServiceKind,
    pub runtime: Option<String>,
    pub cpus: Option<f64>,
    pub memory_gb: Option<f64>,
    #[serde(default)]
    pub packages: Vec<String>,
}

/// POST /api/v1/instances
pub async fn create_instance(
    State(state): State<ApiState>,
    Json(body): Json<CreateInstanceBody>,
) -> impl IntoResponse {
    let request = CreateInstanceRequest {
        username: body.username,
        kind: body.kind,
        runtime: body.runtime,
        cpus: body.cpus,
        memory_gb: body.memory_gb,
        packages: body.packages,
    };
    match state.controller.create(request).await {
        Ok(instance) => (StatusCode::ACCEPTED, ApiResponse::ok(instance)).into_response(),
        Err(e) => instance_error_response(e),
    }
}

#[derive(Deserialize)]
pub struct ListInstancesQuery {
    pub username: String,
}

/// GET /api/v1/instances?username=
pub async fn list_instances(
    State(state): State<ApiState>,
    Query(query): Query<ListInstancesQuery>,
) -> impl IntoResponse {
    match state.controller.list(&query.username) {
        Ok(instances) => ApiResponse::ok(instances).into_response(),
        Err(e) => instance_error_response(e),
    }
}

/// GET /api/v1/instances/{name}
pub async fn get_instance(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.controller.get(&name) {
        Ok(instance) => ApiResponse::ok(instance).into_response(),
        Err(e) => instance_error_response(e),
    }
}

/// GET /api/v1/instances/{name}/state
pub async fn instance_state(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.controller.live_state(&name).await {
        Ok(live) => ApiResponse::ok(live).into_response(),
        Err(e) => instance_error_response(e),
    }
}

/// GET /api/v1/instances/{name}/logs
pub async fn instance_logs(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.controller.logs(&name).await {
        Ok(logs) => ApiResponse::ok(logs).into_response(),
        Err(e) => instance_error_response(e),
    }
}

#[derive(Deserialize)]
pub struct ExecBody {
    pub command: Vec<String>,
}

/// POST /api/v1/instances/{name}/exec
pub async fn instance_exec(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<ExecBody>,
) -> impl IntoResponse {
    match state.controller.exec(&name, &body.command).await {
        Ok(output) => ApiResponse::ok(output).into_response(),
        Err(e) => instance_error_response(e),
    }
}

/// POST /api/v1/instances/{name}/stop
pub async fn stop_instance(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.controller.stop(&name).await {
        Ok(instance) => ApiResponse::ok(instance).into_response(),
        Err(e) => instance_error_response(e),
    }
}

/// DELETE /api/v1/instances/{name}
pub async fn delete_instance(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.controller.delete(&name).await {
        Ok(()) => ApiResponse::ok("deleted").into_response(),
        Err(e) => instance_error_response(e),
    }
}
