//! modelgrid-api — REST surface for the Modelgrid control plane.
//!
//! Thin axum handlers over the deployment orchestrator, the instance
//! controller, and the state store. Deploy and instance creation return
//! 202 Accepted with the Pending record; callers observe completion by
//! polling the record, never by blocking the request.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/workspaces/{id}/deployments` | Deploy a model version |
//! | GET | `/api/v1/workspaces/{id}/deployments` | Deployment history |
//! | GET | `/api/v1/workspaces/{id}/deployments/latest` | Latest attempt |
//! | GET | `/api/v1/workspaces/{id}/deployments/{did}` | One attempt |
//! | POST | `/api/v1/instances` | Create a development instance |
//! | GET | `/api/v1/instances?username=` | List a user's instances |
//! | GET | `/api/v1/instances/{name}` | Get one instance |
//! | GET | `/api/v1/instances/{name}/state` | Live backend state |
//! | GET | `/api/v1/instances/{name}/logs` | Tail instance logs |
//! | POST | `/api/v1/instances/{name}/exec` | Run a command inside |
//! | POST | `/api/v1/instances/{name}/stop` | Stop an instance |
//! | DELETE | `/api/v1/instances/{name}` | Delete an instance |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};

use modelgrid_deploy::DeployOrchestrator;
use modelgrid_instance::InstanceController;
use modelgrid_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: DeployOrchestrator,
    pub controller: InstanceController,
    pub store: StateStore,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route(
            "/workspaces/{id}/deployments",
            get(handlers::list_deployments).post(handlers::create_deployment),
        )
        .route(
            "/workspaces/{id}/deployments/latest",
            get(handlers::latest_deployment),
        )
        .route(
            "/workspaces/{id}/deployments/{deployment_id}",
            get(handlers::get_deployment),
        )
        .route(
            "/instances",
            get(handlers::list_instances).post(handlers::create_instance),
        )
        .route(
            "/instances/{name}",
            get(handlers::get_instance).delete(handlers::delete_instance),
        )
        .route("/instances/{name}/state", get(handlers::instance_state))
        .route("/instances/{name}/logs", get(handlers::instance_logs))
        .route("/instances/{name}/exec", post(handlers::instance_exec))
        .route("/instances/{name}/stop", post(handlers::stop_instance))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
