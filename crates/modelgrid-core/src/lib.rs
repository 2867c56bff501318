//! modelgrid-core — shared types, configuration, and collaborator seams.
//!
//! Modelgrid turns abstract deployment intents ("serve version N of
//! workspace W") into backend-specific resources on one of four compute
//! backends. This crate holds what every other crate needs:
//!
//! - **`types`** — the backend-agnostic [`ServiceDescriptor`] and the
//!   [`BackendSpec`] sum type carrying backend-native fields
//! - **`config`** — `modelgrid.toml` parsing: backend selection, routing and
//!   identity conventions, image templates, deploy tuning
//! - **`registry`** — the model-registry collaborator seam

pub mod config;
pub mod registry;
pub mod types;

pub use config::{
    BackendConfig, BatchBackendConfig, DeployTuning, DockerBackendConfig, ImageConfig,
    KubeBackendConfig, ModelEntry, ModelgridConfig, RoutingConfig, ServerConfig,
    TasksBackendConfig,
};
pub use registry::{ModelRegistry, RegisteredModel, StaticRegistry};
pub use types::*;
