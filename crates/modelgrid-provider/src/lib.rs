//! modelgrid-provider — the resource-provider capability set and its four
//! backend adapters.
//!
//! A [`Provider`] turns backend-agnostic [`ServiceDescriptor`]s into live
//! resources on one of four compute backends, selected once at startup:
//!
//! - **`docker`** — local container runtime via the Engine REST API
//! - **`kubernetes`** — cluster orchestration via the `kube` client
//! - **`batch`** — managed batch compute (SigV4-signed REST-JSON)
//! - **`tasks`** — managed container tasks (SigV4-signed JSON-1.1)
//!
//! plus a **`mock`** backend for tests and dry runs. Each adapter pairs
//! with a pure config builder that expands deployment/instance parameters
//! into the backend's native descriptor shape.
//!
//! The [`poller::poll_until`] primitive is the single bounded-wait used to
//! converge on a target state.
//!
//! [`ServiceDescriptor`]: modelgrid_core::ServiceDescriptor

pub mod aws;
pub mod batch;
pub mod docker;
pub mod docker_client;
pub mod error;
mod httpc;
pub mod kubernetes;
pub mod mock;
pub mod poller;
pub mod provider;
pub mod tasks;

pub use error::{ProviderError, ProviderResult};
pub use poller::poll_until;
pub use provider::Provider;
