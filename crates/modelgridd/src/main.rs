//! modelgridd — the Modelgrid daemon.
//!
//! Single binary that assembles the control plane:
//! - State store (redb)
//! - Resource provider for the configured backend
//! - Deployment orchestrator
//! - Instance lifecycle controller + reconciler
//! - REST API
//!
//! # Usage
//!
//! ```text
//! modelgridd serve --config /etc/modelgrid/modelgrid.toml
//! modelgridd example-config > modelgrid.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use modelgrid_core::{ModelgridConfig, RegisteredModel, StaticRegistry};

#[derive(Parser)]
#[command(name = "modelgridd", about = "Modelgrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Serve {
        /// Path to modelgrid.toml.
        #[arg(long, default_value = "/etc/modelgrid/modelgrid.toml")]
        config: PathBuf,

        /// Override the configured listen port.
        #[arg(long)]
        port: Option<u16>,
    },

    /// Print an example configuration file.
    ExampleConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,modelgridd=debug,modelgrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, port } => run_serve(config, port).await,
        Command::ExampleConfig => {
            print!("{}", ModelgridConfig::example().to_toml_string()?);
            Ok(())
        }
    }
}

async fn run_serve(config_path: PathBuf, port_override: Option<u16>) -> anyhow::Result<()> {
    info!("Modelgrid daemon starting");

    let config = ModelgridConfig::from_file(&config_path)?;
    let port = port_override.unwrap_or(config.server.port);

    // Ensure the data directory exists.
    std::fs::create_dir_all(&config.server.data_dir)?;
    let db_path = config.server.data_dir.join("modelgrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    // State store.
    let store = modelgrid_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // Model registry, seeded from config.
    let registry = StaticRegistry::new();
    for model in &config.models {
        registry.register(RegisteredModel {
            workspace_id: model.workspace_id.clone(),
            version: model.version,
            framework: model.framework.clone(),
            runtime: model.runtime.clone(),
        });
    }
    info!(models = config.models.len(), "model registry seeded");

    // Resource provider for the configured backend.
    let provider = Arc::new(modelgrid_provider::Provider::from_config(&config).await?);
    info!(backend = provider.name(), "resource provider initialized");

    // Deployment orchestrator.
    let orchestrator = modelgrid_deploy::DeployOrchestrator::new(
        Arc::new(registry),
        provider.clone(),
        store.clone(),
        config.deploy.clone(),
    );
    info!("deployment orchestrator initialized");

    // Instance lifecycle controller (owns the reconciler).
    let controller = modelgrid_instance::InstanceController::new(
        provider,
        store.clone(),
        config.routing.clone(),
        config.deploy.clone(),
    );
    info!("instance controller initialized");

    // ── Start API server ───────────────────────────────────────

    let router = modelgrid_api::build_router(modelgrid_api::ApiState {
        orchestrator,
        controller,
        store,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
    });

    server.await?;

    info!("Modelgrid daemon stopped");
    Ok(())
}
