//! devbox server: HTTP and WebSocket front end for per-user workspace containers.

use std::sync::Arc;

use devbox_runtime::engine::docker::DockerEngine;
use devbox_runtime::identity::SessionAuthority;
use devbox_runtime::principals::PrincipalStore;
use devbox_runtime::reconcile::reconcile_registry;
use devbox_runtime::{
    AppState, ContainerEngine, ContainerRegistry, LifecycleManager, RuntimeConfig, SandboxError,
    router, store,
};
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error("runtime error: {0}")]
    Runtime(#[from] SandboxError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    setup_log();

    let config = RuntimeConfig::load();
    let state_dir = store::state_dir();
    info!(state_dir = %state_dir.display(), "loading state");

    let principals = Arc::new(PrincipalStore::open(state_dir.join("principals.json"))?);
    let registry = Arc::new(ContainerRegistry::open(state_dir.join("containers.json"))?);

    let engine: Arc<dyn ContainerEngine> =
        Arc::new(DockerEngine::connect(config.docker_host.as_deref(), config.docker()).await?);

    // Nothing is served until the registry agrees with the engine.
    match reconcile_registry(engine.as_ref(), &registry).await {
        Ok(summary) => info!(
            inspected = summary.inspected,
            removed = summary.removed,
            updated = summary.updated,
            failed = summary.failed,
            remaining = summary.remaining,
            "startup reconciliation complete"
        ),
        Err(err) => warn!(error = %err, "startup reconciliation failed; serving stored state"),
    }

    let lifecycle = Arc::new(LifecycleManager::new(engine, registry, config.lifecycle()));
    let authority = Arc::new(SessionAuthority::new(
        config.session_secret.as_deref(),
        config.session_ttl,
    )?);
    let state = AppState::new(lifecycle, principals, authority, config.api_settings());

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: addr.clone(),
            source,
        })?;
    info!("Starting devbox API on {addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(StartupError::Serve)?;

    info!("devbox API stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn setup_log() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .is_err()
    {}
}
