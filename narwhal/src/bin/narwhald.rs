//! narwhald - the narwhal control-plane server.
//!
//! Serves the versioned HTTP API, runs the coordinator with its reaper and
//! cleanup sweeps, and streams worker output to connected clients. Exactly
//! one instance should run the reaper; deployments scaling the API tier
//! horizontally keep the sweeps on a single designated instance.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use narwhal::coordinator::{RunCoordinator, ShutdownToken};
use narwhal::gateway::{self, AppState, TokenVerifier};
use narwhal::persistence::PostgresRunStore;
use narwhal::scheduler::LocalProcessScheduler;
use narwhal::{InProcMessageBus, OrchestratorConfig};

/// Verifier for a single shared bearer token from the environment.
///
/// Stands in for the external authentication service in single-tenant
/// deployments; anything multi-tenant plugs a real verifier into
/// [`TokenVerifier`].
struct SharedTokenVerifier {
    token: String,
}

#[async_trait::async_trait]
impl TokenVerifier for SharedTokenVerifier {
    async fn verify(&self, token: &str) -> anyhow::Result<()> {
        if token == self.token {
            Ok(())
        } else {
            anyhow::bail!("token mismatch")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("narwhal=info,narwhald=info")),
        )
        .init();

    #[cfg(feature = "metrics")]
    narwhal::metrics::init_metrics()?;

    let config = OrchestratorConfig::from_env();
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set")?;
    let api_token = std::env::var("NARWHAL_API_TOKEN")
        .context("NARWHAL_API_TOKEN must be set")?;
    let bind_addr =
        std::env::var("NARWHAL_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("connecting to run store")?;

    let store = Arc::new(PostgresRunStore::new(pool));
    let bus = Arc::new(InProcMessageBus::new(config.result_channel_buffer));
    let scheduler = Arc::new(LocalProcessScheduler::new());
    let coordinator = Arc::new(RunCoordinator::new(
        store.clone(),
        bus.clone(),
        scheduler,
        config.clone(),
    ));

    let shutdown = ShutdownToken::new();
    let reaper = coordinator.spawn_reaper(shutdown.clone());
    let cleanup = coordinator.spawn_cleanup(shutdown.clone());

    let state = AppState {
        store,
        bus,
        coordinator,
        verifier: Arc::new(SharedTokenVerifier { token: api_token }),
        config,
        shutdown: shutdown.clone(),
    };
    let app = gateway::router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(addr = %bind_addr, "narwhald listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received");
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = reaper.await;
    let _ = cleanup.await;
    info!("narwhald stopped");
    Ok(())
}
