//! HTTP surface: versioned REST API plus the two streaming gateways.
//!
//! - `POST /api/v1/runs`, `GET /api/v1/runs`, `GET /api/v1/runs/{id}`,
//!   `POST /api/v1/runs/{id}/cancel` - run lifecycle
//! - `GET /api/v1/runs/{id}/stream` - server-push result stream (SSE)
//! - `GET /api/v1/ws/runs/{id}/logs` - log stream (WebSocket, server->client)
//!
//! All `/api/v1` routes require a bearer token; verification is delegated to
//! the configured [`auth::TokenVerifier`].

/// REST handlers and router assembly.
pub mod api;
/// Bearer-token authentication middleware.
pub mod auth;
/// HTTP error mapping.
pub mod error;
/// Log stream gateway (WebSocket).
pub mod logs;
/// Result stream gateway (SSE).
pub mod results;

use std::sync::Arc;

use crate::bus::MessageBus;
use crate::config::OrchestratorConfig;
use crate::coordinator::{RunCoordinator, ShutdownToken};
use crate::store::RunStore;

pub use api::router;
pub use auth::TokenVerifier;
pub use error::{ApiError, ErrorResponse};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RunStore>,
    pub bus: Arc<dyn MessageBus>,
    pub coordinator: Arc<RunCoordinator>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub config: OrchestratorConfig,
    pub shutdown: ShutdownToken,
}
