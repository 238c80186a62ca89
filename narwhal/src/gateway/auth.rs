use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;

use super::{ApiError, AppState};

/// External collaborator that verifies bearer tokens.
///
/// Token issuance and claims interpretation live outside this subsystem;
/// the gateway only needs accept/reject.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify a bearer token. Any error rejects the request with 401.
    async fn verify(&self, token: &str) -> anyhow::Result<()>;
}

/// Middleware enforcing `Authorization: Bearer <token>` on every request.
pub async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match token {
        Some(token) if state.verifier.verify(token).await.is_ok() => {
            Ok(next.run(request).await)
        }
        _ => Err(ApiError::Unauthorized),
    }
}
