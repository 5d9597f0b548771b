// Session inspection endpoint.
//
// Routes:
//   GET /v1/documents/{document_id}/session  phase and connection count of
//                                              the live session, 404 when idle

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    middleware,
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::{
    auth::{
        authenticator::ConnectionAuthenticator,
        jwt::JwtCredentialVerifier,
        middleware::{require_bearer_auth, AuthenticatedUser},
    },
    error::{ErrorCode, RelayError},
    sync::session::{SessionInfo, SessionManager},
};

#[derive(Clone)]
struct SessionApiState {
    authenticator: Arc<ConnectionAuthenticator>,
    sessions: Arc<SessionManager>,
}

#[derive(Debug, Serialize)]
struct SessionEnvelope {
    session: SessionInfo,
}

pub fn router(
    verifier: Arc<JwtCredentialVerifier>,
    authenticator: Arc<ConnectionAuthenticator>,
    sessions: Arc<SessionManager>,
) -> Router {
    Router::new()
        .route("/v1/documents/{document_id}/session", get(get_session))
        .with_state(SessionApiState { authenticator, sessions })
        .route_layer(middleware::from_fn_with_state(verifier, require_bearer_auth))
}

async fn get_session(
    State(state): State<SessionApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(document_id): Path<String>,
) -> Result<Json<SessionEnvelope>, RelayError> {
    // Same record checks a connection goes through.
    state.authenticator.authorize(user.user_id, &document_id).await.map_err(|error| {
        if matches!(error.error_code(), ErrorCode::InternalError) {
            tracing::error!(document_id = %document_id, error = ?error, "session lookup failed");
        }
        RelayError::from(error)
    })?;

    let session = state
        .sessions
        .session_info(&document_id)
        .await
        .ok_or_else(|| RelayError::from_code(ErrorCode::SessionNotFound))?;

    Ok(Json(SessionEnvelope { session }))
}
