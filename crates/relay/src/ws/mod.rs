pub mod handler;
pub mod protocol;

use std::{sync::Arc, time::Duration};

use axum::{routing::get, Router};

use crate::{auth::authenticator::ConnectionAuthenticator, sync::session::SessionManager};

pub const MAX_FRAME_BYTES: usize = 1024 * 1024;
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct SyncRouterState {
    pub authenticator: Arc<ConnectionAuthenticator>,
    pub sessions: Arc<SessionManager>,
}

pub fn router(
    authenticator: Arc<ConnectionAuthenticator>,
    sessions: Arc<SessionManager>,
) -> Router {
    Router::new()
        .route("/v1/ws", get(handler::ws_upgrade))
        .with_state(SyncRouterState { authenticator, sessions })
}
