use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::{error, info};

use crate::{
    api,
    auth::{authenticator::ConnectionAuthenticator, jwt::JwtCredentialVerifier},
    cors::cors_layer,
    error::{
        attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
        ErrorCode, RelayError,
    },
    sync::session::SessionManager,
    ws,
};

pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Everything the HTTP surface needs, assembled once at startup.
#[derive(Clone)]
pub struct RelayServices {
    pub verifier: Arc<JwtCredentialVerifier>,
    pub authenticator: Arc<ConnectionAuthenticator>,
    pub sessions: Arc<SessionManager>,
}

pub fn build_router(services: RelayServices, cors_origins: Option<&str>) -> Router {
    let RelayServices { verifier, authenticator, sessions } = services;

    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .merge(ws::router(Arc::clone(&authenticator), Arc::clone(&sessions)))
            .merge(api::router(verifier, authenticator, sessions)),
    )
    .layer(cors_layer(cors_origins))
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            RelayError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
        routing::{get, post},
        Router,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::{apply_middleware, build_router, RelayServices, MAX_REQUEST_BODY_BYTES};
    use crate::{
        auth::{
            authenticator::ConnectionAuthenticator,
            jwt::{test_tokens::TEST_SECRET, JwtCredentialVerifier},
        },
        blob::MemoryBlobStore,
        records::MemoryRecordStore,
        sync::{
            coordinator::PersistenceCoordinator,
            observer::ObserverChain,
            session::{SessionConfig, SessionManager},
        },
    };
    use std::sync::Arc;

    fn test_router() -> Router {
        let records = Arc::new(MemoryRecordStore::new());
        let verifier = Arc::new(JwtCredentialVerifier::new(TEST_SECRET).expect("verifier"));
        let authenticator =
            Arc::new(ConnectionAuthenticator::new(Arc::clone(&verifier), records.clone()));
        let coordinator = Arc::new(PersistenceCoordinator::new(
            records,
            Arc::new(MemoryBlobStore::new()),
            ObserverChain::default(),
        ));
        let sessions = Arc::new(SessionManager::new(
            coordinator,
            ObserverChain::default(),
            SessionConfig::default(),
        ));
        build_router(RelayServices { verifier, authenticator, sessions }, None)
    }

    #[tokio::test]
    async fn health_check_has_request_id_header() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .expect("healthz request should build"),
            )
            .await
            .expect("healthz request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn caller_request_id_is_echoed_into_error_bodies() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/v1/documents/doc1/session")
                    .header("x-request-id", "req-42")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should complete");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()["x-request-id"], "req-42");
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let body: Value = serde_json::from_slice(&body).expect("json body");
        assert_eq!(body["error"]["request_id"], "req-42");
    }

    #[tokio::test]
    async fn plain_get_on_sync_endpoint_is_not_upgraded() {
        let response = test_router()
            .oneshot(
                Request::builder().uri("/v1/ws").body(Body::empty()).expect("request should build"),
            )
            .await
            .expect("request should complete");

        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn panic_handler_returns_internal_server_error() {
        async fn panic_route() -> &'static str {
            panic!("test panic");
        }

        let app = apply_middleware(Router::new().route("/panic", get(panic_route)));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/panic")
                    .body(Body::empty())
                    .expect("panic request should build"),
            )
            .await
            .expect("panic request should return a response");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn request_body_limit_is_enforced() {
        async fn echo(body: String) -> String {
            body
        }

        let oversized_body = "a".repeat(MAX_REQUEST_BODY_BYTES + 1);
        let app = apply_middleware(Router::new().route("/echo", post(echo)));

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/echo")
                    .header("content-type", "text/plain")
                    .body(Body::from(oversized_body))
                    .expect("echo request should build"),
            )
            .await
            .expect("echo request should return a response");

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
