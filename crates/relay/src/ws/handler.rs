use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use chrono::{SecondsFormat, Utc};
use notesync_common::protocol::ws::{close_code, WsMessage};
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{
    protocol as ws_protocol, SyncRouterState, HANDSHAKE_TIMEOUT, HEARTBEAT_INTERVAL,
    HEARTBEAT_TIMEOUT, MAX_FRAME_BYTES,
};
use crate::{
    auth::authenticator::{AuthContext, ConnectionAuthenticator},
    error::{request_id_from_headers_or_generate, with_request_id_scope, ErrorCode},
    protocol,
    sync::session::{Admission, ApplyOutcome, Membership, SessionManager},
};

pub async fn ws_upgrade(
    State(state): State<SyncRouterState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES).max_message_size(MAX_FRAME_BYTES).on_upgrade(
        move |socket| async move {
            with_request_id_scope(
                request_id,
                handle_socket(state.authenticator, state.sessions, socket),
            )
            .await;
        },
    )
}

fn frame_size_exceeded_reason() -> String {
    format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::MESSAGE_TOO_BIG,
            reason: frame_size_exceeded_reason().into(),
        })))
        .await;
}

async fn handle_socket(
    authenticator: Arc<ConnectionAuthenticator>,
    sessions: Arc<SessionManager>,
    mut socket: WebSocket,
) {
    let Some(ctx) = await_hello(&authenticator, &mut socket).await else {
        return;
    };

    let Admission { membership, mut frames } = sessions.admit(ctx).await;
    let document_id = membership.context().document_id().to_owned();
    let connection_id = membership.connection_id();

    let hello_ack = WsMessage::HelloAck {
        server_time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        document_id: document_id.clone(),
        connection_id,
    };
    if ws_protocol::send_ws_message(&mut socket, &hello_ack).await.is_err() {
        membership.leave().await;
        return;
    }

    // Pings go out every HEARTBEAT_INTERVAL; a ping left unanswered for
    // HEARTBEAT_TIMEOUT ends the connection at the next tick.
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.reset();
    let mut awaiting_pong: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if awaiting_pong.is_some_and(|sent| sent.elapsed() >= HEARTBEAT_TIMEOUT) {
                    warn!(
                        connection_id = %connection_id,
                        document_id = %document_id,
                        "heartbeat timeout, disconnecting"
                    );
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong.get_or_insert_with(Instant::now);
            }
            maybe_frame = frames.recv() => {
                let Some(frame) = maybe_frame else {
                    break;
                };
                let outbound = ws_protocol::frame_message(&document_id, &frame);
                if ws_protocol::send_ws_message(&mut socket, &outbound).await.is_err() {
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if raw_message.len() > MAX_FRAME_BYTES {
                            close_frame_too_large(&mut socket).await;
                            break;
                        }
                        let reply = handle_inbound(&membership, raw_message.as_str()).await;
                        if let Some(reply) = reply {
                            if ws_protocol::send_ws_message(&mut socket, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Binary(_)) => {
                        let reply = ws_protocol::error_message(
                            ErrorCode::SyncInvalidMessage,
                            "binary frames are not part of the protocol",
                        );
                        if ws_protocol::send_ws_message(&mut socket, &reply).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        awaiting_pong = None;
                    }
                    Ok(Message::Close(_)) => break,
                    Err(error) if is_frame_size_violation(&error) => {
                        close_frame_too_large(&mut socket).await;
                        break;
                    }
                    Err(error) => {
                        debug!(
                            connection_id = %connection_id,
                            error = %error,
                            "websocket receive failed"
                        );
                        break;
                    }
                }
            }
        }
    }

    membership.leave().await;
}

/// Reads and vets the first frame. On any failure the refusal is already
/// sent and the socket closed when this returns `None`.
async fn await_hello(
    authenticator: &ConnectionAuthenticator,
    socket: &mut WebSocket,
) -> Option<AuthContext> {
    let raw_message = match timeout(HANDSHAKE_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(Message::Text(raw_message)))) => raw_message,
        Ok(Some(Err(error))) if is_frame_size_violation(&error) => {
            close_frame_too_large(socket).await;
            return None;
        }
        Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return None,
        Ok(Some(Ok(_))) | Err(_) => {
            refuse_hello(socket).await;
            return None;
        }
    };

    if raw_message.len() > MAX_FRAME_BYTES {
        close_frame_too_large(socket).await;
        return None;
    }

    let Ok(WsMessage::Hello { protocol_version, token, document_id }) =
        ws_protocol::decode_message(raw_message.as_str())
    else {
        refuse_hello(socket).await;
        return None;
    };

    if let Err(upgrade_error) = protocol::require_supported(&protocol_version) {
        ws_protocol::refuse(
            socket,
            upgrade_error.code(),
            upgrade_error.message(),
            close_code::UPGRADE_REQUIRED,
        )
        .await;
        return None;
    }

    match authenticator.authenticate(&token, &document_id).await {
        Ok(ctx) => Some(ctx),
        Err(error) => {
            info!(document_id = %document_id, reason = %error, "connection refused");
            ws_protocol::refuse(socket, error.error_code(), &error.to_string(), error.close_code())
                .await;
            None
        }
    }
}

async fn refuse_hello(socket: &mut WebSocket) {
    let code = ErrorCode::SyncHelloRequired;
    ws_protocol::refuse(socket, code, code.default_message(), close_code::POLICY_VIOLATION).await;
}

/// Handles one decoded client frame on an admitted connection. Returns the
/// reply to send, if any. Every failure here leaves the connection open.
async fn handle_inbound(membership: &Membership, raw_message: &str) -> Option<WsMessage> {
    let inbound = match ws_protocol::decode_message(raw_message) {
        Ok(message) => message,
        Err(_) => {
            let code = ErrorCode::SyncInvalidMessage;
            return Some(ws_protocol::error_message(code, code.default_message()));
        }
    };

    let WsMessage::Update { document_id, payload_b64 } = inbound else {
        let code = ErrorCode::SyncUnsupportedMessage;
        return Some(ws_protocol::error_message(code, code.default_message()));
    };

    if document_id != membership.context().document_id() {
        return Some(ws_protocol::error_message(
            ErrorCode::SyncDocumentMismatch,
            format!(
                "update targets document {document_id}, connection is bound to {}",
                membership.context().document_id()
            ),
        ));
    }

    let payload = match ws_protocol::decode_payload(&payload_b64) {
        Ok(payload) => payload,
        Err(error) => {
            return Some(ws_protocol::error_message(
                ErrorCode::SyncMalformedUpdate,
                format!("payload_b64 is not valid base64: {error}"),
            ));
        }
    };

    match membership.apply_update(payload).await {
        Ok(ApplyOutcome::Buffered) | Ok(ApplyOutcome::Merged { .. }) => None,
        Err(error) => {
            debug!(
                connection_id = %membership.connection_id(),
                document_id = %document_id,
                reason = %error.reason(),
                "rejected malformed update"
            );
            Some(ws_protocol::error_message(ErrorCode::SyncMalformedUpdate, error.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_errors_are_recognised() {
        let error =
            axum::Error::new(std::io::Error::other("Space limit exceeded: Message too long"));
        assert!(is_frame_size_violation(&error));

        let other = axum::Error::new(std::io::Error::other("connection reset"));
        assert!(!is_frame_size_violation(&other));
    }

    #[test]
    fn frame_size_reason_names_the_limit() {
        assert!(frame_size_exceeded_reason().contains(&MAX_FRAME_BYTES.to_string()));
    }
}
