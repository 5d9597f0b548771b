use axum::extract::ws::{CloseFrame, Message, WebSocket};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use notesync_common::protocol::ws::WsMessage;

use crate::{error::ErrorCode, sync::session::SessionFrame};

pub fn decode_message(raw: &str) -> Result<WsMessage, serde_json::Error> {
    serde_json::from_str::<WsMessage>(raw)
}

pub fn encode_message(message: &WsMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

pub fn decode_payload(payload_b64: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(payload_b64)
}

pub fn frame_message(document_id: &str, frame: &SessionFrame) -> WsMessage {
    match frame {
        SessionFrame::Snapshot(state) => WsMessage::Snapshot {
            document_id: document_id.to_owned(),
            payload_b64: STANDARD.encode(state),
        },
        SessionFrame::Update(update) => WsMessage::Update {
            document_id: document_id.to_owned(),
            payload_b64: STANDARD.encode(update),
        },
    }
}

pub fn error_message(code: ErrorCode, message: impl Into<String>) -> WsMessage {
    WsMessage::error(code.as_str(), message, code.retryable())
}

pub async fn send_ws_message(socket: &mut WebSocket, message: &WsMessage) -> Result<(), ()> {
    let encoded = encode_message(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

/// Sends an error frame followed by a close frame carrying `close_code`.
pub async fn refuse(socket: &mut WebSocket, code: ErrorCode, message: &str, close_code: u16) {
    let _ = send_ws_message(socket, &error_message(code, message)).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code: close_code, reason: code.as_str().into() })))
        .await;
}
