// WebSocket message types for the notesync-sync.v1 protocol.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The current (latest) protocol version.
pub const CURRENT_PROTOCOL_VERSION: &str = "notesync-sync.v1";

/// All protocol versions the relay accepts, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[CURRENT_PROTOCOL_VERSION, "notesync-sync.v0"];

/// Close codes sent when a connection is refused or terminated. The 4xxx
/// codes are application-defined; the rest are standard RFC 6455 codes.
pub mod close_code {
    pub const INVALID_CREDENTIAL: u16 = 4401;
    pub const FORBIDDEN: u16 = 4403;
    pub const DOCUMENT_NOT_FOUND: u16 = 4404;
    pub const UPGRADE_REQUIRED: u16 = 4426;

    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// All message types in the notesync-sync.v1 WebSocket protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Client -> Server: handshake carrying the bearer credential and target document.
    Hello { protocol_version: String, token: String, document_id: String },

    /// Server -> Client: the connection was admitted into the document session.
    HelloAck { server_time: String, document_id: String, connection_id: Uuid },

    /// Server -> Client: merged document state used as the connection's baseline.
    Snapshot { document_id: String, payload_b64: String },

    /// Bidirectional: a CRDT update (v1 encoding).
    Update { document_id: String, payload_b64: String },

    /// Server -> Client: error.
    Error { code: String, message: String, retryable: bool },
}

impl WsMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self::Error { code: code.into(), message: message.into(), retryable }
    }
}

pub fn is_supported_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn messages_are_tagged_with_snake_case_type() {
        let message = WsMessage::HelloAck {
            server_time: "2026-02-07T00:00:00Z".to_string(),
            document_id: "doc1".to_string(),
            connection_id: Uuid::nil(),
        };

        let encoded: Value = serde_json::to_value(&message).expect("message should serialize");
        assert_eq!(encoded["type"], "hello_ack");
        assert_eq!(encoded["document_id"], "doc1");
    }

    #[test]
    fn hello_decodes_from_client_json() {
        let raw = r#"{"type":"hello","protocol_version":"notesync-sync.v1","token":"t","document_id":"r-1"}"#;
        let decoded: WsMessage = serde_json::from_str(raw).expect("hello should decode");

        assert_eq!(
            decoded,
            WsMessage::Hello {
                protocol_version: CURRENT_PROTOCOL_VERSION.to_string(),
                token: "t".to_string(),
                document_id: "r-1".to_string(),
            }
        );
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let raw = r#"{"type":"subscribe","doc_id":"x"}"#;
        assert!(serde_json::from_str::<WsMessage>(raw).is_err());
    }

    #[test]
    fn current_version_is_first_supported_version() {
        assert_eq!(SUPPORTED_PROTOCOL_VERSIONS[0], CURRENT_PROTOCOL_VERSION);
        assert!(is_supported_version("notesync-sync.v0"));
        assert!(!is_supported_version("notesync-sync.v2"));
    }
}
