// Protocol version negotiation.
//
// Clients announce a protocol version in their hello frame. Unsupported
// versions are refused with UPGRADE_REQUIRED before any credential is
// inspected. The version list itself lives in notesync-common so clients
// and the relay agree on it.

use crate::error::{ErrorCode, RelayError};
use notesync_common::protocol::ws::{
    is_supported_version, CURRENT_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use serde_json::json;

/// Validates a client-supplied protocol version. Returns `Ok(())` if
/// supported, or a `RelayError` with code `UPGRADE_REQUIRED` and
/// `details.supported_versions` if not.
pub fn require_supported(version: &str) -> Result<(), RelayError> {
    if is_supported_version(version) {
        Ok(())
    } else {
        Err(RelayError::new(
            ErrorCode::UpgradeRequired,
            format!("unsupported protocol version: {version}"),
        )
        .with_details(json!({
            "requested_version": version,
            "supported_versions": SUPPORTED_PROTOCOL_VERSIONS,
            "current_version": CURRENT_PROTOCOL_VERSION,
        })))
    }
}
