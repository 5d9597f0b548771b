use std::sync::Arc;

use notesync_common::protocol::ws::close_code;
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    auth::jwt::JwtCredentialVerifier,
    error::{ErrorCode, RelayError},
    records::{DocumentRecord, DocumentRecordStore, UserId, UserRecord},
};

/// Who is connected and to what. Built once per connection at admission
/// and reused for every message on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user: UserRecord,
    pub document: DocumentRecord,
}

impl AuthContext {
    pub fn document_id(&self) -> &str {
        &self.document.id
    }

    pub fn user_id(&self) -> UserId {
        self.user.id
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("invalid credential")]
    InvalidCredential,
    #[error("document {document_id} not found")]
    DocumentNotFound { document_id: String },
    #[error("user {user_id} does not own document {document_id}")]
    NotOwner { user_id: UserId, document_id: String },
    #[error("document {document_id} is read-only")]
    ReadOnlyViolation { document_id: String },
    #[error("document record store unavailable")]
    Unavailable(#[source] anyhow::Error),
}

impl AdmissionError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidCredential => ErrorCode::AuthInvalidCredential,
            Self::DocumentNotFound { .. } => ErrorCode::DocNotFound,
            Self::NotOwner { .. } => ErrorCode::AuthNotOwner,
            Self::ReadOnlyViolation { .. } => ErrorCode::DocReadOnly,
            Self::Unavailable(_) => ErrorCode::InternalError,
        }
    }

    /// WebSocket close code sent after the error frame.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::InvalidCredential => close_code::INVALID_CREDENTIAL,
            Self::DocumentNotFound { .. } => close_code::DOCUMENT_NOT_FOUND,
            Self::NotOwner { .. } | Self::ReadOnlyViolation { .. } => close_code::FORBIDDEN,
            Self::Unavailable(_) => close_code::INTERNAL_ERROR,
        }
    }
}

impl From<AdmissionError> for RelayError {
    fn from(error: AdmissionError) -> Self {
        RelayError::from_code(error.error_code())
    }
}

/// Decides whether a credential may open a given document.
///
/// Checks run in a fixed order and the first failure wins: credential,
/// document existence, ownership, read-only flag, user row.
pub struct ConnectionAuthenticator {
    verifier: Arc<JwtCredentialVerifier>,
    records: Arc<dyn DocumentRecordStore>,
}

impl ConnectionAuthenticator {
    pub fn new(
        verifier: Arc<JwtCredentialVerifier>,
        records: Arc<dyn DocumentRecordStore>,
    ) -> Self {
        Self { verifier, records }
    }

    pub async fn authenticate(
        &self,
        token: &str,
        document_id: &str,
    ) -> Result<AuthContext, AdmissionError> {
        let credential = self.verifier.verify(token).map_err(|error| {
            debug!(error = %format!("{error:#}"), "credential rejected");
            AdmissionError::InvalidCredential
        })?;

        self.authorize(credential.user_id, document_id)
            .instrument(info_span!(
                "relay.auth.authorize",
                user_id = credential.user_id,
                document_id = %document_id
            ))
            .await
    }

    /// Record checks for an already verified user id.
    pub async fn authorize(
        &self,
        user_id: UserId,
        document_id: &str,
    ) -> Result<AuthContext, AdmissionError> {
        let document = self
            .records
            .find_by_id(document_id)
            .await
            .map_err(AdmissionError::Unavailable)?
            .filter(|document| !document.is_deleted())
            .ok_or_else(|| AdmissionError::DocumentNotFound {
                document_id: document_id.to_owned(),
            })?;

        if document.owner_id != user_id {
            return Err(AdmissionError::NotOwner { user_id, document_id: document_id.to_owned() });
        }

        if document.read_only {
            return Err(AdmissionError::ReadOnlyViolation { document_id: document_id.to_owned() });
        }

        let user = self.records.find_user(user_id).await.map_err(AdmissionError::Unavailable)?;
        let Some(user) = user else {
            warn!(user_id, "credential names a user that no longer exists");
            return Err(AdmissionError::InvalidCredential);
        };

        Ok(AuthContext { user, document })
    }
}
