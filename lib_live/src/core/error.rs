//! # Error Taxonomy
//!
//! Every fallible engine operation returns `Result<T, LiveError>`. The
//! dispatcher converts these into reply frames, so each variant carries a
//! stable wire code (`LiveError::code`).

use thiserror::Error;

use crate::core::signature::SignatureError;
use crate::core::uploads::UploadError;

/// Convenience alias used across the engine.
pub type LiveResult<T> = Result<T, LiveError>;

#[derive(Debug, Error)]
pub enum LiveError {
    /// No definition matched the requested component name.
    #[error("Component '{name}' not found. Available components: {}", available.join(", "))]
    ComponentNotFound { name: String, available: Vec<String> },

    /// A required service is not registered in the service container.
    #[error("Component '{component}' requires service '{dependency}' which is not registered")]
    MissingDependency { component: String, dependency: String },

    /// The instance is gone; the client should rehydrate from its signed state.
    #[error("Component '{component_id}' is not mounted; rehydration required")]
    RehydrationRequired { component_id: String },

    /// The envelope signature does not match its content, or it names another component.
    #[error("Signed state for '{component_id}' failed verification: {reason}")]
    SignatureTampered { component_id: String, reason: String },

    /// The envelope is older than the accepted maximum age.
    #[error("Signed state for '{component_id}' expired: {reason}")]
    SignatureExpired { component_id: String, reason: String },

    /// Upload rejected (type, size, duplicate id, missing chunks, ...).
    #[error("Upload rejected: {0}")]
    UploadValidation(String),

    /// The component has no action by that name.
    #[error("Action '{action}' not found on component '{component}'")]
    ActionNotFound { component: String, action: String },

    /// The action (or lifecycle hook) returned an error.
    #[error("Action '{action}' failed: {message}")]
    ActionExecution { action: String, message: String },

    /// The frame could not be decoded or is missing a field.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Signature engine failure other than tamper/expiry (bad key, codec error).
    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LiveError {
    /// Stable code sent as `errorCode` in reply frames.
    pub fn code(&self) -> &'static str {
        match self {
            LiveError::ComponentNotFound { .. } => "COMPONENT_NOT_FOUND",
            LiveError::MissingDependency { .. } => "MISSING_DEPENDENCY",
            LiveError::RehydrationRequired { .. } => "REHYDRATION_REQUIRED",
            LiveError::SignatureTampered { .. } => "SIGNATURE_TAMPERED",
            LiveError::SignatureExpired { .. } => "SIGNATURE_EXPIRED",
            LiveError::UploadValidation(_) => "UPLOAD_VALIDATION",
            LiveError::ActionNotFound { .. } => "ACTION_NOT_FOUND",
            LiveError::ActionExecution { .. } => "ACTION_FAILED",
            LiveError::InvalidMessage(_) => "INVALID_MESSAGE",
            LiveError::Signature(_) | LiveError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// True for the recoverable "instance vanished" signal.
    pub fn is_rehydration_required(&self) -> bool {
        matches!(self, LiveError::RehydrationRequired { .. })
    }
}

impl From<UploadError> for LiveError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Io(e) => LiveError::Internal(format!("upload I/O: {}", e)),
            other => LiveError::UploadValidation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_not_found_lists_names() {
        let err = LiveError::ComponentNotFound {
            name: "Nope".into(),
            available: vec!["Counter".into(), "Wallet".into()],
        };
        assert_eq!(err.code(), "COMPONENT_NOT_FOUND");
        assert!(err.to_string().contains("Counter, Wallet"));
    }

    #[test]
    fn test_signature_variants_carry_reason() {
        let err = LiveError::SignatureExpired {
            component_id: "c1".into(),
            reason: "State expired: 90000ms old".into(),
        };
        assert_eq!(err.code(), "SIGNATURE_EXPIRED");
        assert!(err.to_string().contains("90000ms"));
    }

    #[test]
    fn test_upload_error_maps_to_validation() {
        let err: LiveError = UploadError::DuplicateUpload("u1".into()).into();
        assert_eq!(err.code(), "UPLOAD_VALIDATION");
    }
}
