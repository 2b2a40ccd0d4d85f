//! Error taxonomy
//!
//! Errors are contained per unit of work (account, pattern) wherever the unit
//! is independent. Only errors that invalidate the whole run surface as
//! [`EngineError`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by the network API seam
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// Credentials missing, expired or not permitted
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Request rate exceeded
    #[error("Throttled: {0}")]
    Throttled(String),

    /// Referenced resource does not exist (or log group not enabled)
    #[error("Not found: {0}")]
    NotFound(String),

    /// A resource with the same identity tuple already exists
    #[error("Duplicate resource: {0}")]
    Conflict(String),

    /// Any other service-side failure
    #[error("{code}: {message}")]
    Service { code: String, message: String },
}

impl ApiError {
    pub fn service(code: &str, message: &str) -> Self {
        ApiError::Service {
            code: code.to_string(),
            message: message.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Throttled(_))
    }

    pub fn is_authorization(&self) -> bool {
        matches!(self, ApiError::AccessDenied(_))
    }

    /// Error class recorded on FAIL results
    pub fn class(&self) -> &str {
        match self {
            ApiError::AccessDenied(_) => "AccessDenied",
            ApiError::Throttled(_) => "Throttled",
            ApiError::NotFound(_) => "NotFound",
            ApiError::Conflict(_) => "DuplicateResourceConflict",
            ApiError::Service { code, .. } => code,
        }
    }
}

/// Errors that end a run (or a phase of it)
#[derive(Debug, Error)]
pub enum EngineError {
    /// Several hub routers are referenced and none dominates
    #[error("Ambiguous hub router: candidates {candidates:?}; supply a hub router id")]
    AmbiguousHub { candidates: Vec<String> },

    /// Stored golden path was written by a newer schema
    #[error("Golden path schema version {found} is newer than supported version {supported}")]
    SchemaVersion { found: u32, supported: u32 },

    /// Stored golden path is structurally invalid
    #[error("Invalid golden path: {0}")]
    InvalidGoldenPath(String),

    /// Authorization failed; the phase cannot produce meaningful results
    #[error("Authorization failed for account {account_id}: {message}")]
    Authorization { account_id: String, message: String },

    /// A result was recorded after the run was finalized
    #[error("Run already finalized")]
    RunAlreadyFinalized,

    /// A comparison phase needs a golden path that could not be found
    #[error("Golden path not found: {0}")]
    GoldenPathMissing(String),

    /// The run was interrupted
    #[error("Run cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn authorization(account_id: &str, err: &ApiError) -> Self {
        EngineError::Authorization {
            account_id: account_id.to_string(),
            message: err.to_string(),
        }
    }
}

/// One account's discovery degraded; other accounts proceed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialDiscoveryWarning {
    pub account_id: String,
    /// Connection kind being discovered, if the failure was kind-specific
    pub stage: String,
    pub message: String,
}

impl PartialDiscoveryWarning {
    pub fn new(account_id: &str, stage: &str, message: impl Into<String>) -> Self {
        Self {
            account_id: account_id.to_string(),
            stage: stage.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for PartialDiscoveryWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.account_id, self.stage, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_classification() {
        assert!(ApiError::Throttled("slow down".into()).is_retryable());
        assert!(!ApiError::AccessDenied("no".into()).is_retryable());
        assert!(ApiError::AccessDenied("no".into()).is_authorization());
        assert_eq!(ApiError::Conflict("x".into()).class(), "DuplicateResourceConflict");
        assert_eq!(ApiError::service("InternalError", "boom").class(), "InternalError");
    }

    #[test]
    fn test_engine_error_messages() {
        let err = EngineError::SchemaVersion {
            found: 9,
            supported: 2,
        };
        assert!(err.to_string().contains("9"));

        let err = EngineError::authorization("123", &ApiError::AccessDenied("expired".into()));
        assert!(err.to_string().contains("123"));
        assert!(err.to_string().contains("expired"));
    }
}
