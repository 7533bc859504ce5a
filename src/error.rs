// Error taxonomy for the quota holder
//
// Every call reports one of these. Partial batch calls return them per
// rejected item (see batch.rs); single-item calls return them directly.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur in quota holder operations
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum QuotaError {
    /// Supplied key does not match, or the caller has no authority over the target
    #[error("authorization failed: {0}")]
    Authorization(String),

    /// Unknown entity, resource, policy or serial
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate create
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed names or limit parameters
    #[error("invalid input: {0}")]
    Validation(String),

    /// A provision would breach the holding's policy
    #[error("limit exceeded on {entity}:{resource}: {reason}")]
    LimitExceeded {
        entity: String,
        resource: String,
        reason: String,
    },

    /// Unknown or already-resolved commission serial
    #[error("invalid commission {serial}: {reason}")]
    InvalidCommission { serial: u64, reason: String },

    /// Release attempted while the entity still holds something
    #[error("entity {entity} is not empty: {reason}")]
    NotEmpty { entity: String, reason: String },

    /// Storage backend failure
    #[error("storage error: {0}")]
    Storage(String),
}

impl QuotaError {
    /// Short stable name, used in logs and CSV/JSON output
    pub fn kind(&self) -> &'static str {
        match self {
            QuotaError::Authorization(_) => "AuthorizationError",
            QuotaError::NotFound(_) => "NotFoundError",
            QuotaError::Conflict(_) => "ConflictError",
            QuotaError::Validation(_) => "ValidationError",
            QuotaError::LimitExceeded { .. } => "LimitExceededError",
            QuotaError::InvalidCommission { .. } => "InvalidCommissionError",
            QuotaError::NotEmpty { .. } => "NotEmptyError",
            QuotaError::Storage(_) => "StorageError",
        }
    }

    pub(crate) fn limit(entity: &str, resource: &str, reason: impl Into<String>) -> Self {
        QuotaError::LimitExceeded {
            entity: entity.to_string(),
            resource: resource.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<rusqlite::Error> for QuotaError {
    fn from(err: rusqlite::Error) -> Self {
        QuotaError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for QuotaError {
    fn from(err: serde_json::Error) -> Self {
        QuotaError::Storage(err.to_string())
    }
}

pub type QuotaResult<T> = std::result::Result<T, QuotaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_names() {
        assert_eq!(QuotaError::Conflict("e1".into()).kind(), "ConflictError");
        assert_eq!(
            QuotaError::InvalidCommission {
                serial: 4,
                reason: "already accepted".into()
            }
            .kind(),
            "InvalidCommissionError"
        );
    }

    #[test]
    fn test_error_display() {
        let err = QuotaError::limit("e1", "cpu", "capacity 10 < 12");
        assert_eq!(err.to_string(), "limit exceeded on e1:cpu: capacity 10 < 12");
    }

    #[test]
    fn test_error_serializes_with_kind_tag() {
        let json = serde_json::to_value(QuotaError::NotFound("policy p1".into())).unwrap();
        assert_eq!(json["kind"], "NotFound");
        assert_eq!(json["detail"], "policy p1");
    }
}
