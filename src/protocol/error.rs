//! Protocol error taxonomy and the structured error body every failure carries.
//!
//! Adapters return [`ProtocolError`] for expected failures (missing entries,
//! id conflicts, read-only collections). The provider translates each variant
//! 1:1 into an HTTP status. Anything else is wrapped in
//! [`ProtocolError::Internal`] and becomes a 500 whose detail is only exposed
//! when the server runs with the debug flag.
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// An immutable field (usually the entry id) was changed.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Malformed request or an entry failing the minimal validity checks.
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Method {method} not allowed")]
    MethodNotAllowed { method: Method, allowed: Vec<Method> },

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Not modified")]
    NotModified,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Catch-all for failures the protocol layer does not recognize.
    #[error("Internal server error")]
    Internal(#[source] anyhow::Error),
}

impl ProtocolError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn bad_request(why: impl Into<String>) -> Self {
        Self::BadRequest(why.into())
    }

    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        Self::Internal(err.into())
    }

    /// HTTP status for this error kind.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            Self::NotModified => StatusCode::NOT_MODIFIED,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Builds the client-facing error body.
    ///
    /// Internal errors keep their message generic; the cause chain is only
    /// attached as `detail` when `debug` is set.
    pub fn to_body(&self, debug: bool) -> ErrorBody {
        let code = self.status().as_u16();
        match self {
            Self::Internal(err) => ErrorBody {
                code,
                message: "Internal server error".to_string(),
                detail: debug.then(|| format!("{err:?}")),
            },
            other => ErrorBody {
                code,
                message: other.to_string(),
                detail: None,
            },
        }
    }
}

impl From<anyhow::Error> for ProtocolError {
    fn from(err: anyhow::Error) -> Self {
        // Adapters built on anyhow may still carry a structured error inside.
        match err.downcast::<ProtocolError>() {
            Ok(protocol) => protocol,
            Err(other) => ProtocolError::Internal(other),
        }
    }
}

impl From<crate::storage::DatabaseError> for ProtocolError {
    fn from(err: crate::storage::DatabaseError) -> Self {
        match err {
            crate::storage::DatabaseError::InstanceLocked => {
                ProtocolError::ServiceUnavailable("storage is locked".to_string())
            }
            other => ProtocolError::Internal(other.into()),
        }
    }
}

impl From<crate::model::xml::XmlError> for ProtocolError {
    fn from(err: crate::model::xml::XmlError) -> Self {
        match err {
            crate::model::xml::XmlError::Write(_) => ProtocolError::Internal(err.into()),
            other => ProtocolError::BadRequest(other.to_string()),
        }
    }
}

// ============================================================================
// Error Body
// ============================================================================

/// The single error shape returned for every failing status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ProtocolError::not_found("x").status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ProtocolError::Conflict("id".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ProtocolError::UnsupportedMediaType("text/plain".into()).status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            ProtocolError::MethodNotAllowed {
                method: Method::PATCH,
                allowed: vec![Method::GET],
            }
            .status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            ProtocolError::ServiceUnavailable("busy".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProtocolError::internal(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_internal_detail_hidden_without_debug() {
        let err = ProtocolError::internal(anyhow::anyhow!("secret path /var/db"));
        let body = err.to_body(false);
        assert_eq!(body.code, 500);
        assert!(body.detail.is_none());
        assert!(!body.message.contains("/var/db"));

        let body = err.to_body(true);
        assert!(body.detail.unwrap().contains("/var/db"));
    }

    #[test]
    fn test_anyhow_downcast_keeps_structured_error() {
        let wrapped = anyhow::Error::new(ProtocolError::not_found("entry 7"));
        let err = ProtocolError::from(wrapped);
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_error_body_json_shape() {
        let body = ProtocolError::bad_request("missing title").to_body(false);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], 400);
        assert_eq!(json["message"], "Bad request: missing title");
        assert!(json.get("detail").is_none());
    }
}
