use hyper::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;

use crate::tunnel_api::TunnelApiError;

/// Errors surfaced to the browser as `{"ok": false, "error": ...}`
#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("{0}")]
    MissingBinary(String),

    #[error("{message}")]
    Upstream {
        status: StatusCode,
        message: String,
        detail: Option<Value>,
    },

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ConsoleError>;

impl ConsoleError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ConsoleError::Validation(_) | ConsoleError::MissingBinary(_) => StatusCode::BAD_REQUEST,
            ConsoleError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ConsoleError::NotFound(_) => StatusCode::NOT_FOUND,
            ConsoleError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ConsoleError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ConsoleError::Upstream { status, .. } => *status,
            ConsoleError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON body for the error response
    pub fn to_json(&self) -> Value {
        let mut body = json!({ "ok": false, "error": self.to_string() });
        if let ConsoleError::Upstream {
            detail: Some(detail),
            ..
        } = self
        {
            body["detail"] = detail.clone();
        }
        body
    }

    /// Map a tunnel API failure, using `context` as the message prefix
    pub fn upstream(context: &str, err: TunnelApiError) -> Self {
        match err {
            TunnelApiError::Request(message) => ConsoleError::Upstream {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: format!("{} request failed: {}", context, message),
                detail: None,
            },
            TunnelApiError::Api { message, errors } => ConsoleError::Upstream {
                status: StatusCode::BAD_REQUEST,
                message: format!("{} failed: {}", context, message),
                detail: Some(errors),
            },
            TunnelApiError::InvalidResponse(message) => ConsoleError::Upstream {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: format!("{} failed: {}", context, message),
                detail: None,
            },
        }
    }
}

impl From<std::io::Error> for ConsoleError {
    fn from(err: std::io::Error) -> Self {
        ConsoleError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for ConsoleError {
    fn from(err: serde_json::Error) -> Self {
        ConsoleError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ConsoleError::validation("invalid domain").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ConsoleError::NotFound("domain not found".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ConsoleError::RateLimited.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_upstream_api_error_keeps_detail() {
        let err = ConsoleError::upstream(
            "tunnel creation",
            TunnelApiError::Api {
                message: "Authentication error".into(),
                errors: json!([{ "code": 10000, "message": "Authentication error" }]),
            },
        );
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let body = err.to_json();
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"], "tunnel creation failed: Authentication error");
        assert_eq!(body["detail"][0]["code"], 10000);
    }

    #[test]
    fn test_upstream_request_error_is_500() {
        let err = ConsoleError::upstream("zones", TunnelApiError::Request("timed out".into()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_json().get("detail").is_none());
    }
}
