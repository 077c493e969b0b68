//! Error taxonomy for the engine.
//!
//! Startup errors ([`SchemaError`], [`ConflictError`]) abort engine
//! construction. Everything that can happen while serving a request is
//! converted into an [`ApiError`] inside the pipeline and rendered as a
//! response; nothing per-request escapes as a Rust error.

use crate::validator::Violation;
use hyper::{Method, StatusCode};
use std::path::PathBuf;
use thiserror::Error;

/// Malformed declarative input (schemas, routes, rules).
#[derive(Debug, Clone, Error, PartialEq)]
#[error("schema error in {subject}: {reason}")]
pub struct SchemaError {
    /// What was being registered, e.g. `User.email` or `GET /users`.
    pub subject: String,
    /// Why it was rejected.
    pub reason: String,
}

impl SchemaError {
    pub fn new(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            reason: reason.into(),
        }
    }
}

/// Duplicate route registration.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("route {method} {pattern} is already registered")]
pub struct ConflictError {
    pub method: Method,
    pub pattern: String,
}

/// Fatal errors raised while building an [`crate::Engine`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration failed its structural checks.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// Recording file could not be read or parsed.
    #[error("failed to load recordings from {path}: {reason}")]
    Recordings { path: PathBuf, reason: String },

    /// Upstream target is not a usable URL or the HTTP client failed to build.
    #[error("invalid upstream: {0}")]
    Upstream(String),
}

/// No registered route matches a request.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("no route for {method} {path}")]
pub struct NoMatch {
    pub method: Method,
    pub path: String,
    /// Methods that do have a route for this path.
    pub allowed: Vec<Method>,
}

/// Resource store failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("unknown resource schema '{0}'")]
    UnknownSchema(String),

    #[error("{schema} '{id}' not found")]
    NotFound { schema: String, id: String },

    #[error("field '{field}' references missing {target} '{id}'")]
    DanglingReference {
        field: String,
        target: String,
        id: String,
    },

    #[error("{schema} '{id}' is at revision {current}, expected {expected}")]
    RevisionMismatch {
        schema: String,
        id: String,
        expected: u64,
        current: u64,
    },

    #[error("invalid query parameter '{param}': {reason}")]
    InvalidQuery { param: String, reason: String },
}

/// Upstream forwarding failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProxyError {
    #[error("upstream {target} unreachable: {reason}")]
    UpstreamUnreachable { target: String, reason: String },

    #[error("upstream {target} timed out after {timeout_ms}ms")]
    UpstreamTimeout { target: String, timeout_ms: u64 },
}

/// Replay corpus has no entry for a fingerprint.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("no recording for {method} {path}")]
pub struct NoRecording {
    pub method: String,
    pub path: String,
}

/// HTTP server failures.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("failed to accept connection: {0}")]
    Accept(#[from] std::io::Error),
}

/// A per-request failure, ready to be rendered as a response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    /// Machine-readable kind, e.g. `not_found`.
    pub kind: &'static str,
    /// Human-readable message.
    pub message: String,
    /// HTTP status code.
    pub status: StatusCode,
    /// Field-level violations (validation failures only).
    pub violations: Vec<Violation>,
    /// Extra headers such as `Allow` or `WWW-Authenticate`.
    pub headers: Vec<(String, String)>,
}

impl ApiError {
    pub fn new(kind: &'static str, message: impl Into<String>, status: StatusCode) -> Self {
        Self {
            kind,
            message: message.into(),
            status,
            violations: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("bad_request", message, StatusCode::BAD_REQUEST)
    }

    pub fn route_not_found() -> Self {
        Self::new("route_not_found", "No matching route found", StatusCode::NOT_FOUND)
    }

    pub fn method_not_allowed(allowed: &[Method]) -> Self {
        let allow = allowed
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        Self::new(
            "method_not_allowed",
            "Method not allowed for this path",
            StatusCode::METHOD_NOT_ALLOWED,
        )
        .with_header("Allow", allow)
    }

    pub fn unauthorized(scheme: &str) -> Self {
        Self::new("unauthorized", "Missing or invalid credentials", StatusCode::UNAUTHORIZED)
            .with_header("WWW-Authenticate", scheme)
    }

    pub fn not_acceptable() -> Self {
        Self::new(
            "not_acceptable",
            "Supported media types: application/json, application/xml",
            StatusCode::NOT_ACCEPTABLE,
        )
    }

    pub fn payload_too_large(limit: usize) -> Self {
        Self::new(
            "payload_too_large",
            format!("Request body exceeds {} bytes", limit),
            StatusCode::PAYLOAD_TOO_LARGE,
        )
    }

    pub fn validation_failed(violations: Vec<Violation>) -> Self {
        let message = match violations.len() {
            1 => "1 field failed validation".to_string(),
            n => format!("{} fields failed validation", n),
        };
        Self {
            violations,
            ..Self::new("validation_failed", message, StatusCode::BAD_REQUEST)
        }
    }

    pub fn no_recording(err: &NoRecording) -> Self {
        Self::new("no_recording", err.to_string(), StatusCode::NOT_FOUND)
    }

    pub fn chaos(status: StatusCode, message: impl Into<String>) -> Self {
        Self::new("chaos_injected", message, status)
    }

    /// JSON body shared by every error response.
    pub fn body(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "error": self.kind,
            "message": self.message,
        });
        if !self.violations.is_empty() {
            body["violations"] = serde_json::json!(self.violations);
        }
        body
    }
}

impl From<NoMatch> for ApiError {
    fn from(err: NoMatch) -> Self {
        if err.allowed.is_empty() {
            Self::route_not_found()
        } else {
            Self::method_not_allowed(&err.allowed)
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err {
            StoreError::UnknownSchema(_) => {
                Self::new("internal", message, StatusCode::INTERNAL_SERVER_ERROR)
            }
            StoreError::NotFound { .. } => Self::new("not_found", message, StatusCode::NOT_FOUND),
            StoreError::DanglingReference { .. } => {
                Self::new("invalid_reference", message, StatusCode::UNPROCESSABLE_ENTITY)
            }
            StoreError::RevisionMismatch { .. } => Self::new(
                "precondition_failed",
                message,
                StatusCode::PRECONDITION_FAILED,
            ),
            StoreError::InvalidQuery { .. } => {
                Self::new("invalid_query", message, StatusCode::BAD_REQUEST)
            }
        }
    }
}

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        let message = err.to_string();
        match err {
            ProxyError::UpstreamUnreachable { .. } => {
                Self::new("upstream_unreachable", message, StatusCode::BAD_GATEWAY)
            }
            ProxyError::UpstreamTimeout { .. } => {
                Self::new("upstream_timeout", message, StatusCode::GATEWAY_TIMEOUT)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_statuses() {
        let not_found = ApiError::from(StoreError::NotFound {
            schema: "User".to_string(),
            id: "42".to_string(),
        });
        assert_eq!(not_found.status, StatusCode::NOT_FOUND);
        assert_eq!(not_found.body()["error"], "not_found");

        let mismatch = ApiError::from(StoreError::RevisionMismatch {
            schema: "User".to_string(),
            id: "42".to_string(),
            expected: 1,
            current: 3,
        });
        assert_eq!(mismatch.status, StatusCode::PRECONDITION_FAILED);
    }

    #[test]
    fn test_proxy_errors_map_to_gateway_statuses() {
        let unreachable = ApiError::from(ProxyError::UpstreamUnreachable {
            target: "http://localhost:1".to_string(),
            reason: "connection refused".to_string(),
        });
        assert_eq!(unreachable.status, StatusCode::BAD_GATEWAY);

        let timeout = ApiError::from(ProxyError::UpstreamTimeout {
            target: "http://localhost:1".to_string(),
            timeout_ms: 100,
        });
        assert_eq!(timeout.status, StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_no_match_with_other_methods_is_405() {
        let err = ApiError::from(NoMatch {
            method: Method::DELETE,
            path: "/users".to_string(),
            allowed: vec![Method::GET, Method::POST],
        });
        assert_eq!(err.status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(
            err.headers,
            vec![("Allow".to_string(), "GET, POST".to_string())]
        );
    }
}
