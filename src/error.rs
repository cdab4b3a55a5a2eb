//! Error types for the route registry and the dispatcher's error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the route registry's mutating operations.
///
/// Read paths never return these; `RouteRegistry::load` absorbs them and
/// degrades to an empty or partially filtered result.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The lock marker could not be acquired within the retry budget
    #[error("timed out acquiring route lock at {}", path.display())]
    LockTimeout { path: PathBuf },

    /// The state directory could not be created
    #[error("failed to create state directory {}: {source}", path.display())]
    StateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The routes file exists but could not be read or understood
    #[error("corrupted routes file {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// Persisting the routes file failed
    #[error("failed to write routes file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize routes: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors that end a dispatcher connection without an HTTP response
#[derive(Debug, Error)]
pub enum DispatchError {
    /// An upgrade request named a host with no registered route
    #[error("no route for upgrade request to {host:?}")]
    UpgradeRejected { host: String },
}

/// Error codes for dispatcher error responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchErrorCode {
    /// Missing or empty Host header
    MissingHostHeader,
    /// No route registered for the requested host
    UnknownHost,
    /// The backend actively refused the connection
    ConnectionRefused,
    /// Any other forwarding failure (reset, timeout, unreachable)
    BackendUnreachable,
}

impl DispatchErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            DispatchErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            DispatchErrorCode::ConnectionRefused => StatusCode::BAD_GATEWAY,
            DispatchErrorCode::BackendUnreachable => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            DispatchErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            DispatchErrorCode::UnknownHost => "UNKNOWN_HOST",
            DispatchErrorCode::ConnectionRefused => "CONNECTION_REFUSED",
            DispatchErrorCode::BackendUnreachable => "BACKEND_UNREACHABLE",
        }
    }

    /// Default user-facing message for the code
    pub fn message(&self) -> &'static str {
        match self {
            DispatchErrorCode::MissingHostHeader => "Missing Host header",
            DispatchErrorCode::UnknownHost => "Not Found",
            DispatchErrorCode::ConnectionRefused => {
                "Bad Gateway: the target app is not responding. It may have crashed."
            }
            DispatchErrorCode::BackendUnreachable => {
                "Bad Gateway: the target app may not be running."
            }
        }
    }
}

/// Create a plain text error response with X-Proxy-Error header
pub fn text_error_response(code: DispatchErrorCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    error_response(code, "text/plain", code.message().to_string())
}

/// Create an HTML error response with X-Proxy-Error header
pub fn html_error_response(
    code: DispatchErrorCode,
    html: String,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    error_response(code, "text/html; charset=utf-8", html)
}

fn error_response(
    code: DispatchErrorCode,
    content_type: &'static str,
    body: String,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, content_type)
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            DispatchErrorCode::MissingHostHeader.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            DispatchErrorCode::UnknownHost.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            DispatchErrorCode::ConnectionRefused.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            DispatchErrorCode::BackendUnreachable.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_bad_gateway_messages_differ() {
        let refused = DispatchErrorCode::ConnectionRefused.message();
        let other = DispatchErrorCode::BackendUnreachable.message();
        assert!(refused.contains("crashed"));
        assert!(other.contains("may not be running"));
        assert_ne!(refused, other);
    }

    #[tokio::test]
    async fn test_text_error_response() {
        let response = text_error_response(DispatchErrorCode::MissingHostHeader);

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/plain"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "MISSING_HOST_HEADER"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Missing Host header");
    }

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::LockTimeout {
            path: PathBuf::from("/tmp/state/routes.lock"),
        };
        assert_eq!(
            err.to_string(),
            "timed out acquiring route lock at /tmp/state/routes.lock"
        );
    }
}
