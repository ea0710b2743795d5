//! Error handling and JSON error responses for the proxy and admin API

use chrono::{DateTime, Utc};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error carried by a response body that fails mid-stream
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body of every response the proxy and admin listeners produce
pub type ResponseBody = BoxBody<Bytes, BoxError>;

/// Header carrying the machine-readable error code
pub const X_PROXY_ERROR: HeaderName = HeaderName::from_static("x-proxy-error");

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No alive backend could be selected
    NoBackendAvailable,
    /// Request timed out waiting for backend
    RequestTimeout,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Request body exceeds the configured limit
    PayloadTooLarge,
    /// Malformed admin request
    InvalidRequest,
    /// Admin operation on an unregistered backend
    BackendNotFound,
    /// Admin add of an already-registered backend
    BackendExists,
    /// Unknown admin path
    NotFound,
    /// Wrong method on an admin endpoint
    MethodNotAllowed,
    /// Mutating admin call without the configured token
    Unauthorized,
    /// Sticky sessions are disabled
    SessionsDisabled,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::NoBackendAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::BackendNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::BackendExists => StatusCode::CONFLICT,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ProxyErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyErrorCode::SessionsDisabled => StatusCode::BAD_REQUEST,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NoBackendAvailable => "NO_BACKEND_AVAILABLE",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ProxyErrorCode::InvalidRequest => "INVALID_REQUEST",
            ProxyErrorCode::BackendNotFound => "BACKEND_NOT_FOUND",
            ProxyErrorCode::BackendExists => "BACKEND_EXISTS",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ProxyErrorCode::Unauthorized => "UNAUTHORIZED",
            ProxyErrorCode::SessionsDisabled => "SESSIONS_DISABLED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Pool counts attached to a 503 so clients can tell "none alive" from "none configured"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackendsStatus {
    pub total: usize,
    pub alive: usize,
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backends_status: Option<BackendsStatus>,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
            time: None,
            backends_status: None,
        }
    }

    /// Stamp the response with the current time and pool counts
    pub fn with_backends_status(mut self, total: usize, alive: usize) -> Self {
        self.time = Some(Utc::now());
        self.backends_status = Some(BackendsStatus { total, alive });
        self
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }

    /// Build the HTTP response carrying this body
    pub fn into_response(self) -> Response<ResponseBody> {
        let mut response = Response::new(
            Full::new(Bytes::from(self.to_json()))
                .map_err(|e| match e {})
                .boxed(),
        );
        *response.status_mut() = self.code.status_code();
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            X_PROXY_ERROR,
            HeaderValue::from_static(self.code.as_header_value()),
        );
        response
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<ResponseBody> {
    ErrorResponse::new(code, message).into_response()
}

/// The 503 returned when no alive backend can be selected
pub fn no_backend_response(total: usize, alive: usize) -> Response<ResponseBody> {
    ErrorResponse::new(
        ProxyErrorCode::NoBackendAvailable,
        "No healthy backend servers available",
    )
    .with_backends_status(total, alive)
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::NoBackendAvailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::BackendExists.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ProxyErrorCode::PayloadTooLarge.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ProxyErrorCode::Unauthorized.status_code(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::BackendNotFound, "Backend not found: http://a:1");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"BACKEND_NOT_FOUND\""));
        assert!(json.contains("\"message\":\"Backend not found: http://a:1\""));
        assert!(json.contains("\"status\":404"));
        assert!(!json.contains("backends_status"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::RequestTimeout, "Request timed out");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "REQUEST_TIMEOUT"
        );
    }

    #[tokio::test]
    async fn test_no_backend_response_body() {
        let response = no_backend_response(3, 0);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "NO_BACKEND_AVAILABLE");
        assert_eq!(json["status"], 503);
        assert_eq!(json["backends_status"]["total"], 3);
        assert_eq!(json["backends_status"]["alive"], 0);
        assert!(json["time"].is_string());
    }

    #[test]
    fn test_error_code_header_values() {
        assert_eq!(
            ProxyErrorCode::NoBackendAvailable.as_header_value(),
            "NO_BACKEND_AVAILABLE"
        );
        assert_eq!(
            ProxyErrorCode::MethodNotAllowed.as_header_value(),
            "METHOD_NOT_ALLOWED"
        );
    }
}
