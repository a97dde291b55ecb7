//! Error handling and JSON responses generated by the gateway itself

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No backend owns the request path
    UnknownRoute,
    /// Method outside the forwarded set
    MethodNotAllowed,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Backend did not answer within the request timeout
    RequestTimeout,
    /// Internal gateway error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UnknownRoute => StatusCode::NOT_FOUND,
            ProxyErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UnknownRoute => "UNKNOWN_ROUTE",
            ProxyErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
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
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
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
}

fn full_body(body: impl Into<Bytes>) -> BoxBody<Bytes, hyper::Error> {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let mut response = Response::new(full_body(error.to_json()));
    *response.status_mut() = code.status_code();

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert("x-proxy-error", HeaderValue::from_static(code.as_header_value()));
    response
}

/// Body of the "accepted, come back later" response
#[derive(Debug, Serialize)]
struct WakingBody {
    status: String,
}

/// Message telling a client that `backend` is waking
pub fn waking_message(backend: &str, retry_after_secs: u64) -> String {
    format!("{} waking – retry in {} s", backend, retry_after_secs)
}

/// 202 Accepted for a request that arrived while its backend was not ready.
/// The request itself is not forwarded; the client must retry.
pub fn waking_response(backend: &str, retry_after_secs: u64) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = WakingBody {
        status: waking_message(backend, retry_after_secs),
    };
    let json = serde_json::to_string(&body).unwrap_or_else(|_| format!(r#"{{"status":"{}"}}"#, body.status));

    let mut response = Response::new(full_body(json));
    *response.status_mut() = StatusCode::ACCEPTED;

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_string(response: Response<BoxBody<Bytes, hyper::Error>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::UnknownRoute.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyErrorCode::MethodNotAllowed.status_code(),
            StatusCode::METHOD_NOT_ALLOWED
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
            ProxyErrorCode::InternalError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_header_value_matches_serialized_code() {
        let codes = [
            ProxyErrorCode::UnknownRoute,
            ProxyErrorCode::MethodNotAllowed,
            ProxyErrorCode::ConnectionFailed,
            ProxyErrorCode::RequestTimeout,
            ProxyErrorCode::InternalError,
        ];
        for code in codes {
            let serialized = serde_json::to_value(code).unwrap();
            assert_eq!(serialized, code.as_header_value());
            assert!(code.status_code().is_client_error() || code.status_code().is_server_error());
        }
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::UnknownRoute, "No backend for /docs");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UNKNOWN_ROUTE\""));
        assert!(json.contains("\"message\":\"No backend for /docs\""));
        assert!(json.contains("\"status\":404"));
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
    async fn test_waking_response() {
        let response = waking_response("chat", 2);

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "2");
        assert!(response.headers().get("X-Proxy-Error").is_none());

        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["status"], "chat waking – retry in 2 s");
    }
}
