//! Gateway errors returned to clients as JSON

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Header carrying the machine-readable error kind
pub const X_GATEWAY_ERROR: &str = "x-gateway-error";

/// Why the front door answered instead of the backend
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GatewayError {
    /// No response head within the request timeout
    BackendTimeout,
    /// Connection refused, reset or otherwise broken
    BackendUnreachable,
    Internal,
}

impl GatewayError {
    pub fn status_code(self) -> StatusCode {
        match self {
            GatewayError::BackendTimeout | GatewayError::BackendUnreachable => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GatewayError::BackendTimeout => "backend_timeout",
            GatewayError::BackendUnreachable => "backend_unreachable",
            GatewayError::Internal => "internal",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: GatewayError,
    message: &'a str,
    status: u16,
}

/// Render the JSON body for an error
pub fn error_json(kind: GatewayError, message: &str) -> String {
    let body = ErrorBody {
        error: kind,
        message,
        status: kind.status_code().as_u16(),
    };
    serde_json::to_string(&body).unwrap_or_default()
}

/// Build a JSON error response tagged with [`X_GATEWAY_ERROR`]
pub fn error_response(
    kind: GatewayError,
    message: impl AsRef<str>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = error_json(kind, message.as_ref());

    Response::builder()
        .status(kind.status_code())
        .header(CONTENT_TYPE, "application/json")
        .header(CACHE_CONTROL, "no-store")
        .header(X_GATEWAY_ERROR, kind.as_str())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_failures_are_bad_gateway() {
        assert_eq!(GatewayError::BackendTimeout.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(GatewayError::BackendUnreachable.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            GatewayError::Internal.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_json_escapes_message() {
        let json = error_json(GatewayError::BackendUnreachable, "refused \"127.0.0.1\"");
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["error"], "backend_unreachable");
        assert_eq!(value["message"], "refused \"127.0.0.1\"");
        assert_eq!(value["status"], 502);
    }

    #[test]
    fn test_error_response_headers() {
        let response = error_response(GatewayError::BackendTimeout, "timed out");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(response.headers().get(CACHE_CONTROL).unwrap(), "no-store");
        assert_eq!(
            response.headers().get(X_GATEWAY_ERROR).unwrap(),
            "backend_timeout"
        );
    }
}
