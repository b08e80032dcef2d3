//! Forwarding proxy to the ready backend

use crate::config::Config;
use crate::error::{error_response, GatewayError};
use crate::forwarded::{apply_forwarded, derive_forwarded, discover_app_url, X_FORWARDED_HOST};
use crate::pool::{ConnectionPool, PoolConfig, PoolError};
use crate::rewrite::{is_html, rewrite_html};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    HeaderMap, HeaderValue, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST,
};
use hyper::{Method, Request, Response};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Headers that only describe a single connection
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Remove hop-by-hop headers, including any listed in `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    for name in &listed {
        headers.remove(name.as_str());
    }
}

fn is_identity_encoded(headers: &HeaderMap) -> bool {
    match headers.get(CONTENT_ENCODING).and_then(|v| v.to_str().ok()) {
        None => true,
        Some(enc) => enc.trim().eq_ignore_ascii_case("identity"),
    }
}

pub struct ForwardingProxy {
    pool: ConnectionPool,
    listen_port: u16,
    app_env_files: Vec<String>,
    body_timeout: Duration,
}

impl ForwardingProxy {
    pub fn new(pool: ConnectionPool, listen_port: u16, app_env_files: Vec<String>) -> Self {
        let body_timeout = pool.config().request_timeout;
        Self {
            pool,
            listen_port,
            app_env_files,
            body_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let pool = ConnectionPool::new(
            config.backend.authority(),
            PoolConfig::for_backend(&config.backend),
        );
        Self::new(pool, config.server.port, config.backend.app_env_files.clone())
    }

    /// Forward a request to the backend and relay its response.
    ///
    /// Redirects are returned as-is. Network failures become a 502 JSON error.
    pub async fn forward(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Response<ProxyBody> {
        // Generate or propagate request ID
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // HTTP/2 carries the host in the :authority pseudo-header
        if !req.headers().contains_key(HOST) {
            if let Some(value) = req
                .uri()
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            {
                req.headers_mut().insert(HOST, value);
            }
        }

        let app_url = if req.headers().contains_key(X_FORWARDED_HOST) {
            None
        } else {
            discover_app_url(&self.app_env_files).await
        };
        let forwarded = derive_forwarded(req.headers(), app_url.as_ref(), self.listen_port);

        let is_head = req.method() == Method::HEAD;
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let headers = req.headers_mut();
        strip_hop_by_hop(headers);
        apply_forwarded(headers, &forwarded, client_addr.ip());
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(self.pool.authority()) {
            headers.insert(HOST, value);
        }

        debug!(method = %method, path = %path, request_id, "Forwarding request");

        let response = match self.pool.send_request(req).await {
            Ok(response) => response,
            Err(PoolError::Timeout(timeout)) => {
                warn!(path = %path, timeout_secs = timeout.as_secs(), "Backend request timed out");
                return error_response(
                    GatewayError::BackendTimeout,
                    format!("Proxy error: timed out after {} seconds", timeout.as_secs()),
                );
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to forward request");
                return error_response(
                    GatewayError::BackendUnreachable,
                    format!("Proxy error: {}", e),
                );
            }
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        debug!(status = %parts.status, path = %path, request_id, "Backend responded");

        if is_head {
            return Response::from_parts(parts, Empty::<Bytes>::new().map_err(|e| match e {}).boxed());
        }

        let content_type = parts.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
        if !is_html(content_type) || !is_identity_encoded(&parts.headers) {
            return Response::from_parts(parts, body.boxed());
        }

        let collected = match tokio::time::timeout(self.body_timeout, body.collect()).await {
            Ok(Ok(collected)) => collected.to_bytes(),
            Ok(Err(e)) => {
                warn!(path = %path, error = %e, "Failed to read backend response body");
                return error_response(
                    GatewayError::BackendUnreachable,
                    format!("Proxy error: {}", e),
                );
            }
            Err(_) => {
                warn!(path = %path, "Timed out reading backend response body");
                return error_response(
                    GatewayError::BackendTimeout,
                    "Proxy error: timed out reading response body",
                );
            }
        };

        let rewritten = rewrite_html(&collected);
        parts
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
        Response::from_parts(
            parts,
            Full::new(Bytes::from(rewritten)).map_err(|e| match e {}).boxed(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, X-Custom-Hop"));
        headers.insert("x-custom-hop", HeaderValue::from_static("1"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(CONTENT_TYPE));
    }

    #[test]
    fn test_identity_encoding() {
        let mut headers = HeaderMap::new();
        assert!(is_identity_encoded(&headers));

        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("identity"));
        assert!(is_identity_encoded(&headers));

        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        assert!(!is_identity_encoded(&headers));
    }
}
