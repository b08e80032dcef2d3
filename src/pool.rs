//! Pooled HTTP client for the backend
//!
//! The legacy hyper-util client never follows redirects, so 3xx responses
//! reach the caller untouched.

use crate::config::BackendConfig;
use hyper::body::Incoming;
use hyper::http::uri::{InvalidUri, Uri};
use hyper::{Request, Response, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("{0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("invalid backend uri: {0}")]
    Uri(#[from] InvalidUri),

    #[error("backend did not respond within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
    /// Upper bound for receiving the response head
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn for_backend(backend: &BackendConfig) -> Self {
        Self {
            request_timeout: backend.request_timeout(),
            ..Self::default()
        }
    }
}

/// Keep-alive connections to the backend's internal origin
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    authority: String,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(authority: impl Into<String>, config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        Self {
            client,
            authority: authority.into(),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// `host:port` of the backend
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Backend URI for the path and query of an inbound URI
    pub fn backend_uri(&self, inbound: &Uri) -> Result<Uri, InvalidUri> {
        let path = inbound.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        format!("http://{}{}", self.authority, path).parse()
    }

    /// Send a request with its method, headers and body intact, retargeted
    /// at the backend origin over HTTP/1.1 whatever the inbound version.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Incoming>, PoolError> {
        let (mut parts, body) = req.into_parts();
        parts.uri = self.backend_uri(&parts.uri)?;
        parts.version = Version::HTTP_11;

        let timeout = self.config.request_timeout;
        match tokio::time::timeout(timeout, self.client.request(Request::from_parts(parts, body)))
            .await
        {
            Ok(result) => Ok(result?),
            Err(_) => {
                debug!(
                    authority = %self.authority,
                    timeout_secs = timeout.as_secs(),
                    "Backend request timed out"
                );
                Err(PoolError::Timeout(timeout))
            }
        }
    }
}
