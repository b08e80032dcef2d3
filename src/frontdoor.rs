//! Public listener: status API, interim page, setup page and proxying

use crate::config::Config;
use crate::error::{error_response, GatewayError};
use crate::marker::Marker;
use crate::pages::Pages;
use crate::proxy::{ForwardingProxy, ProxyBody};
use crate::state::{SharedState, StatusReport};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONTENT_TYPE, RETRY_AFTER};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const HTML: &str = "text/html; charset=utf-8";

/// One-time instructions page bookkeeping
pub struct SetupOnce {
    marker: Marker,
    /// Proxied in place of `GET /` while the instructions template is unreadable
    fallback: Option<Uri>,
    /// Set once the instructions page has been handed out by this process
    claimed: AtomicBool,
}

impl SetupOnce {
    pub fn new(marker: Marker) -> Self {
        Self {
            marker,
            fallback: None,
            claimed: AtomicBool::new(false),
        }
    }

    pub fn with_fallback(mut self, path: Uri) -> Self {
        self.fallback = Some(path);
        self
    }
}

enum SetupPage {
    Serve(String),
    /// Not yet shown, but no template to show
    Unavailable,
    Skip,
}

/// Shared per-request context
struct Gate {
    state: SharedState,
    proxy: ForwardingProxy,
    pages: Pages,
    status_path: String,
    setup: SetupOnce,
}

pub struct FrontDoor {
    bind_addr: SocketAddr,
    gate: Arc<Gate>,
    shutdown_rx: watch::Receiver<bool>,
}

impl FrontDoor {
    pub fn new(
        bind_addr: SocketAddr,
        state: SharedState,
        proxy: ForwardingProxy,
        pages: Pages,
        status_path: impl Into<String>,
        setup: SetupOnce,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            gate: Arc::new(Gate {
                state,
                proxy,
                pages,
                status_path: status_path.into(),
                setup,
            }),
            shutdown_rx,
        }
    }

    pub fn from_config(
        config: &Config,
        state: SharedState,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", config.server.bind, e))?;

        let pages = Pages::new(
            config.server.loading_page.as_ref().map(PathBuf::from),
            config.server.instructions_page.as_ref().map(PathBuf::from),
            config.server.status_path.clone(),
            config.backend.port,
        );

        let mut setup = SetupOnce::new(Marker::new(config.state.setup_marker_path()));
        if let Some(ref path) = config.server.setup_fallback_path {
            let uri: Uri = path
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid setup fallback path {}: {}", path, e))?;
            setup = setup.with_fallback(uri);
        }

        Ok(Self::new(
            bind_addr,
            state,
            ForwardingProxy::from_config(config),
            pages,
            config.server.status_path.clone(),
            setup,
            shutdown_rx,
        ))
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Front door listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gate = Arc::clone(&self.gate);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, gate).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Front door shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, gate: Arc<Gate>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gate = Arc::clone(&gate);
        async move { Ok::<_, hyper::Error>(handle_request(req, addr, &gate).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    client_addr: SocketAddr,
    gate: &Gate,
) -> Response<ProxyBody> {
    if req.uri().path() == gate.status_path {
        return status_response(&gate.state);
    }

    if !gate.state.is_ready() {
        if req.method() == Method::HEAD {
            return Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .header(CONTENT_TYPE, HTML)
                .header(RETRY_AFTER, "5")
                .body(full(Bytes::new()))
                .expect("valid response with static headers");
        }
        let html = gate.pages.loading_html().await;
        return html_response(html, "no-cache, no-store, must-revalidate");
    }

    if req.method() == Method::GET && req.uri().path() == "/" {
        match claim_setup_page(gate).await {
            SetupPage::Serve(page) => return html_response(page, "no-store"),
            SetupPage::Unavailable => {
                if let Some(ref fallback) = gate.setup.fallback {
                    debug!(path = %fallback, "Instructions template unavailable, proxying fallback");
                    *req.uri_mut() = fallback.clone();
                }
            }
            SetupPage::Skip => {}
        }
    }

    gate.proxy.forward(req, client_addr).await
}

/// Instructions page for the first root request after readiness, at most once
async fn claim_setup_page(gate: &Gate) -> SetupPage {
    let setup = &gate.setup;
    if setup.claimed.load(Ordering::Acquire) || setup.marker.exists().await {
        return SetupPage::Skip;
    }
    let Some(page) = gate.pages.instructions_html().await else {
        return SetupPage::Unavailable;
    };
    if setup.claimed.swap(true, Ordering::AcqRel) {
        return SetupPage::Skip;
    }

    if let Err(e) = setup.marker.create().await {
        warn!(path = %setup.marker.path().display(), error = %e, "Failed to write setup marker");
    }
    info!("Serving one-time instructions page");
    SetupPage::Serve(page)
}

fn status_response(state: &SharedState) -> Response<ProxyBody> {
    let report = StatusReport::from(state.snapshot());
    match serde_json::to_vec(&report) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/json")
            .header(CACHE_CONTROL, "no-cache")
            .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .body(full(Bytes::from(body)))
            .expect("valid response with static headers"),
        Err(e) => error_response(
            GatewayError::Internal,
            format!("Failed to encode status: {}", e),
        ),
    }
}

fn html_response(html: String, cache_control: &'static str) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, HTML)
        .header(CACHE_CONTROL, cache_control)
        .body(full(Bytes::from(html)))
        .expect("valid response with static headers")
}

fn full(body: Bytes) -> ProxyBody {
    Full::new(body).map_err(|never| match never {}).boxed()
}
