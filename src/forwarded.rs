//! Forwarded-header derivation for proxied requests

use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use std::net::IpAddr;
use tracing::debug;

pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_PORT: HeaderName = HeaderName::from_static("x-forwarded-port");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");

/// Externally visible origin the backend believes it is served from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicOrigin {
    pub proto: String,
    pub host: String,
    pub port: u16,
}

impl PublicOrigin {
    /// Parse `scheme://host[:port][/path]`. A missing scheme means http.
    pub fn parse(url: &str) -> Option<Self> {
        let url = url.trim().trim_matches(|c: char| c == '"' || c == '\'');
        let (proto, rest) = url.split_once("://").unwrap_or(("http", url));
        let authority = rest.split('/').next().unwrap_or_default();
        if authority.is_empty() {
            return None;
        }

        let default_port = if proto.eq_ignore_ascii_case("https") {
            443
        } else {
            80
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host, port),
                Err(_) => (authority, default_port),
            },
            None => (authority, default_port),
        };

        Some(Self {
            proto: proto.to_ascii_lowercase(),
            host: host.to_string(),
            port,
        })
    }
}

/// Find the `APP_URL=` entry of an env file
pub fn find_app_url(env_text: &str) -> Option<PublicOrigin> {
    env_text
        .lines()
        .find_map(|line| line.strip_prefix("APP_URL="))
        .and_then(PublicOrigin::parse)
}

/// First `APP_URL` found in the given env files
pub async fn discover_app_url(files: &[String]) -> Option<PublicOrigin> {
    for file in files {
        match tokio::fs::read_to_string(file).await {
            Ok(text) => {
                if let Some(origin) = find_app_url(&text) {
                    return Some(origin);
                }
            }
            Err(e) => debug!(file = %file, error = %e, "Env file not readable"),
        }
    }
    None
}

/// Values for the X-Forwarded-Host/Port/Proto triple
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forwarded {
    pub host: String,
    pub port: String,
    pub proto: String,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Pass through a trusted upstream's values, else use the backend's
/// published origin, else the inbound Host header.
pub fn derive_forwarded(
    headers: &HeaderMap,
    app_url: Option<&PublicOrigin>,
    listen_port: u16,
) -> Forwarded {
    if let Some(host) = header_str(headers, &X_FORWARDED_HOST) {
        return Forwarded {
            host: host.to_string(),
            port: header_str(headers, &X_FORWARDED_PORT)
                .map(str::to_string)
                .unwrap_or_else(|| listen_port.to_string()),
            proto: header_str(headers, &X_FORWARDED_PROTO)
                .unwrap_or("http")
                .to_string(),
        };
    }

    if let Some(origin) = app_url {
        return Forwarded {
            host: origin.host.clone(),
            port: origin.port.to_string(),
            proto: origin.proto.clone(),
        };
    }

    let host = header_str(headers, &HOST)
        .map(|h| h.split(':').next().unwrap_or(h))
        .unwrap_or("localhost");
    Forwarded {
        host: host.to_string(),
        port: listen_port.to_string(),
        proto: "http".to_string(),
    }
}

/// Write the forwarded and client-address headers onto an outbound request
pub fn apply_forwarded(headers: &mut HeaderMap, forwarded: &Forwarded, client_ip: IpAddr) {
    for (name, value) in [
        (X_FORWARDED_HOST, &forwarded.host),
        (X_FORWARDED_PORT, &forwarded.port),
        (X_FORWARDED_PROTO, &forwarded.proto),
    ] {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    }

    let client = client_ip.to_string();
    for name in [X_FORWARDED_FOR, X_REAL_IP] {
        if !headers.contains_key(&name) {
            if let Ok(value) = HeaderValue::from_str(&client) {
                headers.insert(name, value);
            }
        }
    }
}
