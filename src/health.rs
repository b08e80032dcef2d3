//! Direct readiness probe against the backend
//!
//! A bare HTTP/1.1 GET over a fresh TCP connection with bounded connect and
//! read timeouts. Only the status line is inspected.

use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// Instantaneous readiness check, ground truth for the ready transition
pub trait ReadinessProbe: Send + Sync + 'static {
    fn check(&self) -> impl Future<Output = bool> + Send;
}

/// Status codes accepted on the first probe path
const ROOT_ACCEPTED: &[u16] = &[200, 301, 302, 303, 307, 308];

/// HTTP probe over the configured health paths
#[derive(Debug, Clone)]
pub struct HealthProbe {
    authority: String,
    paths: Vec<String>,
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(authority: impl Into<String>, paths: Vec<String>, timeout: Duration) -> Self {
        Self {
            authority: authority.into(),
            paths,
            timeout,
        }
    }

    /// Fetch the status code of `GET path`, or `None` on any network failure
    async fn fetch_status(&self, path: &str) -> Option<u16> {
        let connect_result =
            tokio::time::timeout(self.timeout, TcpStream::connect(&self.authority)).await;

        let mut stream = match connect_result {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                debug!(authority = %self.authority, error = %e, "Probe connect failed");
                return None;
            }
            Err(_) => {
                debug!(authority = %self.authority, "Probe connect timed out");
                return None;
            }
        };

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, self.authority
        );

        if stream.write_all(request.as_bytes()).await.is_err() {
            return None;
        }

        let read_result = tokio::time::timeout(self.timeout, async {
            let mut reader = BufReader::new(stream);
            let mut status_line = String::new();
            reader.read_line(&mut status_line).await?;
            Ok::<_, std::io::Error>(status_line)
        })
        .await;

        match read_result {
            // Format: "HTTP/1.1 200 OK\r\n"
            Ok(Ok(status_line)) => status_line
                .split_whitespace()
                .nth(1)
                .and_then(|code| code.parse::<u16>().ok()),
            _ => None,
        }
    }
}

impl ReadinessProbe for HealthProbe {
    async fn check(&self) -> bool {
        for (i, path) in self.paths.iter().enumerate() {
            let Some(code) = self.fetch_status(path).await else {
                continue;
            };
            // Redirects to a login page still mean the app is serving
            let accepted = if i == 0 {
                ROOT_ACCEPTED.contains(&code)
            } else {
                code == 200
            };
            debug!(path = %path, code, accepted, "Probe response");
            if accepted {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serve `status_for(path)` on every connection
    async fn spawn_backend(status_for: fn(&str) -> u16) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]);
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                let response = format!(
                    "HTTP/1.1 {} X\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status_for(&path)
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        addr
    }

    fn probe(addr: String) -> HealthProbe {
        HealthProbe::new(
            addr,
            vec!["/".to_string(), "/api/health".to_string()],
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn test_root_redirect_is_ready() {
        let addr = spawn_backend(|_| 302).await;
        assert!(probe(addr).check().await);
    }

    #[tokio::test]
    async fn test_falls_back_to_health_path() {
        let addr = spawn_backend(|path| if path == "/api/health" { 200 } else { 500 }).await;
        assert!(probe(addr).check().await);
    }

    #[tokio::test]
    async fn test_redirect_not_accepted_on_health_path() {
        let addr = spawn_backend(|path| if path == "/" { 503 } else { 302 }).await;
        assert!(!probe(addr).check().await);
    }

    #[tokio::test]
    async fn test_unreachable_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(!probe(addr).check().await);
    }
}
