//! Interim and one-time setup pages

use std::path::PathBuf;
use tracing::debug;

/// Placeholder in the instructions template replaced with the backend port
const INTERNAL_PORT_PLACEHOLDER: &str = "{{INTERNAL_PORT}}";

/// Placeholder in the built-in page replaced with the status API path
const STATUS_PATH_PLACEHOLDER: &str = "{{STATUS_PATH}}";

/// Built-in interim page, used when no template is configured or readable
const FALLBACK_LOADING_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Starting...</title>
    <style>
        body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; background: #0f172a; color: #e2e8f0; display: flex; align-items: center; justify-content: center; min-height: 100vh; margin: 0; }
        .card { width: 420px; max-width: 90vw; }
        h1 { font-size: 1.25rem; margin: 0 0 0.5rem; }
        .detail { color: #94a3b8; font-size: 0.875rem; min-height: 1.2em; }
        .bar { height: 8px; background: #1e293b; border-radius: 4px; overflow: hidden; margin: 1rem 0; }
        .fill { height: 100%; width: 0; background: #3b82f6; transition: width 0.5s ease; }
    </style>
</head>
<body>
    <div class="card">
        <h1 id="message">Starting...</h1>
        <div class="bar"><div class="fill" id="fill"></div></div>
        <div class="detail" id="detail"></div>
    </div>
    <script>
        function poll() {
            fetch('{{STATUS_PATH}}', { cache: 'no-store' })
                .then(function(r) { return r.json(); })
                .then(function(s) {
                    document.getElementById('message').textContent = s.message || 'Starting...';
                    document.getElementById('detail').textContent = s.detail || '';
                    document.getElementById('fill').style.width = (s.progress || 0) + '%';
                    if (s.panel_ready) {
                        window.location.reload();
                        return;
                    }
                    setTimeout(poll, 1500);
                })
                .catch(function() { setTimeout(poll, 1500); });
        }
        poll();
    </script>
</body>
</html>
"##;

#[derive(Debug, Clone)]
pub struct Pages {
    loading_page: Option<PathBuf>,
    instructions_page: Option<PathBuf>,
    status_path: String,
    backend_port: u16,
}

impl Pages {
    pub fn new(
        loading_page: Option<PathBuf>,
        instructions_page: Option<PathBuf>,
        status_path: impl Into<String>,
        backend_port: u16,
    ) -> Self {
        Self {
            loading_page,
            instructions_page,
            status_path: status_path.into(),
            backend_port,
        }
    }

    /// Interim page HTML: the configured template or the built-in page
    pub async fn loading_html(&self) -> String {
        if let Some(ref path) = self.loading_page {
            match tokio::fs::read_to_string(path).await {
                Ok(html) => return html,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Loading page unreadable, using built-in page")
                }
            }
        }
        FALLBACK_LOADING_HTML.replace(STATUS_PATH_PLACEHOLDER, &self.status_path)
    }

    /// Instructions page HTML, or `None` when no template is available
    pub async fn instructions_html(&self) -> Option<String> {
        let path = self.instructions_page.as_ref()?;
        match tokio::fs::read_to_string(path).await {
            Ok(html) => {
                Some(html.replace(INTERNAL_PORT_PLACEHOLDER, &self.backend_port.to_string()))
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Instructions page unreadable");
                None
            }
        }
    }
}
