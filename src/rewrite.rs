//! HTML response rewriting for sub-path and iframe embedding
//!
//! The backend renders absolute links to its own loopback origin. Those are
//! turned into root-relative paths, and a small script is injected that
//! keeps client-side navigation relative to the document.

use regex::bytes::Regex;
use std::sync::LazyLock;

/// Absolute URLs pointing at the backend's own loopback origin, any port
static LOOPBACK_ORIGIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://(?:127\.0\.0\.1|localhost)(?::\d+)?/").unwrap());

static HEAD_CLOSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)</head>").unwrap());

/// Attribute identifying an already injected patch
pub const PATCH_MARKER: &str = "data-warmgate-patch";

/// Rewrites root-relative fetch, XHR and location targets to document-relative ones
pub const CLIENT_PATCH: &str = r##"<script data-warmgate-patch>
(function(){
    'use strict';
    function rel(url){
        return (typeof url === 'string' && url.charAt(0) === '/' && url.charAt(1) !== '/') ? '.' + url : url;
    }

    var originalFetch = window.fetch;
    if(originalFetch){
        window.fetch = function(input, init){
            return originalFetch.call(this, rel(input), init);
        };
    }

    var originalOpen = XMLHttpRequest.prototype.open;
    XMLHttpRequest.prototype.open = function(method, url){
        arguments[1] = rel(url);
        return originalOpen.apply(this, arguments);
    };

    var href = Object.getOwnPropertyDescriptor(window.location.__proto__, 'href');
    if(href && href.set){
        try {
            Object.defineProperty(window.location, 'href', {
                set: function(url){ return href.set.call(this, rel(url)); },
                get: href.get
            });
        } catch(e) {}
    }
})();
</script>
"##;

/// Whether a Content-Type names an HTML document
pub fn is_html(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.to_ascii_lowercase().contains("text/html"))
        .unwrap_or(false)
}

/// Rewrite loopback URLs to root-relative and inject the client patch once
/// before the first closing head tag.
pub fn rewrite_html(body: &[u8]) -> Vec<u8> {
    let rewritten = LOOPBACK_ORIGIN.replace_all(body, &b"/"[..]);

    let already_patched = rewritten
        .windows(PATCH_MARKER.len())
        .any(|w| w == PATCH_MARKER.as_bytes());
    let head_close = if already_patched {
        None
    } else {
        HEAD_CLOSE.find(&rewritten).map(|m| m.start())
    };

    match head_close {
        Some(pos) => {
            let mut out = Vec::with_capacity(rewritten.len() + CLIENT_PATCH.len());
            out.extend_from_slice(&rewritten[..pos]);
            out.extend_from_slice(CLIENT_PATCH.as_bytes());
            out.extend_from_slice(&rewritten[pos..]);
            out
        }
        None => rewritten.into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(haystack: &[u8], needle: &str) -> usize {
        haystack
            .windows(needle.len())
            .filter(|w| *w == needle.as_bytes())
            .count()
    }

    #[test]
    fn test_rewrites_and_injects_once() {
        let html = b"<html><head><title>x</title></head><body>\
            <a href=\"http://127.0.0.1:9999/dashboard\">a</a>\
            <a href=\"http://127.0.0.1:9999/dashboard\">b</a></body></html>";
        let out = rewrite_html(html);
        let text = String::from_utf8(out.clone()).unwrap();

        assert_eq!(count(&out, "href=\"/dashboard\""), 2);
        assert!(!text.contains("127.0.0.1"));
        assert_eq!(count(&out, PATCH_MARKER), 1);

        let patch_end = text.find("</script>\n</head>");
        assert!(patch_end.is_some(), "patch sits right before </head>");
    }

    #[test]
    fn test_second_pass_does_not_reinject() {
        let html = b"<head></head><body>http://localhost/x</body>";
        let once = rewrite_html(html);
        let twice = rewrite_html(&once);
        assert_eq!(once, twice);
        assert_eq!(count(&twice, PATCH_MARKER), 1);
    }

    #[test]
    fn test_only_first_head_close_is_used() {
        let html = b"<head></head><template><head></head></template>";
        let out = rewrite_html(html);
        assert_eq!(count(&out, PATCH_MARKER), 1);
    }

    #[test]
    fn test_no_head_means_no_injection() {
        let out = rewrite_html(b"<p>https://localhost:8443/a</p>");
        assert_eq!(out, b"<p>/a</p>");
    }

    #[test]
    fn test_other_hosts_untouched() {
        let html = b"<a href=\"https://example.com/x\">x</a>";
        assert_eq!(rewrite_html(html), html.to_vec());
    }

    #[test]
    fn test_is_html() {
        assert!(is_html(Some("text/html; charset=UTF-8")));
        assert!(is_html(Some("TEXT/HTML")));
        assert!(!is_html(Some("application/json")));
        assert!(!is_html(None));
    }
}
