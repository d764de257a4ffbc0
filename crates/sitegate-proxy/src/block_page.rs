//! Block page rendering.
//!
//! Blocked plain-HTTP requests get a `200 OK` page instead of an error so
//! browsers show it rather than their own error screen. Clients that prefer
//! JSON get a small JSON document instead.

use chrono::{DateTime, Local, Utc};
use hyper::header::{HeaderValue, ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use hyper::{HeaderMap, Response, StatusCode};
use serde::Serialize;

use crate::body::{full, ProxyBody};

/// Header set on every response produced by a block.
pub const BLOCKED_HEADER: &str = "X-SiteGate-Blocked";

/// Block page HTML template.
const BLOCK_PAGE_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Blocked by SiteGate</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            min-height: 100vh;
            margin: 0;
            background: #1f2933;
            color: #f5f7fa;
        }
        .container {
            text-align: center;
            padding: 2rem;
            max-width: 560px;
        }
        h1 {
            margin: 0 0 1rem 0;
            font-size: 2rem;
        }
        .details {
            background: rgba(255,255,255,0.08);
            padding: 1rem;
            border-radius: 8px;
            margin-top: 1rem;
            text-align: left;
            word-break: break-all;
        }
        .details p {
            margin: 0.4rem 0;
        }
    </style>
</head>
<body>
    <div class="container">
        <h1>Site Blocked</h1>
        <p>Access to this site is restricted by SiteGate.</p>
        <div class="details">
            <p><strong>Domain:</strong> {{DOMAIN}}</p>
            <p><strong>URL:</strong> {{URL}}</p>
            <p><strong>Time:</strong> {{TIME}}</p>
        </div>
    </div>
</body>
</html>"#;

/// What the block page reports.
#[derive(Debug, Clone)]
pub struct BlockInfo<'a> {
    pub domain: &'a str,
    pub url: &'a str,
    pub rule_id: Option<&'a str>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct BlockJson<'a> {
    blocked: bool,
    domain: &'a str,
    url: &'a str,
    rule_id: Option<&'a str>,
    timestamp: String,
}

/// Renders the HTML block page.
pub fn render_html(info: &BlockInfo<'_>) -> String {
    let local: DateTime<Local> = info.timestamp.with_timezone(&Local);
    BLOCK_PAGE_HTML
        .replace("{{DOMAIN}}", &escape_html(info.domain))
        .replace("{{URL}}", &escape_html(info.url))
        .replace("{{TIME}}", &escape_html(&local.format("%Y-%m-%d %H:%M:%S").to_string()))
}

/// Renders the JSON block document.
pub fn render_json(info: &BlockInfo<'_>) -> serde_json::Result<String> {
    serde_json::to_string(&BlockJson {
        blocked: true,
        domain: info.domain,
        url: info.url,
        rule_id: info.rule_id,
        timestamp: info.timestamp.to_rfc3339(),
    })
}

/// Builds the block response, choosing HTML or JSON from the `Accept` header.
pub fn block_response(request_headers: &HeaderMap, info: &BlockInfo<'_>) -> Response<ProxyBody> {
    let (content_type, body) = if prefers_json(request_headers) {
        match render_json(info) {
            Ok(json) => ("application/json", json),
            Err(e) => {
                tracing::warn!("Failed to render JSON block page: {}", e);
                ("text/html; charset=utf-8", render_html(info))
            }
        }
    } else {
        ("text/html; charset=utf-8", render_html(info))
    };

    let mut response = Response::new(full(body));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(BLOCKED_HEADER, HeaderValue::from_static("true"));
    response
}

/// Plain-text `403 Forbidden` used when a tunnel is refused.
pub fn forbidden_response(domain: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full(format!("Access to {} is blocked by SiteGate\n", domain)));
    *response.status_mut() = StatusCode::FORBIDDEN;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(BLOCKED_HEADER, HeaderValue::from_static("true"));
    response
}

/// Returns true when the client ranks `application/json` above `text/html`.
pub fn prefers_json(headers: &HeaderMap) -> bool {
    let Some(accept) = headers.get(ACCEPT).and_then(|v| v.to_str().ok()) else {
        return false;
    };

    let mut json_q: Option<f32> = None;
    let mut html_q: Option<f32> = None;

    for item in accept.split(',') {
        let mut parts = item.split(';');
        let media = parts.next().unwrap_or("").trim().to_ascii_lowercase();
        let q = parts
            .filter_map(|p| p.trim().strip_prefix("q="))
            .find_map(|v| v.trim().parse::<f32>().ok())
            .unwrap_or(1.0);

        match media.as_str() {
            "application/json" => json_q = Some(json_q.map_or(q, |old| old.max(q))),
            "text/html" => html_q = Some(html_q.map_or(q, |old| old.max(q))),
            _ => {}
        }
    }

    match (json_q, html_q) {
        (Some(json), Some(html)) => json > 0.0 && json > html,
        (Some(json), None) => json > 0.0,
        _ => false,
    }
}

/// Escapes text for inclusion in HTML.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use http_body_util::BodyExt;

    fn info<'a>(domain: &'a str, url: &'a str) -> BlockInfo<'a> {
        BlockInfo {
            domain,
            url,
            rule_id: Some("social"),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 4, 12, 30, 0).unwrap(),
        }
    }

    async fn body_string(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn block_page_has_placeholders() {
        assert!(BLOCK_PAGE_HTML.contains("{{DOMAIN}}"));
        assert!(BLOCK_PAGE_HTML.contains("{{URL}}"));
        assert!(BLOCK_PAGE_HTML.contains("{{TIME}}"));
    }

    #[test]
    fn html_escapes_domain_and_url() {
        let html = render_html(&info("evil<script>.test", "http://x.test/?a=1&b=\"2\""));

        assert!(html.contains("evil&lt;script&gt;.test"));
        assert!(html.contains("a=1&amp;b=&quot;2&quot;"));
        assert!(!html.contains("<script>"));
        assert!(!html.contains("{{"));
    }

    #[test]
    fn escape_html_passes_plain_text() {
        assert_eq!(escape_html("social.example"), "social.example");
        assert_eq!(escape_html("'"), "&#39;");
    }

    #[test]
    fn json_document_fields() {
        let json = render_json(&info("social.example", "http://social.example/")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["blocked"], true);
        assert_eq!(value["domain"], "social.example");
        assert_eq!(value["url"], "http://social.example/");
        assert_eq!(value["rule_id"], "social");
        assert!(value["timestamp"].as_str().unwrap().starts_with("2024-03-04T12:30:00"));
    }

    #[test]
    fn accept_negotiation() {
        let mut headers = HeaderMap::new();
        assert!(!prefers_json(&headers));

        headers.insert(ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml,*/*;q=0.8"));
        assert!(!prefers_json(&headers));

        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        assert!(prefers_json(&headers));

        headers.insert(ACCEPT, HeaderValue::from_static("text/html;q=0.5, application/json"));
        assert!(prefers_json(&headers));

        headers.insert(ACCEPT, HeaderValue::from_static("application/json;q=0"));
        assert!(!prefers_json(&headers));
    }

    #[tokio::test]
    async fn block_response_status_and_headers() {
        let response = block_response(&HeaderMap::new(), &info("social.example", "http://social.example/"));

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/html; charset=utf-8");
        assert_eq!(response.headers().get(BLOCKED_HEADER).unwrap(), "true");
        assert!(body_string(response).await.contains("social.example"));
    }

    #[tokio::test]
    async fn json_block_response() {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let response = block_response(&headers, &info("social.example", "http://social.example/"));
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "application/json");
        assert!(body_string(response).await.contains("\"blocked\":true"));
    }

    #[tokio::test]
    async fn forbidden_response_is_403() {
        let response = forbidden_response("social.example");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(body_string(response).await.contains("social.example"));
    }
}
