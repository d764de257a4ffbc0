//! Request handling for the forward proxy.
//!
//! Every request is decided before any upstream I/O happens:
//!
//! ```text
//! Request → resolve user → decide(url, user)
//!                              │
//!          ┌───────────────────┼────────────────────┐
//!          │ Allow             │ Block              │ Redirect
//!          ▼                   ▼                    ▼
//!   HTTP: forward         HTTP: block page      HTTP: 302 Location
//!   CONNECT: tunnel       CONNECT: 403          CONNECT: 403
//! ```

use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1 as client_http1;
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderValue, CONNECTION, HOST, LOCATION};
use hyper::http::uri::{Authority, Uri};
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Version};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use sitegate_core::{
    normalize, Decision, InterceptEvent, InterceptRecord, Protocol, RuleAction, RuleEngine,
};

use crate::block_page::{block_response, forbidden_response, BlockInfo};
use crate::body::{empty, status_response, ProxyBody};
use crate::intercepts::{InterceptSender, Observers};
use crate::lifecycle::{ConnectionTracker, ShutdownRx};
use crate::tunnel::relay;
use crate::user::UserResolver;

/// Awaits an upstream connect, mapping failure to 502 and timeout to 504.
async fn connect_within<F>(
    target: &str,
    timeout: Duration,
    connect: F,
) -> Result<TcpStream, Response<ProxyBody>>
where
    F: Future<Output = std::io::Result<TcpStream>>,
{
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => {
            warn!("Failed to connect to {}: {}", target, e);
            Err(status_response(StatusCode::BAD_GATEWAY, "Could not reach upstream host"))
        }
        Err(_) => {
            warn!("Timed out connecting to {} after {:?}", target, timeout);
            Err(status_response(StatusCode::GATEWAY_TIMEOUT, "Upstream connect timed out"))
        }
    }
}

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
];

/// Everything a connection task needs to answer requests.
pub(crate) struct ProxyHandler {
    pub rule_engine: Arc<RuleEngine>,
    pub user_resolver: Arc<dyn UserResolver>,
    pub observers: Observers,
    pub intercepts: InterceptSender,
    pub listen_addr: SocketAddr,
    pub connect_timeout: Duration,
    pub tunnel_idle_timeout: Duration,
    pub shutdown: ShutdownRx,
    pub tracker: Arc<ConnectionTracker>,
}

/// Where a plain HTTP request is going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpTarget {
    /// Host without IPv6 brackets.
    pub host: String,
    pub port: u16,
    /// `host[:port]` as the client wrote it.
    pub authority: String,
    /// Absolute URL used for matching and reporting.
    pub url: String,
}

impl ProxyHandler {
    /// Answers one request from `peer`.
    pub async fn handle(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        let user_id = self.user_resolver.resolve(peer, req.headers());

        if req.method() == Method::CONNECT {
            self.handle_connect(req, user_id).await
        } else {
            self.handle_http(req, user_id).await
        }
    }

    /// Convenience for hyper's `service_fn`.
    pub async fn serve(
        self: Arc<Self>,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> std::result::Result<Response<ProxyBody>, Infallible> {
        Ok(self.handle(req, peer).await)
    }

    async fn handle_http(&self, req: Request<Incoming>, user_id: Option<String>) -> Response<ProxyBody> {
        let Some(target) = http_target(req.uri(), req.headers()) else {
            debug!("Rejecting request without a usable http target: {}", req.uri());
            return status_response(
                StatusCode::BAD_REQUEST,
                "Proxy requests need an absolute http:// URI or a Host header",
            );
        };

        if self.targets_self(&target.host, target.port) {
            warn!("Refusing request that loops back to the proxy: {}", target.url);
            return status_response(StatusCode::LOOP_DETECTED, "Request loops back to the proxy");
        }

        let decision = self.rule_engine.decide_now(&target.url, user_id.as_deref());
        debug!(
            url = %target.url,
            action = decision.action.name(),
            rule = decision.matched_rule_id().unwrap_or("-"),
            "HTTP decision"
        );

        match decision.action {
            RuleAction::Allow => self.forward(req, target).await,
            RuleAction::Block => {
                let domain = normalize(&target.url);
                let timestamp =
                    self.record_block(Protocol::Http, &domain, &target.url, &decision, user_id);
                let info = BlockInfo {
                    domain: &domain,
                    url: &target.url,
                    rule_id: decision.matched_rule_id(),
                    timestamp,
                };
                block_response(req.headers(), &info)
            }
            RuleAction::Redirect => redirect_response(decision.redirect_target.as_deref()),
        }
    }

    async fn handle_connect(&self, req: Request<Incoming>, user_id: Option<String>) -> Response<ProxyBody> {
        let Some(authority) = req.uri().authority().cloned() else {
            debug!("Rejecting CONNECT without authority: {}", req.uri());
            return status_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
        };

        let host = strip_brackets(authority.host()).to_string();
        let port = authority.port_u16().unwrap_or(443);
        let target = format!("{}:{}", authority.host(), port);
        let domain = normalize(&target);

        if self.targets_self(&host, port) {
            warn!("Refusing CONNECT that loops back to the proxy: {}", target);
            return status_response(StatusCode::LOOP_DETECTED, "Request loops back to the proxy");
        }

        let decision = self.rule_engine.decide_now(&target, user_id.as_deref());
        debug!(
            target = %target,
            action = decision.action.name(),
            rule = decision.matched_rule_id().unwrap_or("-"),
            "CONNECT decision"
        );

        // A tunnel cannot be redirected, so anything but allow refuses it.
        if !decision.should_allow() {
            self.record_block(Protocol::Https, &domain, &target, &decision, user_id);
            return forbidden_response(&domain);
        }

        let upstream = match self.connect_upstream(&host, port).await {
            Ok(stream) => stream,
            Err(response) => return response,
        };

        let guard = self.tracker.enter();
        let shutdown = self.shutdown.clone();
        let idle_timeout = self.tunnel_idle_timeout;

        tokio::spawn(async move {
            let _guard = guard;
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    match relay(TokioIo::new(upgraded), upstream, idle_timeout, shutdown).await {
                        Ok(stats) => debug!(
                            target = %target,
                            sent = stats.client_to_server,
                            received = stats.server_to_client,
                            "Tunnel closed"
                        ),
                        Err(e) => debug!(target = %target, "Tunnel ended with error: {}", e),
                    }
                }
                Err(e) => warn!(target = %target, "CONNECT upgrade failed: {}", e),
            }
        });

        let mut response = Response::new(empty());
        response
            .extensions_mut()
            .insert(ReasonPhrase::from_static(b"Connection Established"));
        response
    }

    /// Forwards an allowed plain HTTP request and relays the response.
    async fn forward(&self, req: Request<Incoming>, target: HttpTarget) -> Response<ProxyBody> {
        let stream = match self.connect_upstream(&target.host, target.port).await {
            Ok(stream) => stream,
            Err(response) => return response,
        };

        let mut builder = client_http1::Builder::new();
        builder.preserve_header_case(true).title_case_headers(true);

        let (mut sender, conn) = match builder.handshake(TokioIo::new(stream)).await {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Upstream handshake with {} failed: {}", target.authority, e);
                return status_response(StatusCode::BAD_GATEWAY, "Upstream handshake failed");
            }
        };

        let authority = target.authority.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Upstream connection to {} closed: {}", authority, e);
            }
        });

        let outgoing = match origin_form_request(req, &target) {
            Ok(outgoing) => outgoing,
            Err(e) => {
                debug!("Cannot rewrite request for {}: {}", target.url, e);
                return status_response(StatusCode::BAD_REQUEST, "Malformed request");
            }
        };

        match sender.send_request(outgoing).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, body.boxed())
            }
            Err(e) => {
                warn!("Upstream request to {} failed: {}", target.url, e);
                status_response(StatusCode::BAD_GATEWAY, "Upstream request failed")
            }
        }
    }

    async fn connect_upstream(&self, host: &str, port: u16) -> Result<TcpStream, Response<ProxyBody>> {
        let target = format!("{}:{}", host, port);
        connect_within(&target, self.connect_timeout, TcpStream::connect((host, port))).await
    }

    /// Queues the intercept, notifies observers and returns the block time.
    fn record_block(
        &self,
        protocol: Protocol,
        domain: &str,
        url: &str,
        decision: &Decision,
        user_id: Option<String>,
    ) -> DateTime<Utc> {
        let now = Utc::now();
        let site_id = decision.matched_rule_id().unwrap_or(domain);

        info!(
            domain,
            site = site_id,
            protocol = protocol.as_str(),
            "Blocked request"
        );

        self.intercepts.push(InterceptRecord::new(site_id, domain, now));

        self.observers.notify(&InterceptEvent {
            domain: domain.to_string(),
            url: url.to_string(),
            timestamp: now,
            protocol,
            rule_id: decision.matched_rule_id().map(str::to_string),
            user_id,
        });

        now
    }

    /// True when `host:port` is the proxy's own listener.
    fn targets_self(&self, host: &str, port: u16) -> bool {
        if port != self.listen_addr.port() {
            return false;
        }

        let listen_ip = self.listen_addr.ip().to_canonical();

        if host.eq_ignore_ascii_case("localhost") {
            return listen_ip.is_loopback() || listen_ip.is_unspecified();
        }

        match host.parse::<IpAddr>() {
            Ok(ip) => {
                let ip = ip.to_canonical();
                ip == listen_ip || ip.is_unspecified() || (listen_ip.is_unspecified() && ip.is_loopback())
            }
            Err(_) => false,
        }
    }
}

/// Works out the target of a plain HTTP request from its URI or `Host` header.
pub(crate) fn http_target(uri: &Uri, headers: &HeaderMap) -> Option<HttpTarget> {
    if let Some(authority) = uri.authority() {
        if let Some(scheme) = uri.scheme_str() {
            if !scheme.eq_ignore_ascii_case("http") {
                return None;
            }
        }
        return Some(HttpTarget {
            host: strip_brackets(authority.host()).to_string(),
            port: authority.port_u16().unwrap_or(80),
            authority: authority.as_str().to_string(),
            url: format!("http://{}{}", authority, path_or_root(uri)),
        });
    }

    let host_header = headers.get(HOST)?.to_str().ok()?;
    let authority: Authority = host_header.trim().parse().ok()?;

    Some(HttpTarget {
        host: strip_brackets(authority.host()).to_string(),
        port: authority.port_u16().unwrap_or(80),
        authority: authority.as_str().to_string(),
        url: format!("http://{}{}", authority, path_or_root(uri)),
    })
}

fn path_or_root(uri: &Uri) -> &str {
    uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// Rewrites a proxy request into the origin-form request sent upstream.
fn origin_form_request(
    req: Request<Incoming>,
    target: &HttpTarget,
) -> std::result::Result<Request<Incoming>, hyper::http::Error> {
    let (mut parts, body) = req.into_parts();

    let uri: Uri = path_or_root(&parts.uri).parse()?;
    let absolute_form = parts.uri.authority().is_some();
    parts.uri = uri;
    parts.version = Version::HTTP_11;

    strip_hop_by_hop(&mut parts.headers);

    // The authority in an absolute URI wins over any Host header.
    if absolute_form || !parts.headers.contains_key(HOST) {
        parts
            .headers
            .insert(HOST, HeaderValue::from_str(&target.authority)?);
    }

    Ok(Request::from_parts(parts, body))
}

/// Removes hop-by-hop headers, including any named in `Connection`.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in &listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn redirect_response(target: Option<&str>) -> Response<ProxyBody> {
    let Some(location) = target.and_then(|t| HeaderValue::from_str(t).ok()) else {
        warn!("Redirect rule has no usable target: {:?}", target);
        return status_response(StatusCode::FORBIDDEN, "Blocked by SiteGate");
    };

    let mut response = Response::new(empty());
    *response.status_mut() = StatusCode::FOUND;
    response.headers_mut().insert(LOCATION, location);
    response
}
