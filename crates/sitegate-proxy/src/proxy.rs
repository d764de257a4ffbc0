//! Forward proxy server.
//!
//! Owns the listener, the intercept flush task and the lifecycle state
//! machine:
//!
//! ```text
//! stopped → starting → running → stopping → stopped
//!              │          │
//!              └──────────┴──→ error (absorbing)
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use parking_lot::RwLock;
use serde::Serialize;
use socket2::{Domain, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use sitegate_core::{InterceptEvent, InterceptObserver, InterceptRecorder, RuleEngine, SharedObserver};

use crate::error::{ProxyError, Result};
use crate::handler::ProxyHandler;
use crate::intercepts::{ChannelObserver, InterceptQueue, Observers};
use crate::lifecycle::{ConnectionGuard, ConnectionTracker, Phase, ShutdownRx};
use crate::user::{NoUsers, UserResolver};
use crate::DEFAULT_PROXY_PORT;

/// Consecutive accept failures after which the listener gives up.
const MAX_ACCEPT_FAILURES: u32 = 16;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);
/// How long to wait for aborted tasks to wind down.
const ABORT_WAIT: Duration = Duration::from_secs(1);

/// Lifecycle state of a [`ProxyServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
            ServerState::Error => "error",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proxy server configuration.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// Rules consulted for every request. Shared with the management side.
    pub rule_engine: Arc<RuleEngine>,
    /// Receives intercept counts from the flush task.
    pub recorder: Arc<InterceptRecorder>,
    /// Maps connections to user ids.
    pub user_resolver: Arc<dyn UserResolver>,
    /// Time allowed for a client to send request headers.
    pub header_read_timeout: Duration,
    /// Time allowed to open an upstream connection.
    pub connect_timeout: Duration,
    /// Tunnels with no traffic for this long are closed.
    pub tunnel_idle_timeout: Duration,
    /// How long `stop()` waits for open connections before aborting them.
    pub shutdown_grace: Duration,
    /// Capacity of the intercept queue.
    pub queue_capacity: usize,
    /// Maximum time a queued intercept waits before it is counted.
    pub flush_interval: Duration,
    /// Number of queued intercepts that triggers an early flush.
    pub flush_batch_size: usize,
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("addr", &self.addr)
            .field("rule_engine", &"RuleEngine")
            .field("recorder", &"InterceptRecorder")
            .field("user_resolver", &"UserResolver")
            .field("header_read_timeout", &self.header_read_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("tunnel_idle_timeout", &self.tunnel_idle_timeout)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("queue_capacity", &self.queue_capacity)
            .field("flush_interval", &self.flush_interval)
            .field("flush_batch_size", &self.flush_batch_size)
            .finish()
    }
}

impl ProxyConfig {
    /// Creates a configuration with an empty rule engine and recorder.
    pub fn new() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            rule_engine: Arc::new(RuleEngine::new()),
            recorder: Arc::new(InterceptRecorder::new()),
            user_resolver: Arc::new(NoUsers),
            header_read_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            tunnel_idle_timeout: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(5),
            queue_capacity: 1024,
            flush_interval: Duration::from_secs(5),
            flush_batch_size: 64,
        }
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Sets the rule engine.
    pub fn with_rule_engine(mut self, rule_engine: Arc<RuleEngine>) -> Self {
        self.rule_engine = rule_engine;
        self
    }

    /// Sets the intercept recorder.
    pub fn with_recorder(mut self, recorder: Arc<InterceptRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Sets the user resolver.
    pub fn with_user_resolver<R: UserResolver + 'static>(mut self, resolver: R) -> Self {
        self.user_resolver = Arc::new(resolver);
        self
    }

    pub fn with_header_read_timeout(mut self, timeout: Duration) -> Self {
        self.header_read_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_tunnel_idle_timeout(mut self, timeout: Duration) -> Self {
        self.tunnel_idle_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_flush_batch_size(mut self, size: usize) -> Self {
        self.flush_batch_size = size;
        self
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Resources owned by a running server.
struct Running {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<Phase>,
    accept_task: JoinHandle<()>,
    tracker: Arc<ConnectionTracker>,
    queue: InterceptQueue,
}

impl Running {
    /// Closes the listener, drains connections, then flushes intercepts.
    async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown_tx.send(Phase::Draining);
        if let Err(e) = self.accept_task.await {
            warn!("Accept loop ended abnormally: {}", e);
        }

        if tokio::time::timeout(grace, self.tracker.wait_idle()).await.is_err() {
            warn!(
                "{} connections still open after {:?}, aborting",
                self.tracker.active(),
                grace
            );
            let _ = self.shutdown_tx.send(Phase::Abort);
            if tokio::time::timeout(ABORT_WAIT, self.tracker.wait_idle()).await.is_err() {
                warn!("{} connections did not exit after abort", self.tracker.active());
            }
        }

        self.queue.shutdown().await;
    }
}

/// HTTP/CONNECT forward proxy.
pub struct ProxyServer {
    config: ProxyConfig,
    state: Arc<RwLock<ServerState>>,
    observers: Observers,
    running: Mutex<Option<Running>>,
}

impl ProxyServer {
    /// Creates a stopped server.
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(ServerState::Stopped)),
            observers: Observers::new(),
            running: Mutex::new(None),
        }
    }

    /// Creates a server with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ProxyConfig::new())
    }

    /// Registers a callback for blocked requests.
    pub fn on_intercept<F>(self, callback: F) -> Self
    where
        F: Fn(&InterceptEvent) + Send + Sync + 'static,
    {
        self.observers.add(Arc::new(callback));
        self
    }

    /// Registers an observer. Takes effect for the next block.
    pub fn add_observer(&self, observer: SharedObserver) {
        self.observers.add(observer);
    }

    /// Returns a bounded stream of intercept events.
    ///
    /// Events are dropped when the receiver falls `capacity` events behind.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<InterceptEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let observer: Arc<dyn InterceptObserver> = Arc::new(ChannelObserver::new(tx));
        self.observers.add(observer);
        rx
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn rule_engine(&self) -> &Arc<RuleEngine> {
        &self.config.rule_engine
    }

    pub fn recorder(&self) -> &Arc<InterceptRecorder> {
        &self.config.recorder
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.state.read()
    }

    /// Address actually bound, while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    fn set_state(&self, state: ServerState) {
        *self.state.write() = state;
    }

    /// Binds the listener and starts serving. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;

        let state = self.state();
        if state != ServerState::Stopped {
            return Err(ProxyError::InvalidState {
                operation: "start",
                state,
            });
        }
        self.set_state(ServerState::Starting);

        let addr = self.config.addr;
        let (listener, local_addr) = match bind_listener(addr) {
            Ok(bound) => bound,
            Err(source) => {
                error!("Failed to bind proxy on {}: {}", addr, source);
                self.set_state(ServerState::Error);
                return Err(ProxyError::Bind { addr, source });
            }
        };

        let queue = InterceptQueue::spawn(
            Arc::clone(&self.config.recorder),
            self.config.queue_capacity,
            self.config.flush_batch_size,
            self.config.flush_interval,
        );
        let tracker = ConnectionTracker::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(Phase::Running);

        let handler = Arc::new(ProxyHandler {
            rule_engine: Arc::clone(&self.config.rule_engine),
            user_resolver: Arc::clone(&self.config.user_resolver),
            observers: self.observers.clone(),
            intercepts: queue.sender(),
            listen_addr: local_addr,
            connect_timeout: self.config.connect_timeout,
            tunnel_idle_timeout: self.config.tunnel_idle_timeout,
            shutdown: shutdown_rx.clone(),
            tracker: Arc::clone(&tracker),
        });

        let accept_task = tokio::spawn(accept_loop(
            listener,
            handler,
            self.config.header_read_timeout,
            Arc::clone(&self.state),
            shutdown_rx,
            Arc::clone(&tracker),
        ));

        info!("Starting proxy on {}", local_addr);
        self.set_state(ServerState::Running);

        *running = Some(Running {
            local_addr,
            shutdown_tx,
            accept_task,
            tracker,
            queue,
        });

        Ok(local_addr)
    }

    /// Stops serving and flushes queued intercepts.
    ///
    /// Does nothing when already stopped. A server in the error state has
    /// its resources released but stays in the error state.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;

        let Some(active) = running.take() else {
            return;
        };

        let keep_error = self.state() == ServerState::Error;
        if !keep_error {
            self.set_state(ServerState::Stopping);
        }

        info!("Stopping proxy on {}", active.local_addr);
        active.shutdown(self.config.shutdown_grace).await;

        if !keep_error {
            self.set_state(ServerState::Stopped);
        }
        info!("Proxy server stopped");
    }

    /// Stops and starts again.
    pub async fn restart(&self) -> Result<SocketAddr> {
        self.stop().await;
        self.start().await
    }
}

impl fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyServer")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("observers", &self.observers)
            .finish()
    }
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<(TcpListener, SocketAddr)> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    let listener = TcpListener::from_std(socket.into())?;
    let local_addr = listener.local_addr()?;
    Ok((listener, local_addr))
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<ProxyHandler>,
    header_read_timeout: Duration,
    state: Arc<RwLock<ServerState>>,
    mut shutdown: ShutdownRx,
    tracker: Arc<ConnectionTracker>,
) {
    let mut failures = 0u32;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    failures = 0;
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(serve_connection(
                        stream,
                        peer,
                        Arc::clone(&handler),
                        header_read_timeout,
                        shutdown.clone(),
                        tracker.enter(),
                    ));
                }
                Err(e) => {
                    failures += 1;
                    warn!("Accept failed ({} in a row): {}", failures, e);
                    if failures >= MAX_ACCEPT_FAILURES {
                        error!("Listener keeps failing, entering error state: {}", e);
                        *state.write() = ServerState::Error;
                        break;
                    }
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() != Phase::Running {
                    break;
                }
            }
        }
    }

    debug!("Accept loop stopped");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<ProxyHandler>,
    header_read_timeout: Duration,
    mut shutdown: ShutdownRx,
    _guard: ConnectionGuard,
) {
    let service = service_fn(move |req| Arc::clone(&handler).serve(req, peer));

    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(header_read_timeout)
        .preserve_header_case(true)
        .title_case_headers(true);

    let conn = builder
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(conn);

    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(%peer, "Connection closed with error: {}", e);
                }
                break;
            }
            changed = shutdown.changed() => {
                let phase = if changed.is_ok() { *shutdown.borrow() } else { Phase::Abort };
                match phase {
                    Phase::Running => {}
                    Phase::Draining => conn.as_mut().graceful_shutdown(),
                    Phase::Abort => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Utc;
    use http_body_util::Full;
    use hyper::body::Incoming;
    use hyper::header::HeaderValue;
    use hyper::{Request, Response};
    use sitegate_core::{local_date, BlockRule, MatchType, Protocol, RuleAction, UserGroup};
    use std::convert::Infallible;
    use std::net::IpAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_test::{assert_err, assert_ok};

    use crate::user::StaticClientMap;

    fn test_config() -> ProxyConfig {
        ProxyConfig::new()
            .with_port(0)
            .with_flush_interval(Duration::from_millis(20))
            .with_shutdown_grace(Duration::from_millis(200))
    }

    fn engine_with(rules: Vec<BlockRule>) -> Arc<RuleEngine> {
        let engine = RuleEngine::new();
        for rule in rules {
            engine.add_rule(rule).unwrap();
        }
        Arc::new(engine)
    }

    async fn spawn_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let body = format!(
                            "upstream saw {} {} proxy-auth={}",
                            req.method(),
                            req.uri(),
                            req.headers().contains_key("proxy-authorization")
                        );
                        let mut response = Response::new(Full::new(Bytes::from(body)));
                        response
                            .headers_mut()
                            .insert("x-upstream", HeaderValue::from_static("yes"));
                        Ok::<_, Infallible>(response)
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        addr
    }

    async fn spawn_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });

        addr
    }

    /// Sends a raw request and reads until the proxy closes the connection.
    async fn send_raw(proxy: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    }

    async fn read_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut byte))
                .await
                .unwrap()
                .unwrap();
            if n == 0 {
                break;
            }
            head.push(byte[0]);
            if head.ends_with(b"\r\n\r\n") {
                break;
            }
        }
        String::from_utf8_lossy(&head).into_owned()
    }

    fn get(url: &str, host: &str) -> String {
        format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            url, host
        )
    }

    #[test]
    fn proxy_config_with_port() {
        let config = ProxyConfig::new().with_port(8888);
        assert_eq!(config.addr.port(), 8888);
    }

    #[test]
    fn proxy_config_with_addr() {
        let addr = SocketAddr::from(([0, 0, 0, 0], 9999));
        let config = ProxyConfig::new().with_addr(addr);
        assert_eq!(config.addr, addr);
    }

    #[test]
    fn proxy_config_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.addr.port(), DEFAULT_PROXY_PORT);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.queue_capacity > 0);
        assert!(format!("{:?}", config).contains("ProxyConfig"));
    }

    #[test]
    fn server_state_names() {
        assert_eq!(ServerState::Running.to_string(), "running");
        assert_eq!(
            serde_json::to_string(&ServerState::Error).unwrap(),
            "\"error\""
        );
    }

    #[tokio::test]
    async fn state_machine_transitions() {
        let server = ProxyServer::new(test_config());
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.local_addr().await.is_none());

        let addr = server.start().await.unwrap();
        assert_eq!(server.state(), ServerState::Running);
        assert_eq!(server.local_addr().await, Some(addr));
        assert_ne!(addr.port(), 0);

        assert!(matches!(
            server.start().await,
            Err(ProxyError::InvalidState {
                operation: "start",
                state: ServerState::Running
            })
        ));

        server.stop().await;
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.local_addr().await.is_none());

        server.stop().await;
        assert_eq!(server.state(), ServerState::Stopped);

        assert_ok!(server.restart().await);
        assert_eq!(server.state(), ServerState::Running);
        server.stop().await;
    }

    #[tokio::test]
    async fn bind_failure_enters_error_state() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = occupied.local_addr().unwrap();

        let server = ProxyServer::new(test_config().with_addr(addr));
        let err = assert_err!(server.start().await);
        assert!(matches!(err, ProxyError::Bind { addr: a, .. } if a == addr));
        assert_eq!(server.state(), ServerState::Error);

        server.stop().await;
        assert_eq!(server.state(), ServerState::Error);

        assert!(matches!(
            server.start().await,
            Err(ProxyError::InvalidState { state: ServerState::Error, .. })
        ));
    }

    #[tokio::test]
    async fn allowed_http_is_forwarded() {
        let upstream = spawn_upstream().await;
        let server = ProxyServer::new(test_config());
        let proxy = server.start().await.unwrap();

        let request = format!(
            "GET http://{up}/hello?x=1 HTTP/1.1\r\nHost: {up}\r\nProxy-Authorization: Basic abc\r\nConnection: close\r\n\r\n",
            up = upstream
        );
        let response = send_raw(proxy, &request).await;

        assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
        assert!(response.contains("upstream saw GET /hello?x=1 proxy-auth=false"));
        assert!(response.to_lowercase().contains("x-upstream: yes"));

        server.stop().await;
    }

    #[tokio::test]
    async fn origin_form_request_uses_host_header() {
        let upstream = spawn_upstream().await;
        let server = ProxyServer::new(test_config());
        let proxy = server.start().await.unwrap();

        let response = send_raw(proxy, &get("/plain", &upstream.to_string())).await;
        assert!(response.contains("upstream saw GET /plain"), "{}", response);

        server.stop().await;
    }

    #[tokio::test]
    async fn blocked_http_gets_block_page_and_is_recorded() {
        let engine = engine_with(vec![BlockRule::block_domain("social", "social.example")]);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let server = ProxyServer::new(test_config().with_rule_engine(engine))
            .on_intercept(move |event: &InterceptEvent| sink.lock().push(event.clone()));
        let mut events = server.subscribe(8);
        let proxy = server.start().await.unwrap();

        let response = send_raw(
            proxy,
            &get("http://sub.social.example/feed", "sub.social.example"),
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
        assert!(response.to_lowercase().contains("x-sitegate-blocked: true"));
        assert!(response.contains("text/html"));
        assert!(response.contains("sub.social.example"));

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.domain, "sub.social.example");
        assert_eq!(event.url, "http://sub.social.example/feed");
        assert_eq!(event.protocol, Protocol::Http);
        assert_eq!(event.rule_id.as_deref(), Some("social"));
        assert_eq!(seen.lock().len(), 1);

        server.stop().await;

        let stat = server
            .recorder()
            .get("social", local_date(Utc::now()))
            .unwrap();
        assert_eq!(stat.count, 1);
        assert_eq!(stat.domain, "sub.social.example");
    }

    #[tokio::test]
    async fn other_domains_are_not_blocked() {
        let upstream = spawn_upstream().await;
        let engine = engine_with(vec![BlockRule::block_domain("social", "social.example")]);
        let server = ProxyServer::new(test_config().with_rule_engine(engine));
        let proxy = server.start().await.unwrap();

        let response = send_raw(proxy, &get(&format!("http://{}/", upstream), &upstream.to_string())).await;
        assert!(response.contains("upstream saw GET /"), "{}", response);
        assert!(!response.to_lowercase().contains("x-sitegate-blocked"));

        server.stop().await;
        assert!(server.recorder().is_empty());
    }

    #[tokio::test]
    async fn json_clients_get_json_block() {
        let engine = engine_with(vec![BlockRule::block_domain("social", "social.example")]);
        let server = ProxyServer::new(test_config().with_rule_engine(engine));
        let proxy = server.start().await.unwrap();

        let request = "GET http://social.example/api HTTP/1.1\r\nHost: social.example\r\nAccept: application/json\r\nConnection: close\r\n\r\n";
        let response = send_raw(proxy, request).await;

        assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
        assert!(response.contains("application/json"));
        assert!(response.contains("\"blocked\":true"));
        assert!(response.contains("\"rule_id\":\"social\""));

        server.stop().await;
    }

    #[tokio::test]
    async fn redirect_rule_returns_302() {
        let engine = engine_with(vec![BlockRule::new(
            "focus",
            "news.example",
            MatchType::Domain,
            RuleAction::Redirect,
        )
        .redirect_to("http://focus.example/")]);
        let server = ProxyServer::new(test_config().with_rule_engine(engine));
        let proxy = server.start().await.unwrap();

        let response = send_raw(proxy, &get("http://news.example/today", "news.example")).await;
        assert!(response.starts_with("HTTP/1.1 302 Found"), "{}", response);
        assert!(response.to_lowercase().contains("location: http://focus.example/"));

        server.stop().await;
    }

    #[tokio::test]
    async fn blocked_connect_gets_403() {
        let engine = engine_with(vec![BlockRule::block_domain("social", "social.example")]);
        let server = ProxyServer::new(test_config().with_rule_engine(engine));
        let mut events = server.subscribe(8);
        let proxy = server.start().await.unwrap();

        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream
            .write_all(b"CONNECT www.social.example:443 HTTP/1.1\r\nHost: www.social.example:443\r\n\r\n")
            .await
            .unwrap();
        let head = read_head(&mut stream).await;

        assert!(head.starts_with("HTTP/1.1 403"), "{}", head);
        assert!(!head.contains("Connection Established"));

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.domain, "social.example");
        assert_eq!(event.url, "www.social.example:443");
        assert_eq!(event.protocol, Protocol::Https);

        drop(stream);
        server.stop().await;
        assert_eq!(server.recorder().total_for_site("social"), 1);
    }

    #[tokio::test]
    async fn allowed_connect_relays_bytes() {
        let echo = spawn_echo().await;
        let server = ProxyServer::new(test_config());
        let proxy = server.start().await.unwrap();

        let mut stream = TcpStream::connect(proxy).await.unwrap();
        let request = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n", echo = echo);
        stream.write_all(request.as_bytes()).await.unwrap();

        let head = read_head(&mut stream).await;
        assert!(
            head.starts_with("HTTP/1.1 200 Connection Established"),
            "{}",
            head
        );

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"ping");

        drop(stream);
        server.stop().await;
    }

    #[tokio::test]
    async fn stop_aborts_lingering_tunnels() {
        let echo = spawn_echo().await;
        let server = ProxyServer::new(test_config());
        let proxy = server.start().await.unwrap();

        let mut stream = TcpStream::connect(proxy).await.unwrap();
        let request = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n", echo = echo);
        stream.write_all(request.as_bytes()).await.unwrap();
        let head = read_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 200"), "{}", head);

        tokio::time::timeout(Duration::from_secs(5), server.stop())
            .await
            .unwrap();
        assert_eq!(server.state(), ServerState::Stopped);

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn stop_closes_tunnels_whose_client_stopped_reading() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let flood = listener.local_addr().unwrap();
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let chunk = vec![0u8; 16 * 1024];
            while stream.write_all(&chunk).await.is_ok() {}
            let _ = closed_tx.send(());
        });

        let server = ProxyServer::new(test_config());
        let proxy = server.start().await.unwrap();

        let mut stream = TcpStream::connect(proxy).await.unwrap();
        let request = format!("CONNECT {up} HTTP/1.1\r\nHost: {up}\r\n\r\n", up = flood);
        stream.write_all(request.as_bytes()).await.unwrap();
        let head = read_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 200"), "{}", head);

        // Let the socket buffers fill so the relay blocks on its write.
        tokio::time::sleep(Duration::from_millis(300)).await;

        tokio::time::timeout(Duration::from_secs(5), server.stop())
            .await
            .unwrap();
        assert_eq!(server.state(), ServerState::Stopped);

        tokio::time::timeout(Duration::from_secs(3), closed_rx)
            .await
            .unwrap()
            .unwrap();
        drop(stream);
    }

    #[tokio::test]
    async fn slow_client_headers_time_out() {
        let server = ProxyServer::new(
            test_config().with_header_read_timeout(Duration::from_millis(300)),
        );
        let proxy = server.start().await.unwrap();

        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream.write_all(b"GET http://slow.example/ HTT").await.unwrap();

        // The proxy hangs up; a reset is as good as a clean close.
        let mut buf = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut buf))
            .await
            .unwrap();
        assert!(!String::from_utf8_lossy(&buf).contains("200 OK"));

        server.stop().await;
    }

    #[tokio::test]
    async fn ipv6_blocks_report_the_same_domain_for_http_and_connect() {
        let engine = engine_with(vec![BlockRule::new(
            "loopback6",
            "::1",
            MatchType::Contains,
            RuleAction::Block,
        )]);
        let server = ProxyServer::new(test_config().with_rule_engine(engine));
        let mut events = server.subscribe(8);
        let proxy = server.start().await.unwrap();

        let response = send_raw(proxy, &get("http://[::1]:9/feed", "[::1]:9")).await;
        assert!(response.contains("[::1]"), "{}", response);

        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream
            .write_all(b"CONNECT [::1]:443 HTTP/1.1\r\nHost: [::1]:443\r\n\r\n")
            .await
            .unwrap();
        let head = read_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 403"), "{}", head);

        let mut domains = Vec::new();
        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            domains.push(event.domain);
        }
        assert_eq!(domains, vec!["[::1]", "[::1]"]);

        drop(stream);
        server.stop().await;
        let stat = server
            .recorder()
            .get("loopback6", local_date(Utc::now()))
            .unwrap();
        assert_eq!(stat.count, 2);
        assert_eq!(stat.domain, "[::1]");
    }

    #[tokio::test]
    async fn requests_to_the_proxy_itself_are_refused() {
        let server = ProxyServer::new(test_config());
        let proxy = server.start().await.unwrap();

        let response = send_raw(proxy, &get(&format!("http://{}/", proxy), &proxy.to_string())).await;
        assert!(response.starts_with("HTTP/1.1 508"), "{}", response);

        server.stop().await;
    }

    #[tokio::test]
    async fn unreachable_upstream_is_bad_gateway() {
        let closed = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let server = ProxyServer::new(test_config());
        let proxy = server.start().await.unwrap();

        let response = send_raw(proxy, &get(&format!("http://{}/", closed), &closed.to_string())).await;
        assert!(response.starts_with("HTTP/1.1 502"), "{}", response);

        server.stop().await;
    }

    #[tokio::test]
    async fn rule_changes_apply_without_restart() {
        let upstream = spawn_upstream().await;
        let engine = Arc::new(RuleEngine::new());
        let server = ProxyServer::new(test_config().with_rule_engine(Arc::clone(&engine)));
        let proxy = server.start().await.unwrap();

        let request = get(&format!("http://{}/", upstream), &upstream.to_string());
        assert!(send_raw(proxy, &request).await.contains("upstream saw"));

        engine
            .add_rule(BlockRule::block_domain("local", "127.0.0.1"))
            .unwrap();
        let response = send_raw(proxy, &request).await;
        assert!(response.to_lowercase().contains("x-sitegate-blocked: true"), "{}", response);

        server.stop().await;
    }

    #[tokio::test]
    async fn user_resolver_scopes_group_rules() {
        let upstream = spawn_upstream().await;
        let engine = RuleEngine::new();
        engine
            .add_user_group(UserGroup::new("staff", "Staff", ["alice"]))
            .unwrap();
        engine
            .add_rule(BlockRule::block_domain("block-local", "127.0.0.1"))
            .unwrap();
        engine
            .add_rule(
                BlockRule::new("staff-local", "127.0.0.1", MatchType::Domain, RuleAction::Allow)
                    .with_priority(1)
                    .for_group("staff"),
            )
            .unwrap();
        let engine = Arc::new(engine);
        let request = get(&format!("http://{}/", upstream), &upstream.to_string());

        let resolver = StaticClientMap::new().with_client(IpAddr::from([127, 0, 0, 1]), "alice");
        let staff_server = ProxyServer::new(
            test_config()
                .with_rule_engine(Arc::clone(&engine))
                .with_user_resolver(resolver),
        );
        let proxy = staff_server.start().await.unwrap();
        assert!(send_raw(proxy, &request).await.contains("upstream saw"));
        staff_server.stop().await;

        let anonymous_server = ProxyServer::new(test_config().with_rule_engine(engine));
        let proxy = anonymous_server.start().await.unwrap();
        let response = send_raw(proxy, &request).await;
        assert!(response.to_lowercase().contains("x-sitegate-blocked: true"));
        anonymous_server.stop().await;
    }
}
