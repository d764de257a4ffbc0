//! SiteGate Proxy - HTTP/CONNECT forward proxy that enforces site rules.
//!
//! Browsers are pointed at this proxy. Every request is decided by the
//! shared [`sitegate_core::RuleEngine`] before any upstream connection is
//! made:
//!
//! - Plain HTTP is forwarded, replaced by a block page, or redirected
//! - HTTPS arrives as `CONNECT host:port` and is either tunneled or refused
//!   with `403` before the tunnel is established
//!
//! Blocks are counted through a bounded intercept queue and reported to
//! registered observers.
//!
//! ## Architecture
//!
//! ```text
//! Client ──► accept loop ──► connection task ──► ProxyHandler::handle
//!                                                      │
//!                                         RuleEngine::decide_now
//!                                                      │
//!                       ┌──────────────────────────────┼───────────────┐
//!                       │ Allow                        │ Block         │
//!                       ▼                              ▼               │
//!              forward / tunnel          block page / 403 + record ────┘
//!                                                      │
//!                                       InterceptQueue ─► flush task ─► InterceptRecorder
//! ```

mod block_page;
mod body;
mod error;
mod handler;
mod intercepts;
mod lifecycle;
mod proxy;
mod tunnel;
pub mod user;

pub use block_page::{escape_html, prefers_json, render_html, render_json, BlockInfo, BLOCKED_HEADER};
pub use body::ProxyBody;
pub use error::{ProxyError, Result};
pub use intercepts::{ChannelObserver, InterceptQueue, InterceptSender};
pub use proxy::{ProxyConfig, ProxyServer, ServerState};
pub use tunnel::TunnelStats;
pub use user::{NoUsers, StaticClientMap, UserResolver};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8766;
