//! Interception events and observers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Protocol of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain HTTP request.
    Http,
    /// HTTPS CONNECT tunnel.
    Https,
}

impl Protocol {
    /// Returns the lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

/// Emitted every time a request is blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptEvent {
    /// Normalized host.
    pub domain: String,
    /// Full URL for HTTP, `host:port` for CONNECT.
    pub url: String,
    /// When the block happened.
    pub timestamp: DateTime<Utc>,
    /// Request protocol.
    pub protocol: Protocol,
    /// Id of the rule (or blocked domain) that matched.
    pub rule_id: Option<String>,
    /// Resolved user, if any.
    pub user_id: Option<String>,
}

/// Receives interception events.
///
/// Called on the request path; implementations must not block.
pub trait InterceptObserver: Send + Sync {
    /// Handles one event.
    fn on_intercept(&self, event: &InterceptEvent);
}

impl<F> InterceptObserver for F
where
    F: Fn(&InterceptEvent) + Send + Sync,
{
    fn on_intercept(&self, event: &InterceptEvent) {
        self(event)
    }
}

/// Shared observer handle.
pub type SharedObserver = Arc<dyn InterceptObserver>;
