//! Error types for the proxy.

use std::net::SocketAddr;

use thiserror::Error;

use crate::proxy::ServerState;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The listener could not be bound.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A lifecycle operation was called in the wrong state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ServerState,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Upstream connection error.
    #[error("Upstream error: {0}")]
    Upstream(String),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
