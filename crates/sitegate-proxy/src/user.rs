//! Mapping connections to user ids.
//!
//! Rules scoped to a user group only apply when the proxy can tell who is
//! behind a connection. A [`UserResolver`] answers that from the peer
//! address and request headers.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use hyper::HeaderMap;

/// Resolves the user behind a proxied request.
pub trait UserResolver: Send + Sync {
    /// Returns the user id for this peer, or `None` for an anonymous client.
    fn resolve(&self, peer: SocketAddr, headers: &HeaderMap) -> Option<String>;
}

/// Resolver that treats every client as anonymous.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoUsers;

impl UserResolver for NoUsers {
    fn resolve(&self, _peer: SocketAddr, _headers: &HeaderMap) -> Option<String> {
        None
    }
}

/// Resolver backed by a fixed client IP to user id map.
#[derive(Debug, Clone, Default)]
pub struct StaticClientMap {
    clients: HashMap<IpAddr, String>,
}

impl StaticClientMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a client address.
    pub fn with_client(mut self, ip: IpAddr, user_id: impl Into<String>) -> Self {
        self.insert(ip, user_id);
        self
    }

    pub fn insert(&mut self, ip: IpAddr, user_id: impl Into<String>) {
        self.clients.insert(ip.to_canonical(), user_id.into());
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl FromIterator<(IpAddr, String)> for StaticClientMap {
    fn from_iter<T: IntoIterator<Item = (IpAddr, String)>>(iter: T) -> Self {
        let mut map = Self::new();
        for (ip, user) in iter {
            map.insert(ip, user);
        }
        map
    }
}

impl UserResolver for StaticClientMap {
    fn resolve(&self, peer: SocketAddr, _headers: &HeaderMap) -> Option<String> {
        // IPv4 clients on a dual-stack listener show up as ::ffff:a.b.c.d.
        self.clients.get(&peer.ip().to_canonical()).cloned()
    }
}
