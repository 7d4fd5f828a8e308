//! Routes and the failed-route blacklist.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use http::Uri;
use parking_lot::Mutex;

/// An origin server, as far as connection re-use is concerned.
///
/// Two requests may share a connection when they resolve to the same
/// address; everything else about them is free to differ.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    /// An address from an explicit host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The address a URL connects to, defaulting the port by scheme.
    pub fn from_url(url: &Uri) -> Self {
        let https = url.scheme() == Some(&http::uri::Scheme::HTTPS);
        Self {
            host: url.host().unwrap_or_default().to_owned(),
            port: url
                .port_u16()
                .unwrap_or(if https { 443 } else { 80 }),
        }
    }

    /// The host name.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One concrete path to an origin: the logical address, the proxy in
/// front of it (if any), and the resolved socket address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    address: Address,
    proxy: Option<SocketAddr>,
    socket: SocketAddr,
}

impl Route {
    /// A direct route to `socket`.
    pub fn direct(address: Address, socket: SocketAddr) -> Self {
        Self {
            address,
            proxy: None,
            socket,
        }
    }

    /// A route through a proxy.
    pub fn proxied(address: Address, proxy: SocketAddr, socket: SocketAddr) -> Self {
        Self {
            address,
            proxy: Some(proxy),
            socket,
        }
    }

    /// The logical address this route reaches.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The proxy this route goes through, if any.
    pub fn proxy(&self) -> Option<SocketAddr> {
        self.proxy
    }

    /// The resolved socket address.
    pub fn socket(&self) -> SocketAddr {
        self.socket
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.proxy {
            Some(proxy) => write!(f, "{} via {} at {}", self.address, proxy, self.socket),
            None => write!(f, "{} at {}", self.address, self.socket),
        }
    }
}

/// A blacklist of routes that recently failed, so new connections
/// prefer alternatives. A successful connect clears the entry: the
/// route has redeemed itself.
#[derive(Debug, Default)]
pub struct RouteDatabase {
    failed: Mutex<HashSet<Route>>,
}

impl RouteDatabase {
    /// Record a failure connecting via `route`.
    pub fn failed(&self, route: Route) {
        self.failed.lock().insert(route);
    }

    /// Record a success connecting via `route`.
    pub fn connected(&self, route: &Route) {
        self.failed.lock().remove(route);
    }

    /// Whether `route` failed recently and should be tried last.
    pub fn should_postpone(&self, route: &Route) -> bool {
        self.failed.lock().contains(route)
    }

    /// Number of routes currently blacklisted.
    pub fn failed_route_count(&self) -> usize {
        self.failed.lock().len()
    }
}
