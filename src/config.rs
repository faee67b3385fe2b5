//! Listener configuration and run-time preferences.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Default DNS port for upstream resolvers given as bare IPs.
pub const DNS_PORT: u16 = 53;

pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Where and how the listener binds. Fixed for the life of a server.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_addr: SocketAddr,
    /// Also accept queries over TCP on the same port.
    pub tcp: bool,
    /// How long `stop` waits for in-flight queries before cancelling them.
    pub grace_period: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DNS_PORT),
            tcp: true,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

/// Run-time preferences.
///
/// Handed to the server as a whole and replaced as a whole; the server never
/// edits one in place.
#[derive(Debug, Clone)]
pub struct ServerProperties {
    /// 0 is quiet; 1 and above log every query.
    pub debug_level: u8,
    pub use_custom_dns: bool,
    /// Tried before the system resolvers when `use_custom_dns` is set.
    pub custom_dns_servers: Vec<SocketAddr>,
    /// Budget for one upstream attempt.
    pub upstream_timeout: Duration,
    /// Budget for the whole query, all attempts included.
    pub query_timeout: Duration,
}

impl ServerProperties {
    /// Custom resolvers in effect, empty unless `use_custom_dns` is set.
    pub fn upstreams(&self) -> &[SocketAddr] {
        if self.use_custom_dns {
            &self.custom_dns_servers
        } else {
            &[]
        }
    }

    pub fn verbose(&self) -> bool {
        self.debug_level >= 1
    }
}

impl Default for ServerProperties {
    fn default() -> Self {
        Self {
            debug_level: 0,
            use_custom_dns: false,
            custom_dns_servers: Vec::new(),
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

/// Parse an upstream address, accepting a bare IP for port 53.
pub fn parse_upstream(s: &str) -> Result<SocketAddr, String> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    s.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
        .map_err(|_| format!("invalid upstream address: {}", s))
}

/// Resolvers configured for the host.
///
/// Reads `nameserver` lines from `/etc/resolv.conf`; empty when the file is
/// missing or lists none.
pub fn system_resolvers() -> Vec<SocketAddr> {
    read_resolv_conf(Path::new(RESOLV_CONF))
}

pub fn read_resolv_conf(path: &Path) -> Vec<SocketAddr> {
    fs::read_to_string(path)
        .map(|content| parse_resolv_conf(&content))
        .unwrap_or_default()
}

fn parse_resolv_conf(content: &str) -> Vec<SocketAddr> {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            if parts.next()? != "nameserver" {
                return None;
            }
            // Drop a zone suffix such as fe80::1%eth0
            let ip = parts.next()?.split('%').next()?;
            ip.parse::<IpAddr>()
                .ok()
                .map(|ip| SocketAddr::new(ip, DNS_PORT))
        })
        .collect()
}
