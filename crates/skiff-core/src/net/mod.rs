//! Network address helpers.
//!
//! Peers are addressed by plain IPv4; there is no discovery layer. The
//! local address reported to peers is learned with the UDP connect trick:
//! the OS picks the source address it would route toward a probe target,
//! which is the configured network when a CIDR hint is present, or a public
//! resolver otherwise. No packet is actually sent.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::{Error, Result};

/// Parse a host address string into a `SocketAddr`.
///
/// Accepts `IP` (default port applied) and `IP:PORT`.
///
/// # Errors
///
/// Returns an error if the host string cannot be parsed.
pub fn parse_host_address(host: &str, default_port: u16) -> Result<SocketAddr> {
    let host = host.trim();

    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    Err(Error::InvalidInput(format!(
        "Invalid host format '{host}'. Use IP or IP:PORT (e.g., 192.168.1.100 or 192.168.1.100:52550)"
    )))
}

/// An IPv4 network in `a.b.c.d/len` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Network {
    address: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Network {
    /// Parse CIDR text.
    ///
    /// # Errors
    ///
    /// Returns an error for bad address text or a prefix longer than 32.
    pub fn parse(cidr: &str) -> Result<Self> {
        let (addr, len) = cidr
            .trim()
            .split_once('/')
            .ok_or_else(|| Error::InvalidInput(format!("CIDR without prefix length: {cidr}")))?;
        let address: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::InvalidInput(format!("bad CIDR address: {addr}")))?;
        let prefix_len: u8 = len
            .parse()
            .map_err(|_| Error::InvalidInput(format!("bad CIDR prefix length: {len}")))?;
        if prefix_len > 32 {
            return Err(Error::InvalidInput(format!(
                "CIDR prefix length out of range: {prefix_len}"
            )));
        }
        Ok(Self {
            address,
            prefix_len,
        })
    }

    /// Whether `ip` falls inside this network.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix_len))
        };
        (u32::from(self.address) & mask) == (u32::from(ip) & mask)
    }

    /// A routable host inside this network, used as the probe target.
    fn probe_address(&self) -> Ipv4Addr {
        let mask = if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix_len))
        };
        Ipv4Addr::from((u32::from(self.address) & mask) | 1)
    }
}

/// Pick the local IPv4 address this server should report to peers.
///
/// With a CIDR hint the probe targets a host inside that network, so the OS
/// selects the interface on that subnet; the result is verified against the
/// hint. Without a hint (or when the hint does not match any route) the
/// default-route source address is used. Falls back to loopback when the
/// host has no route at all.
pub fn local_ipv4(cidr_hint: Option<&str>) -> Ipv4Addr {
    if let Some(cidr) = cidr_hint {
        match Ipv4Network::parse(cidr) {
            Ok(network) => {
                if let Some(ip) = probe_source_ipv4(network.probe_address()) {
                    if network.contains(ip) {
                        return ip;
                    }
                    tracing::warn!(
                        "local address {ip} is outside the configured network {cidr}; \
                         using default route"
                    );
                }
            }
            Err(e) => tracing::warn!("ignoring bad CIDR hint {cidr}: {e}"),
        }
    }

    probe_source_ipv4(Ipv4Addr::new(8, 8, 8, 8)).unwrap_or(Ipv4Addr::LOCALHOST)
}

/// Source address the OS would use toward `target`. No traffic is sent.
fn probe_source_ipv4(target: Ipv4Addr) -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect((target, 80)).ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(addr) => Some(*addr.ip()),
        SocketAddr::V6(_) => None,
    }
}

/// Configure TCP keep-alive on a transfer socket.
///
/// Keeps routers and NAT boxes from dropping a connection that goes quiet
/// between the request frame and the byte stream.
///
/// # Errors
///
/// Returns an error if the socket options cannot be set.
pub fn configure_tcp_keepalive(stream: &TcpStream) -> Result<()> {
    let socket_ref = socket2::SockRef::from(stream);

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));

    socket_ref
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    Ok(())
}
