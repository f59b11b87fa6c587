//! Overlay node addresses.
//!
//! Every node is identified by the IPv4 address and port of its own transport
//! server. On the wire an address is always written in canonical form: each
//! octet zero-padded to three digits and the port zero-padded to five
//! ("010.000.000.001", "05050"). Two addresses name the same node iff their
//! canonical forms match, which for this type is plain structural equality.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

/// Width of a canonical IP ("ddd.ddd.ddd.ddd").
pub const CANONICAL_IP_LEN: usize = 15;
/// Width of a canonical port ("ddddd").
pub const CANONICAL_PORT_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("invalid IPv4 address: {0:?}")]
    InvalidIp(String),
    #[error("invalid port: {0:?}")]
    InvalidPort(String),
    #[error("address {0:?} has no port")]
    MissingPort(String),
    #[error("only IPv4 addresses are supported, got {0}")]
    NotIpv4(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    ip: [u8; 4],
    port: u16,
}

impl Address {
    pub const fn new(ip: [u8; 4], port: u16) -> Self {
        Self { ip, port }
    }

    /// Build an address from an IP string in any zero-padding and a port string.
    pub fn from_parts(ip: &str, port: &str) -> Result<Self, AddressError> {
        Ok(Self {
            ip: parse_ip(ip)?,
            port: parse_port(port)?,
        })
    }

    pub fn ip(&self) -> [u8; 4] {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// "192.168.001.001"
    pub fn canonical_ip(&self) -> String {
        let [a, b, c, d] = self.ip;
        format!("{:03}.{:03}.{:03}.{:03}", a, b, c, d)
    }

    /// "05335"
    pub fn canonical_port(&self) -> String {
        format!("{:05}", self.port)
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.ip), self.port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.canonical_ip(), self.canonical_port())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    /// Parses "ip:port"; the IP may be padded or not, "localhost" maps to 127.0.0.1.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (ip, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(s.to_string()))?;
        Self::from_parts(ip, port)
    }
}

impl From<SocketAddrV4> for Address {
    fn from(addr: SocketAddrV4) -> Self {
        Self {
            ip: addr.ip().octets(),
            port: addr.port(),
        }
    }
}

impl TryFrom<SocketAddr> for Address {
    type Error = AddressError;

    fn try_from(addr: SocketAddr) -> Result<Self, Self::Error> {
        match addr {
            SocketAddr::V4(v4) => Ok(v4.into()),
            SocketAddr::V6(v6) => Err(AddressError::NotIpv4(v6.to_string())),
        }
    }
}

fn parse_ip(ip: &str) -> Result<[u8; 4], AddressError> {
    let ip = ip.trim();
    if ip.eq_ignore_ascii_case("localhost") {
        return Ok([127, 0, 0, 1]);
    }

    let invalid = || AddressError::InvalidIp(ip.to_string());
    let mut octets = [0u8; 4];
    let mut parts = ip.split('.');
    for octet in octets.iter_mut() {
        let part = parts.next().ok_or_else(invalid)?;
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        *octet = part.parse().map_err(|_| invalid())?;
    }
    if parts.next().is_some() {
        return Err(invalid());
    }
    Ok(octets)
}

fn parse_port(port: &str) -> Result<u16, AddressError> {
    let port = port.trim();
    if port.is_empty()
        || port.len() > CANONICAL_PORT_LEN
        || !port.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(AddressError::InvalidPort(port.to_string()));
    }
    port.parse::<u16>()
        .map_err(|_| AddressError::InvalidPort(port.to_string()))
}
