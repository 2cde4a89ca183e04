use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Target address carried in a tunnel handshake: either a numeric IP or a
/// hostname that still needs resolving.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Hostname(String),
}

impl Address {
    pub fn from_str(s: &str) -> std::io::Result<Self> {
        if let Ok(addr) = s.parse::<Ipv4Addr>() {
            return Ok(Address::Ipv4(addr));
        }
        if let Ok(addr) = s.parse::<Ipv6Addr>() {
            return Ok(Address::Ipv6(addr));
        }
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("failed to parse address: {s:?}"),
            ));
        }
        Ok(Address::Hostname(s.to_string()))
    }

    pub fn is_hostname(&self) -> bool {
        matches!(self, Address::Hostname(_))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(addr) => addr.fmt(f),
            Address::Ipv6(addr) => addr.fmt(f),
            Address::Hostname(hostname) => hostname.fmt(f),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct NetLocation {
    address: Address,
    port: u16,
}

impl NetLocation {
    pub fn new(address: Address, port: u16) -> Self {
        Self { address, port }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the socket address directly when no DNS lookup is needed.
    pub fn to_socket_addr_nonblocking(&self) -> Option<SocketAddr> {
        match self.address {
            Address::Ipv4(addr) => Some(SocketAddr::new(IpAddr::V4(addr), self.port)),
            Address::Ipv6(addr) => Some(SocketAddr::new(IpAddr::V6(addr), self.port)),
            Address::Hostname(_) => None,
        }
    }
}

impl fmt::Display for NetLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Address::Ipv6(addr) => write!(f, "[{}]:{}", addr, self.port),
            _ => write!(f, "{}:{}", self.address, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4() {
        assert_eq!(
            Address::from_str("10.0.0.1").unwrap(),
            Address::Ipv4("10.0.0.1".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_ipv6() {
        assert_eq!(
            Address::from_str("::1").unwrap(),
            Address::Ipv6("::1".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_hostname() {
        assert!(Address::from_str("example.com").unwrap().is_hostname());
    }

    #[test]
    fn test_reject_garbage() {
        assert!(Address::from_str("").is_err());
        assert!(Address::from_str("bad host").is_err());
    }

    #[test]
    fn test_display_ipv6_location() {
        let location = NetLocation::new(Address::from_str("::1").unwrap(), 443);
        assert_eq!(location.to_string(), "[::1]:443");
    }
}
