//! IPv4 socket address value type.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use crate::error::Error;

/// An IPv4 host/port pair.
///
/// `Address` is a plain value: freely copied, ordered by address then port.
/// The all-zeroes address stands for "any interface".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    ip: Ipv4Addr,
    port: u16,
}

impl Address {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Bind helper: any interface on the given port.
    pub fn any(port: u16) -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED, port)
    }

    /// Bind helper: loopback on the given port.
    pub fn loopback(port: u16) -> Self {
        Self::new(Ipv4Addr::LOCALHOST, port)
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether this address stands for "any interface".
    pub fn is_any(&self) -> bool {
        self.ip.is_unspecified()
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for Address {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SocketAddrV4::from_str(s).map(Into::into)
    }
}

impl From<SocketAddrV4> for Address {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl From<Address> for SocketAddr {
    fn from(addr: Address) -> Self {
        addr.to_socket_addr()
    }
}

impl TryFrom<SocketAddr> for Address {
    type Error = Error;

    fn try_from(addr: SocketAddr) -> Result<Self, Error> {
        match addr {
            SocketAddr::V4(v4) => Ok(v4.into()),
            other => Err(Error::UnsupportedAddress(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    #[test]
    fn parse_format_round_trip() {
        for s in ["127.0.0.1:8080", "0.0.0.0:0", "10.1.2.3:65535"] {
            let addr: Address = s.parse().unwrap();
            assert_eq!(addr.to_string(), s);
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!("nonsense".parse::<Address>().is_err());
        assert!("1.2.3.4".parse::<Address>().is_err());
        assert!("[::1]:80".parse::<Address>().is_err());
    }

    #[test]
    fn ordering_is_address_then_port() {
        let a: Address = "1.0.0.1:9000".parse().unwrap();
        let b: Address = "2.0.0.1:1".parse().unwrap();
        let c: Address = "2.0.0.1:2".parse().unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    quickcheck! {
        fn format_then_parse_is_identity(bits: u32, port: u16) -> bool {
            let addr = Address::new(Ipv4Addr::from(bits), port);
            addr.to_string().parse::<Address>().map(|a| a == addr).unwrap_or(false)
        }
    }
}
