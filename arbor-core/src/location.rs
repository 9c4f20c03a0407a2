//! Node location: the (address, port) pair identifying a network endpoint.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Where a node lives. Used both as a routing target and as a peer key.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NodeLocation {
    address: IpAddr,
    port: u16,
}

impl NodeLocation {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl From<SocketAddr> for NodeLocation {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl From<NodeLocation> for SocketAddr {
    fn from(location: NodeLocation) -> Self {
        location.socket_addr()
    }
}

impl fmt::Display for NodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.socket_addr(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_equality() {
        let a = NodeLocation::new("10.0.0.21".parse().unwrap(), 3010);
        let b: NodeLocation = "10.0.0.21:3010".parse::<SocketAddr>().unwrap().into();
        let c = NodeLocation::new("10.0.0.21".parse().unwrap(), 3011);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "10.0.0.21:3010");
    }
}
