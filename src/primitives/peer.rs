// Data Structures: Peer address-book record
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// IPv4 address as the low 32 bits of the IPv6-mapped form
    /// `::ffff:a.b.c.d`, in host byte order.
    pub address: u32,
    pub port: u16,
    pub services: u64,
    /// Unix seconds. Peer timestamps are stored directly, not re-based
    /// like transaction/block timestamps.
    pub timestamp: u64,
}

impl Peer {
    pub fn new(ip: Ipv4Addr, port: u16, services: u64, timestamp: u64) -> Self {
        Peer { address: u32::from(ip), port, services, timestamp }
    }

    pub fn ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.address)
    }

    /// Canonical IPv6-mapped form used by the peer-to-peer layer.
    pub fn ipv6_mapped(&self) -> Ipv6Addr {
        self.ipv4().to_ipv6_mapped()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ipv4(), self.port))
    }
}
