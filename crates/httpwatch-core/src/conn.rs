//! Connection identity
//!
//! A [`ConnTuple`] is the canonical descriptor of one network connection. Every
//! capture path (the three TLS adapters and the plaintext packet path) reduces
//! what it observes to a tuple so the downstream reconstructor can stitch the
//! byte streams of one connection together.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr};

/// Transport protocol of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Socket address family (matches AF_* constants)
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// AF_INET - IPv4 (2)
    Inet = 2,
    /// AF_INET6 - IPv6 (10)
    Inet6 = 10,
}

/// Which endpoint of the tuple originated the observation
///
/// Socket-derived tuples start with the local endpoint as source, packet-derived
/// tuples with the sender. Normalization flips this marker together with the
/// endpoints, so after normalization it still points at the originating side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Initiator {
    #[default]
    Source,
    Destination,
}

/// Inclusive range of ephemeral ports used to pick the canonical endpoint order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    /// Linux default (`net.ipv4.ip_local_port_range`)
    pub const LINUX_DEFAULT: PortRange = PortRange {
        min: 32768,
        max: 60999,
    };

    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub fn is_ephemeral(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::LINUX_DEFAULT
    }
}

/// Canonical connection identity
///
/// Equality and hashing cover the process, namespace, endpoints and protocol.
/// `initiator` is observation metadata and does not take part in either.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConnTuple {
    /// Owning process (zero for tuples shared with the packet path)
    pub pid: u32,
    /// Network namespace inode (zero when unknown)
    pub netns: u32,
    pub saddr: IpAddr,
    pub daddr: IpAddr,
    pub sport: u16,
    pub dport: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub initiator: Initiator,
}

impl ConnTuple {
    /// Build a TCP tuple with `src` as the originating endpoint
    pub fn tcp(saddr: IpAddr, sport: u16, daddr: IpAddr, dport: u16) -> Self {
        Self {
            pid: 0,
            netns: 0,
            saddr,
            daddr,
            sport,
            dport,
            protocol: Protocol::Tcp,
            initiator: Initiator::Source,
        }
    }

    /// Build a UDP tuple with `src` as the originating endpoint
    pub fn udp(saddr: IpAddr, sport: u16, daddr: IpAddr, dport: u16) -> Self {
        Self {
            protocol: Protocol::Udp,
            ..Self::tcp(saddr, sport, daddr, dport)
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// Address family, taken from the source address
    pub fn family(&self) -> AddressFamily {
        match self.saddr {
            IpAddr::V4(_) => AddressFamily::Inet,
            IpAddr::V6(_) => AddressFamily::Inet6,
        }
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol == Protocol::Tcp
    }

    /// Drop the process and namespace so the tuple matches the one the
    /// packet path derives for the same connection
    pub fn without_process(mut self) -> Self {
        self.pid = 0;
        self.netns = 0;
        self
    }

    /// Swap source and destination
    pub fn flip(&mut self) {
        std::mem::swap(&mut self.saddr, &mut self.daddr);
        std::mem::swap(&mut self.sport, &mut self.dport);
        self.initiator = match self.initiator {
            Initiator::Source => Initiator::Destination,
            Initiator::Destination => Initiator::Source,
        };
    }

    /// Put the endpoints in canonical order.
    ///
    /// An ephemeral source facing a non-ephemeral destination is already
    /// canonical. Otherwise the tuple is flipped when only the destination is
    /// ephemeral, or when both sides fall in the same class and the destination
    /// port is the larger one.
    pub fn normalize(&mut self, ephemeral: &PortRange) {
        let src_ephemeral = ephemeral.is_ephemeral(self.sport);
        let dst_ephemeral = ephemeral.is_ephemeral(self.dport);

        if src_ephemeral && !dst_ephemeral {
            return;
        }

        if (!src_ephemeral && dst_ephemeral) || self.dport > self.sport {
            self.flip();
        }
    }

    pub fn normalized(mut self, ephemeral: &PortRange) -> Self {
        self.normalize(ephemeral);
        self
    }

    /// The source port as it was before normalization
    pub fn owner_port(&self) -> u16 {
        match self.initiator {
            Initiator::Source => self.sport,
            Initiator::Destination => self.dport,
        }
    }
}

impl Default for ConnTuple {
    fn default() -> Self {
        Self::tcp(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            0,
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            0,
        )
    }
}

impl PartialEq for ConnTuple {
    fn eq(&self, other: &Self) -> bool {
        self.pid == other.pid
            && self.netns == other.netns
            && self.saddr == other.saddr
            && self.daddr == other.daddr
            && self.sport == other.sport
            && self.dport == other.dport
            && self.protocol == other.protocol
    }
}

impl Eq for ConnTuple {}

impl Hash for ConnTuple {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pid.hash(state);
        self.netns.hash(state);
        self.saddr.hash(state);
        self.daddr.hash(state);
        self.sport.hash(state);
        self.dport.hash(state);
        self.protocol.hash(state);
    }
}

impl fmt::Display for ConnTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        write!(
            f,
            "{} -> {} ({})",
            std::net::SocketAddr::new(self.saddr, self.sport),
            std::net::SocketAddr::new(self.daddr, self.dport),
            proto
        )
    }
}
