//! Network keys: the unit of aggregation and banning.

use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::config::parse_network;

/// A normalized IPv4 network (address masked to its prefix).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkKey(Ipv4Net);

impl NetworkKey {
    /// Mask `address` to `prefix_len` bits. Prefixes above 32 are treated as 32.
    pub fn from_address(address: Ipv4Addr, prefix_len: u8) -> Self {
        let network = Ipv4Net::new(address, prefix_len.min(32))
            .map(|net| net.trunc())
            .unwrap_or_else(|_| Ipv4Net::from(address));
        Self(network)
    }

    pub fn network(&self) -> Ipv4Net {
        self.0
    }

    pub fn address(&self) -> Ipv4Addr {
        self.0.network()
    }

    pub fn prefix_len(&self) -> u8 {
        self.0.prefix_len()
    }

    /// Whether this network lies entirely within `base/prefix_len`.
    pub fn is_within(&self, base: Ipv4Addr, prefix_len: u8) -> bool {
        Ipv4Net::new(base, prefix_len).is_ok_and(|base| base.trunc().contains(&self.0))
    }

    /// Whether either network contains the other.
    pub fn overlaps(&self, other: &Ipv4Net) -> bool {
        let other = other.trunc();
        self.0.contains(&other) || other.contains(&self.0)
    }
}

/// Prefix length for a number of masked host bits.
pub fn prefix_len_for(subnet_bits: u8) -> u8 {
    32 - subnet_bits.min(32)
}

impl From<Ipv4Net> for NetworkKey {
    fn from(network: Ipv4Net) -> Self {
        Self(network.trunc())
    }
}

impl From<NetworkKey> for Ipv4Net {
    fn from(key: NetworkKey) -> Self {
        key.0
    }
}

impl FromStr for NetworkKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_network(s).map(Self)
    }
}

impl fmt::Display for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
