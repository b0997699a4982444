//! Configuration of the relay regions a report is generated against.
//!
//! A [`RelayMap`] is handed to [`Client::get_report`] by the caller; netcheck never
//! discovers relays on its own.
//!
//! [`Client::get_report`]: crate::Client::get_report

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

/// Configuration of all the relay regions that can be probed.
///
/// Regions are keyed by their id and iterated in id order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelayMap {
    regions: BTreeMap<u16, Arc<RelayRegion>>,
}

impl RelayMap {
    /// Creates a map from an iterator of regions.
    ///
    /// Fails on duplicate region ids, regions without nodes or nodes whose region
    /// back-reference does not match.
    pub fn from_regions(regions: impl IntoIterator<Item = RelayRegion>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for region in regions {
            let region_id = region.region_id;
            ensure!(!region.nodes.is_empty(), "region {region_id} has no nodes");
            for node in &region.nodes {
                ensure!(
                    node.region_id == region_id,
                    "node {} does not belong to region {region_id}",
                    node.name,
                );
            }
            let old = map.insert(region_id, Arc::new(region));
            ensure!(old.is_none(), "duplicate region {region_id}");
        }
        Ok(Self { regions: map })
    }

    /// Returns the region ids, sorted.
    pub fn region_ids(&self) -> Vec<u16> {
        self.regions.keys().copied().collect()
    }

    /// Returns the region with the given id.
    pub fn get_region(&self, region_id: u16) -> Option<&Arc<RelayRegion>> {
        self.regions.get(&region_id)
    }

    /// Returns an iterator over all regions, in id order.
    pub fn regions(&self) -> impl Iterator<Item = &Arc<RelayRegion>> {
        self.regions.values()
    }

    /// The number of configured regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether there are no regions configured.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

impl fmt::Display for RelayMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self, f)
    }
}

/// A region of relay nodes treated as equivalent for preferred-home selection.
///
/// Latency is measured per region, any node of a region may answer a probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRegion {
    /// A unique integer for this region, `0` is never used.
    pub region_id: u16,
    /// Short code for logging, e.g. `ams`.
    pub region_code: String,
    /// Do not probe or select this region.
    pub avoid: bool,
    /// The nodes of this region, never empty in a valid map.
    pub nodes: Vec<Arc<RelayNode>>,
}

/// A single relay node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelayNode {
    /// Globally unique name of this node.
    pub name: String,
    /// The id of the region this node belongs to.
    pub region_id: u16,
    /// DNS name of the node, used when no address literal is configured.
    pub host_name: String,
    /// STUN port of the node, `0` means the default STUN port.
    pub stun_port: u16,
    /// Whether the node only speaks STUN, i.e. has no HTTP(S) endpoints.
    pub stun_only: bool,
    /// Overrides all address resolution when set.  Used by tests.
    pub stun_test_ip: Option<IpAddr>,
    /// Optionally forces an IPv4 address to use, instead of using DNS.
    /// If `TryDns`, A records from DNS lookups of `host_name` are used.
    /// If `Disabled`, IPv4 is not used.
    pub ipv4: UseIpv4,
    /// Optionally forces an IPv6 address to use, instead of using DNS.
    /// If `TryDns`, AAAA records from DNS lookups of `host_name` are used.
    /// If `Disabled`, IPv6 is not used.
    pub ipv6: UseIpv6,
}

impl RelayNode {
    /// Whether this node might reply to IPv4 STUN based on its config alone, without DNS
    /// lookups.  Only explicitly disabled IPv4 returns `false`.
    pub fn might_ipv4(&self) -> bool {
        self.ipv4.is_enabled()
    }

    /// Whether this node might reply to IPv6 STUN based on its config alone, without DNS
    /// lookups.  Only explicitly disabled IPv6 returns `false`.
    pub fn might_ipv6(&self) -> bool {
        self.ipv6.is_enabled()
    }
}

impl fmt::Display for RelayNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// How to resolve the IPv4 address of a node.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UseIpv4 {
    /// Use A records from DNS.
    TryDns,
    /// This node is not reachable over IPv4.
    Disabled,
    /// Use this address, skip DNS.
    Some(Ipv4Addr),
}

impl UseIpv4 {
    /// Is IPv4 enabled for this node?
    pub fn is_enabled(&self) -> bool {
        !matches!(self, &UseIpv4::Disabled)
    }
}

/// How to resolve the IPv6 address of a node.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UseIpv6 {
    /// Use AAAA records from DNS.
    TryDns,
    /// This node is not reachable over IPv6.
    Disabled,
    /// Use this address, skip DNS.
    Some(Ipv6Addr),
}

impl UseIpv6 {
    /// Is IPv6 enabled for this node?
    pub fn is_enabled(&self) -> bool {
        !matches!(self, &UseIpv6::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, region_id: u16) -> Arc<RelayNode> {
        Arc::new(RelayNode {
            name: name.into(),
            region_id,
            host_name: format!("{name}.relay.example"),
            stun_port: 0,
            stun_only: false,
            stun_test_ip: None,
            ipv4: UseIpv4::TryDns,
            ipv6: UseIpv6::TryDns,
        })
    }

    #[test]
    fn test_from_regions_ordering() {
        let map = RelayMap::from_regions([
            RelayRegion {
                region_id: 3,
                region_code: "three".into(),
                avoid: false,
                nodes: vec![node("c", 3)],
            },
            RelayRegion {
                region_id: 1,
                region_code: "one".into(),
                avoid: false,
                nodes: vec![node("a", 1)],
            },
        ])
        .unwrap();
        assert_eq!(map.region_ids(), vec![1, 3]);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_from_regions_rejects_invalid() {
        let empty = RelayRegion {
            region_id: 1,
            region_code: "one".into(),
            avoid: false,
            nodes: vec![],
        };
        assert!(RelayMap::from_regions([empty]).is_err());

        let mismatched = RelayRegion {
            region_id: 1,
            region_code: "one".into(),
            avoid: false,
            nodes: vec![node("a", 2)],
        };
        assert!(RelayMap::from_regions([mismatched]).is_err());
    }

    #[test]
    fn test_node_might_families() {
        let mut n = (*node("a", 1)).clone();
        assert!(n.might_ipv4());
        assert!(n.might_ipv6());
        n.ipv4 = UseIpv4::Disabled;
        assert!(!n.might_ipv4());
        n.ipv6 = UseIpv6::Some("2001:db8::1".parse().unwrap());
        assert!(n.might_ipv6());
    }
}
