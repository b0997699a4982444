//! DNS lookups for relay nodes.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use anyhow::Result;
use hickory_resolver::TokioAsyncResolver;
use once_cell::sync::Lazy;

static DNS_RESOLVER: Lazy<TokioAsyncResolver> = Lazy::new(|| {
    // We first try to read the system's resolver from `/etc/resolv.conf`.  This does not
    // work on all platforms, so fall back to the default resolver config.
    let (config, mut options) =
        hickory_resolver::system_conf::read_system_conf().unwrap_or_default();
    options.ip_strategy = hickory_resolver::config::LookupIpStrategy::Ipv4thenIpv6;
    hickory_resolver::AsyncResolver::tokio(config, options)
});

/// Performs an A record lookup with a timeout.
pub(crate) async fn lookup_ipv4(host: &str, timeout: Duration) -> Result<Vec<Ipv4Addr>> {
    let lookup = tokio::time::timeout(timeout, DNS_RESOLVER.ipv4_lookup(host)).await??;
    Ok(lookup.into_iter().map(|ip| ip.0).collect())
}

/// Performs a AAAA record lookup with a timeout.
pub(crate) async fn lookup_ipv6(host: &str, timeout: Duration) -> Result<Vec<Ipv6Addr>> {
    let lookup = tokio::time::timeout(timeout, DNS_RESOLVER.ipv6_lookup(host)).await??;
    Ok(lookup.into_iter().map(|ip| ip.0).collect())
}
