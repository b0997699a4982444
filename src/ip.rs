//! IP address helpers.

use std::net::IpAddr;

/// Unmaps an IPv4-mapped IPv6 address back into plain IPv4.
///
/// STUN servers and sockets sometimes hand us `::ffff:a.b.c.d` for what really is an IPv4
/// peer.  All address comparisons in the report (mapping variance, hairpin targets) are
/// done on canonical addresses.
pub(crate) fn to_canonical(ip: IpAddr) -> IpAddr {
    match ip {
        ip @ IpAddr::V4(_) => ip,
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(ip) => IpAddr::V4(ip),
            None => IpAddr::V6(ip),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_canonical() {
        let mapped: IpAddr = "::ffff:198.51.100.7".parse().unwrap();
        assert_eq!(to_canonical(mapped), "198.51.100.7".parse::<IpAddr>().unwrap());

        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(to_canonical(v6), v6);

        let v4: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(to_canonical(v4), v4);
    }
}
