//! Helpers for looking up the state of the machine's network interfaces.

use std::net::IpAddr;

/// A snapshot of which address families are usable on this host.
///
/// This is the part of the interface state the prober consumes: it decides whether IPv4
/// and IPv6 probes are planned at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct State {
    /// Whether the machine has some non-loopback IPv4 address.
    pub have_v4: bool,
    /// Whether this machine has an IPv6 Global or Unique Local Address which might
    /// provide connectivity.
    pub have_v6: bool,
}

impl State {
    /// Returns the state of the current machine's network interfaces.
    pub async fn new() -> Self {
        let mut have_v4 = false;
        let mut have_v6 = false;

        for iface in default_net::interface::get_interfaces() {
            let addrs = iface
                .ipv4
                .iter()
                .map(|net| IpAddr::V4(net.addr))
                .chain(iface.ipv6.iter().map(|net| IpAddr::V6(net.addr)));
            for addr in addrs {
                if addr.is_loopback() {
                    continue;
                }
                have_v4 |= is_usable_v4(&addr);
                have_v6 |= is_usable_v6(&addr);
            }
        }

        State { have_v4, have_v6 }
    }

    /// Reports whether any interface seems like it has internet access.
    pub fn any_interface_up(&self) -> bool {
        self.have_v4 || self.have_v6
    }

    /// A deterministic interface state for tests: IPv4 only.
    ///
    /// The probe plan tests rely on the interface state, this keeps them independent of
    /// the host the tests run on.
    #[cfg(test)]
    pub(crate) fn fake() -> Self {
        State {
            have_v4: true,
            have_v6: false,
        }
    }

    /// Like [`State::fake`] but dual-stack.
    #[cfg(test)]
    pub(crate) fn fake_dual_stack() -> Self {
        State {
            have_v4: true,
            have_v6: true,
        }
    }
}

/// Reports whether ip is a usable IPv4 address which could conceivably be used to get
/// Internet connectivity.  Globally routable and private IPv4 addresses are always
/// usable.
fn is_usable_v4(ip: &IpAddr) -> bool {
    ip.is_ipv4() && !ip.is_loopback()
}

/// Reports whether ip is a usable IPv6 address which could conceivably be used to get
/// Internet connectivity.  Globally routable IPv6 addresses (2000::/3) are always usable,
/// and Unique Local Addresses (fc00::/7) are in some environments used with address
/// translation.
fn is_usable_v6(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V6(ip) => {
            let segment1 = ip.segments()[0];
            if segment1 & 0xe000 == 0x2000 {
                return true;
            }
            segment1 & 0xfe00 == 0xfc00
        }
        IpAddr::V4(_) => false,
    }
}

/// Likely IP of the residential router, and the IP address of the current machine using
/// it.
///
/// This is used as the destination for UPnP, NAT-PMP and PCP queries.
#[derive(Debug, Clone)]
pub struct HomeRouter {
    /// IP of the router.
    pub gateway: IpAddr,
    /// Our local IP, if known.
    pub my_ip: Option<IpAddr>,
}

impl HomeRouter {
    /// Returns the likely IP of the residential router, which will always be a private
    /// address, if found, together with our own address on that LAN.
    pub fn new() -> Option<Self> {
        let gateway = default_net::get_default_gateway().ok()?.ip_addr;
        let my_ip = default_net::interface::get_local_ipaddr();

        Some(HomeRouter { gateway, my_ip })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usable_v6() {
        let global: IpAddr = "2603:1030:ae::1".parse().unwrap();
        assert!(is_usable_v6(&global));

        let ula: IpAddr = "fd12:3456:789a::1".parse().unwrap();
        assert!(is_usable_v6(&ula));

        let link_local: IpAddr = "fe80::1".parse().unwrap();
        assert!(!is_usable_v6(&link_local));

        let v4: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(!is_usable_v6(&v4));
    }

    #[tokio::test]
    async fn test_state_snapshot() {
        let state = State::new().await;
        println!("{state:?}");
    }
}
