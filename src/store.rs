//! Shared snapshot of the learned router information.
//!
//! The RA worker writes rarely; ND lookups read on every solicitation, so
//! the cell sits behind a read/write lock and readers copy the snapshot out.

use std::net::Ipv6Addr;
use std::sync::RwLock;

use ipnet::Ipv6Net;

use crate::config::FlexibleIP;

/// What the last valid Router Advertisement taught us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterInfo {
    pub prefix: Ipv6Net,
    pub gateway: Ipv6Addr,
}

#[derive(Debug, Default)]
pub struct RouterInfoStore {
    cell: RwLock<Option<RouterInfo>>,
}

impl RouterInfoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy out the current snapshot.
    pub fn snapshot(&self) -> Option<RouterInfo> {
        *self.cell.read().unwrap()
    }

    /// Replace the snapshot atomically.
    pub fn publish(&self, info: RouterInfo) {
        *self.cell.write().unwrap() = Some(info);
    }

    /// Resolve a FlexibleIP against the current snapshot.
    ///
    /// The learned prefix bits overlay the masked positions of the explicit
    /// suffix; the prefix length is the explicit CIDR or, for a bare
    /// `ra-prefix`, the learned prefix's own length. Templates that depend
    /// on the learned prefix stay unresolved (`None`) until the first RA.
    pub fn resolve(&self, fip: &FlexibleIP) -> Option<Ipv6Net> {
        let info = self.snapshot();
        if fip.ra_prefix && info.is_none() {
            return None;
        }

        let mut octets = fip.addr.map(|a| a.octets()).unwrap_or([0u8; 16]);
        if fip.ra_prefix {
            let info = info.unwrap();
            let prefix = info.prefix.addr().octets();
            let mask = info.prefix.netmask().octets();
            for i in 0..16 {
                octets[i] = (prefix[i] & mask[i]) | (octets[i] & !mask[i]);
            }
        }

        let len = match fip.cidr {
            Some(len) => len,
            None => info?.prefix.prefix_len(),
        };
        Ipv6Net::new(Ipv6Addr::from(octets), len).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(prefix: &str, gateway: &str) -> RouterInfoStore {
        let store = RouterInfoStore::new();
        store.publish(RouterInfo {
            prefix: prefix.parse().unwrap(),
            gateway: gateway.parse().unwrap(),
        });
        store
    }

    #[test]
    fn ra_dependent_templates_stay_unresolved_without_snapshot() {
        let store = RouterInfoStore::new();
        assert_eq!(store.resolve(&FlexibleIP::bare_ra_prefix()), None);
        assert_eq!(
            store.resolve(&"ra-prefix::1/128".parse().unwrap()),
            None
        );
        // Absolute addresses resolve regardless.
        assert_eq!(
            store.resolve(&"2001:db8::5/64".parse().unwrap()),
            Some("2001:db8::5/64".parse().unwrap())
        );
    }

    #[test]
    fn bare_ra_prefix_resolves_to_the_whole_prefix() {
        let store = store_with("2001:db8:1::/64", "fe80::1");
        assert_eq!(
            store.resolve(&FlexibleIP::bare_ra_prefix()),
            Some("2001:db8:1::/64".parse().unwrap())
        );
    }

    #[test]
    fn suffix_is_overlaid_with_learned_prefix_bits() {
        let store = store_with("2001:db8:1::/64", "fe80::1");
        assert_eq!(
            store.resolve(&"ra-prefix::1/128".parse().unwrap()),
            Some("2001:db8:1::1/128".parse().unwrap())
        );
        assert_eq!(
            store.resolve(&"ra-prefix::dead:beef/64".parse().unwrap()),
            Some("2001:db8:1::dead:beef/64".parse().unwrap())
        );
    }

    #[test]
    fn snapshot_replacement_changes_resolution() {
        let store = store_with("2001:db8:1::/64", "fe80::1");
        let fip: FlexibleIP = "ra-prefix::1/128".parse().unwrap();
        assert_eq!(
            store.resolve(&fip),
            Some("2001:db8:1::1/128".parse().unwrap())
        );

        store.publish(RouterInfo {
            prefix: "2001:db8:2::/64".parse().unwrap(),
            gateway: "fe80::2".parse().unwrap(),
        });
        assert_eq!(
            store.resolve(&fip),
            Some("2001:db8:2::1/128".parse().unwrap())
        );
    }

    #[test]
    fn high_bits_always_match_the_learned_prefix() {
        let store = store_with("2001:db8:aaaa:bbbb::/56", "fe80::1");
        let resolved = store
            .resolve(&"ra-prefix::42/128".parse().unwrap())
            .unwrap();
        let learned: Ipv6Net = "2001:db8:aaaa:bbbb::/56".parse().unwrap();
        assert!(learned.contains(&resolved.addr()));
    }
}
