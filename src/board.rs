//! Management API contract for the router board.
//!
//! The companion never rolls anything back; every operation is an
//! idempotent upsert so the reconciliation loop can re-run it freely.

use std::net::Ipv6Addr;

use ipnet::Ipv6Net;

use crate::error::Result;

/// Sentinel returned by non-strict neighbor lookups when the target answered
/// a reachability probe but the neighbor table has no usable entry.
pub const ZERO_MAC: [u8; 6] = [0; 6];

/// Options carried by an address assignment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssignOptions {
    pub eui64: bool,
    pub advertise: bool,
}

/// Operations the companion needs from the router board. Implementations
/// must bound every call by a 5 second deadline and may reconnect
/// transparently underneath.
pub trait RouterBoard: Send + Sync {
    /// Upsert an address on `ifname`, tagged with `key` so later
    /// reconciliations find it again. A no-op when the target state is
    /// already present.
    fn assign_address(
        &self,
        ifname: &str,
        address: Ipv6Net,
        key: &str,
        options: AssignOptions,
    ) -> Result<()>;

    /// Upsert the `::/0` route via `gateway` on `ifname`.
    fn set_default_gateway(&self, ifname: &str, gateway: Ipv6Addr) -> Result<()>;

    /// Upsert the named prefix pool.
    fn declare_pool(&self, name: &str, prefix: Ipv6Net, sub_prefix_len: u8) -> Result<()>;

    /// Probe `addr` once with the given interval, then read the board's
    /// neighbor table. Returns the neighbor's MAC, the [`ZERO_MAC`]
    /// sentinel (non-strict, probe succeeded without a table hit), or
    /// `None` when the address is not reachable.
    fn lookup_neighbor(
        &self,
        addr: Ipv6Addr,
        timeout_ms: u64,
        strict: bool,
    ) -> Result<Option<[u8; 6]>>;

    /// Current hardware address of a board interface.
    fn interface_mac(&self, ifname: &str) -> Result<[u8; 6]>;
}
