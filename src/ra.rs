//! Router Advertisement worker.
//!
//! Opens the first usable external link, solicits the upstream router once,
//! then listens for advertisements indefinitely. Every learned
//! `{prefix, gateway}` change is published to the router-info store and
//! reconciled onto the board. The supervisor restarts the worker with a
//! 10 second holdoff whenever it fails.

use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnet::Ipv6Net;
use tracing::{debug, info, warn};

use crate::board::RouterBoard;
use crate::config::{RaConfig, RaMode};
use crate::error::{Error, Result};
use crate::filter;
use crate::link;
use crate::packet::{self, Icmpv6Data, NdPayload};
use crate::reactor::Reactor;
use crate::sock::Socket;
use crate::store::{RouterInfo, RouterInfoStore};
use crate::supervisor::Shutdown;

/// What one Router Advertisement taught us. The gateway is the RA's source
/// address; the prefix comes from the prefix-information option, when one
/// is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaObservation {
    pub gateway: Ipv6Addr,
    pub prefix: Option<Ipv6Net>,
}

/// Parse a Router Advertisement frame into an observation.
pub fn parse_ra(frame: &[u8]) -> Result<RaObservation> {
    let data = Icmpv6Data::decode(frame)?;
    let NdPayload::RouterAdvert { ref options, .. } = data.payload else {
        return Err(Error::MalformedFrame(format!(
            "expected router advertisement, got ICMPv6 type {}",
            data.payload.msg_type()
        )));
    };

    let prefix = packet::prefix_information(options).and_then(|(addr, len)| {
        if (1..=128).contains(&len) {
            Ipv6Net::new(addr, len).ok()
        } else {
            None
        }
    });

    Ok(RaObservation {
        gateway: data.src_ip,
        prefix,
    })
}

pub struct RaWorker {
    cfg: RaConfig,
    board: Option<Arc<dyn RouterBoard>>,
    store: Arc<RouterInfoStore>,
    reactor: Arc<Reactor>,
    shutdown: Shutdown,
}

impl RaWorker {
    pub fn new(
        cfg: RaConfig,
        board: Option<Arc<dyn RouterBoard>>,
        store: Arc<RouterInfoStore>,
        reactor: Arc<Reactor>,
        shutdown: Shutdown,
    ) -> Self {
        RaWorker {
            cfg,
            board,
            store,
            reactor,
            shutdown,
        }
    }

    /// One supervised attempt: init, solicit, reconcile, listen. Returns
    /// only on failure or cancellation.
    pub fn run_once(&mut self) -> Result<()> {
        let sock = self.open_socket()?;
        self.solicit(&sock)?;
        self.reconcile();

        // After the first success, listen without a timeout; the upstream
        // router refreshes on its own schedule.
        loop {
            let observed = self.receive(&sock, None)?;
            let Some(prefix) = observed.prefix else {
                debug!("Router advertisement without prefix information, ignoring");
                continue;
            };
            let info = RouterInfo {
                prefix,
                gateway: observed.gateway,
            };
            if self.store.snapshot() != Some(info) {
                info!(prefix = %info.prefix, gateway = %info.gateway, "Router info changed");
                self.store.publish(info);
                self.reconcile();
            }
        }
    }

    fn open_socket(&self) -> Result<Socket> {
        let (name, index) = link::find_first(&self.cfg.external_interfaces)?;
        let sock = Socket::open(&self.reactor, &name.actual_name(), index)?;
        sock.apply_filter(&filter::router_advertisement())?;
        info!(ifname = %sock.ifname, "Watching for router advertisements");
        Ok(sock)
    }

    /// Send a Router Solicitation and wait for the first advertisement.
    /// Skipped when a previous run already learned the router info.
    fn solicit(&self, sock: &Socket) -> Result<()> {
        if self.store.snapshot().is_some() {
            return Ok(());
        }

        let src = sock
            .link_local()
            .ok_or_else(|| Error::Link(sock.ifname.clone(), "no link-local address".into()))?;
        let mac = sock
            .hardware_addr()
            .ok_or_else(|| Error::Link(sock.ifname.clone(), "no hardware address".into()))?;

        debug!(ifname = %sock.ifname, "Sending router solicitation");
        sock.write_once(&packet::router_solicitation(src, mac))?;

        let observed = self.receive(sock, Some(self.cfg.timeout))?;
        let prefix = observed
            .prefix
            .ok_or_else(|| Error::MalformedFrame("router did not return a prefix".into()))?;

        let info = RouterInfo {
            prefix,
            gateway: observed.gateway,
        };
        info!(prefix = %info.prefix, gateway = %info.gateway, "Router solicited");
        self.store.publish(info);
        Ok(())
    }

    /// Wait for the next parseable Router Advertisement. Malformed frames
    /// are dropped with a warning; the wait keeps its overall deadline.
    fn receive(&self, sock: &Socket, timeout: Option<Duration>) -> Result<RaObservation> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = match deadline {
                None => None,
                Some(deadline) => Some(
                    deadline
                        .checked_duration_since(Instant::now())
                        .ok_or(Error::ReadTimeout(self.cfg.timeout.as_millis() as u64))?,
                ),
            };
            debug!(ifname = %sock.ifname, timeout = ?remaining, "Waiting for router advertisement");
            let frame = sock.read_once(remaining, &self.shutdown)?;
            match parse_ra(&frame) {
                Ok(observed) => {
                    debug!(
                        gateway = %observed.gateway,
                        prefix = ?observed.prefix,
                        "Received a router advertisement"
                    );
                    return Ok(observed);
                }
                Err(e) => {
                    warn!(error = %e, "Dropping malformed frame");
                }
            }
        }
    }

    fn reconcile(&self) {
        if self.cfg.mode != RaMode::Ros {
            return;
        }
        let Some(board) = &self.board else { return };
        reconcile(&self.cfg, &self.store, board.as_ref());
    }
}

/// Apply the learned router info to the board: default route, address
/// assignments, prefix pools. Individual failures are logged and skipped;
/// the board operations are idempotent and the next RA retries them.
pub fn reconcile(cfg: &RaConfig, store: &RouterInfoStore, board: &dyn RouterBoard) {
    let Some(info) = store.snapshot() else {
        warn!("Reconcile without router info, skipping");
        return;
    };

    if !cfg.ros_external_interface.is_empty()
        && let Err(e) = board.set_default_gateway(&cfg.ros_external_interface, info.gateway)
    {
        warn!(
            ifname = %cfg.ros_external_interface,
            gateway = %info.gateway,
            error = %e,
            "Setting default gateway failed"
        );
    }

    for assign in cfg.external_ips.iter().chain(cfg.internal_ips.iter()) {
        let Some(network) = store.resolve(&assign.ip) else {
            warn!(ip = %assign.ip, "Assignment unresolved, skipping");
            continue;
        };
        if let Err(e) =
            board.assign_address(&assign.ifname, network, &assign.ip.to_string(), assign.options)
        {
            warn!(
                ifname = %assign.ifname,
                address = %network,
                error = %e,
                "Address assignment failed"
            );
        }
    }

    for pool in &cfg.pools {
        let Some(prefix) = store.resolve(&pool.ip) else {
            warn!(ip = %pool.ip, "Pool prefix unresolved, skipping");
            continue;
        };
        if let Err(e) = board.declare_pool(&pool.name, prefix, pool.prefix_len) {
            warn!(name = %pool.name, prefix = %prefix, error = %e, "Pool declaration failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{NdOption, OPT_PREFIX_INFO, OPT_SOURCE_LINK_ADDR};

    fn ra_frame(gateway: Ipv6Addr, prefix: Option<(Ipv6Addr, u8)>) -> Vec<u8> {
        let mut options = vec![NdOption::link_addr(
            OPT_SOURCE_LINK_ADDR,
            [0x02, 0, 0, 0, 0, 0x01],
        )];
        if let Some((addr, len)) = prefix {
            let mut data = vec![0u8; 30];
            data[0] = len;
            data[14..30].copy_from_slice(&addr.octets());
            options.push(NdOption {
                kind: OPT_PREFIX_INFO,
                data,
            });
        }
        Icmpv6Data {
            src_mac: [0x02, 0, 0, 0, 0, 0x01],
            dst_mac: [0x33, 0x33, 0, 0, 0, 1],
            src_ip: gateway,
            dst_ip: "ff02::1".parse().unwrap(),
            payload: NdPayload::RouterAdvert {
                cur_hop_limit: 64,
                flags: 0,
                router_lifetime: 1800,
                reachable_time: 0,
                retrans_time: 0,
                options,
            },
        }
        .encode()
    }

    #[test]
    fn gateway_and_prefix_come_from_the_advertisement() {
        let gateway: Ipv6Addr = "fe80::1".parse().unwrap();
        let frame = ra_frame(gateway, Some(("2001:db8:1::".parse().unwrap(), 64)));
        let observed = parse_ra(&frame).unwrap();
        assert_eq!(observed.gateway, gateway);
        assert_eq!(observed.prefix, Some("2001:db8:1::/64".parse().unwrap()));
    }

    #[test]
    fn advertisement_without_prefix_option_has_no_prefix() {
        let frame = ra_frame("fe80::1".parse().unwrap(), None);
        let observed = parse_ra(&frame).unwrap();
        assert_eq!(observed.prefix, None);
    }

    #[test]
    fn zero_length_prefix_is_ignored() {
        let frame = ra_frame("fe80::1".parse().unwrap(), Some(("::".parse().unwrap(), 0)));
        assert_eq!(parse_ra(&frame).unwrap().prefix, None);
    }

    #[test]
    fn non_ra_frames_are_rejected() {
        let ns = packet::neighbor_solicitation(
            "fe80::1".parse().unwrap(),
            [2, 0, 0, 0, 0, 1],
            "2001:db8::1".parse().unwrap(),
        );
        assert!(parse_ra(&ns).is_err());
    }
}
