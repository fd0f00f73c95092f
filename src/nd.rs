//! Neighbor Discovery proxy worker.
//!
//! Listens for Neighbor Solicitations on every external interface and
//! answers on behalf of downstream hosts. A solicitation passes two gates
//! (target inside a configured prefix, target outside every exclude), then
//! a per-request handler verifies that a downstream host actually owns the
//! address before a Neighbor Advertisement goes out. The receive loop never
//! blocks on verification.

use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use tracing::{info, trace, warn};

use crate::board::{RouterBoard, ZERO_MAC};
use crate::config::{MacRef, NdConfig, NdMode, format_mac};
use crate::error::{Error, Result};
use crate::filter;
use crate::link;
use crate::packet::{self, Icmpv6Data, NdPayload};
use crate::reactor::Reactor;
use crate::sock::{Socket, read_any};
use crate::store::RouterInfoStore;
use crate::supervisor::Shutdown;

/// Upper bound on concurrently running verification handlers. Excess
/// solicitations are dropped; the requester retries on its own ND timer.
const MAX_INFLIGHT: usize = 64;

/// Advertise-MAC reference resolved lazily at advertise time. Symbolic
/// references cache the last successful board answer and fall back to it
/// when the board is unreachable.
pub struct AdvertiseMac {
    mac_ref: MacRef,
    cached: ArcSwapOption<[u8; 6]>,
}

impl AdvertiseMac {
    pub fn new(mac_ref: MacRef) -> Self {
        AdvertiseMac {
            mac_ref,
            cached: ArcSwapOption::empty(),
        }
    }

    pub fn resolve(&self, board: Option<&Arc<dyn RouterBoard>>) -> Option<[u8; 6]> {
        match &self.mac_ref {
            MacRef::Literal(mac) => Some(*mac),
            MacRef::Interface(name) => {
                if let Some(board) = board {
                    match board.interface_mac(name) {
                        Ok(mac) => {
                            self.cached.store(Some(Arc::new(mac)));
                            return Some(mac);
                        }
                        Err(e) => warn!(
                            ifname = %name,
                            error = %e,
                            "Advertise MAC lookup failed, using previous value"
                        ),
                    }
                }
                self.cached.load_full().map(|mac| *mac)
            }
        }
    }
}

/// One external interface: its socket and how to source advertisements.
#[derive(Clone)]
struct SockRef {
    logical: String,
    sock: Arc<Socket>,
    advertise: Arc<AdvertiseMac>,
}

/// The addresses of one Neighbor Solicitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NsInfo {
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub src_ip: Ipv6Addr,
    pub dst_ip: Ipv6Addr,
    pub target: Ipv6Addr,
}

pub fn parse_ns(frame: &[u8]) -> Result<NsInfo> {
    let data = Icmpv6Data::decode(frame)?;
    let NdPayload::NeighborSolicit { target, .. } = data.payload else {
        return Err(Error::MalformedFrame(format!(
            "expected neighbor solicitation, got ICMPv6 type {}",
            data.payload.msg_type()
        )));
    };
    Ok(NsInfo {
        src_mac: data.src_mac,
        dst_mac: data.dst_mac,
        src_ip: data.src_ip,
        dst_ip: data.dst_ip,
        target,
    })
}

/// The two admission gates: any configured prefix must contain the target,
/// and no exclude entry may. Unresolved templates are skipped.
pub fn admit(target: &Ipv6Addr, cfg: &NdConfig, store: &RouterInfoStore) -> bool {
    let mut admitted = false;
    for fip in &cfg.prefixes {
        match store.resolve(fip) {
            Some(net) if net.contains(target) => {
                trace!(target = %target, prefix = %net, "Target admitted by prefix");
                admitted = true;
                break;
            }
            Some(_) => {}
            None => trace!(prefix = %fip, "Prefix unresolved, skipping"),
        }
    }
    if !admitted {
        trace!(target = %target, "Target matches no configured prefix, ignoring");
        return false;
    }

    for fip in &cfg.excludes {
        if let Some(net) = store.resolve(fip)
            && net.contains(target)
        {
            trace!(target = %target, exclude = %net, "Target excluded, ignoring");
            return false;
        }
    }
    true
}

pub struct NdWorker {
    cfg: NdConfig,
    board: Option<Arc<dyn RouterBoard>>,
    store: Arc<RouterInfoStore>,
    reactor: Arc<Reactor>,
    shutdown: Shutdown,
    /// Serializes advertisement writes across all external sockets.
    write_lock: Arc<Mutex<()>>,
    inflight: Arc<AtomicUsize>,
}

impl NdWorker {
    pub fn new(
        cfg: NdConfig,
        board: Option<Arc<dyn RouterBoard>>,
        store: Arc<RouterInfoStore>,
        reactor: Arc<Reactor>,
        shutdown: Shutdown,
    ) -> Self {
        NdWorker {
            cfg,
            board,
            store,
            reactor,
            shutdown,
            write_lock: Arc::new(Mutex::new(())),
            inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// One supervised attempt: open sockets and serve solicitations until
    /// a failure or cancellation.
    pub fn run_once(&mut self) -> Result<()> {
        let externals = self.open_externals()?;
        let internals = self.open_internals()?;
        info!(
            externals = externals.len(),
            internals = internals.len(),
            mode = ?self.cfg.mode,
            "Neighbor discovery proxy started"
        );

        let ext_socks: Vec<Arc<Socket>> = externals.iter().map(|r| Arc::clone(&r.sock)).collect();
        loop {
            let (i, frame) = read_any(&ext_socks, None, &self.shutdown)?;
            let solicitation = match parse_ns(&frame) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "Dropping malformed frame");
                    continue;
                }
            };
            trace!(
                ifname = %externals[i].logical,
                target = %solicitation.target,
                src = %solicitation.src_ip,
                "Received neighbor solicitation"
            );

            if !admit(&solicitation.target, &self.cfg, &self.store) {
                continue;
            }
            self.dispatch(solicitation, externals[i].clone(), &internals);
        }
    }

    fn open_externals(&self) -> Result<Vec<SockRef>> {
        let mut externals = Vec::new();
        for resolved in link::collect(&self.cfg.external_interfaces)? {
            let logical = self.cfg.external_interfaces[resolved.position].clone();
            let sock = match Socket::open(
                &self.reactor,
                &resolved.name.actual_name(),
                resolved.index,
            ) {
                Ok(sock) => sock,
                Err(e) => {
                    warn!(ifname = %logical, error = %e, "Failed to open external socket");
                    continue;
                }
            };
            if let Err(e) = sock.apply_filter(&filter::neighbor_solicitation()) {
                warn!(ifname = %logical, error = %e, "Failed to apply packet filter");
                continue;
            }
            // Advertise MACs align positionally with the interface list.
            let mac_ref = self.cfg.advertise_macs[resolved.position].clone();
            externals.push(SockRef {
                logical,
                sock: Arc::new(sock),
                advertise: Arc::new(AdvertiseMac::new(mac_ref)),
            });
        }
        if externals.is_empty() {
            return Err(Error::Link(
                self.cfg.external_interfaces.join(","),
                "no external interface usable".into(),
            ));
        }
        Ok(externals)
    }

    fn open_internals(&self) -> Result<Vec<Arc<Socket>>> {
        if self.cfg.mode != NdMode::Proxy {
            return Ok(Vec::new());
        }
        let mut internals = Vec::new();
        for resolved in link::collect(&self.cfg.internal_interfaces)? {
            let logical = &self.cfg.internal_interfaces[resolved.position];
            let sock = match Socket::open(
                &self.reactor,
                &resolved.name.actual_name(),
                resolved.index,
            ) {
                Ok(sock) => sock,
                Err(e) => {
                    warn!(ifname = %logical, error = %e, "Failed to open internal socket");
                    continue;
                }
            };
            if let Err(e) = sock.apply_filter(&filter::icmpv6_type(136)) {
                warn!(ifname = %logical, error = %e, "Failed to apply packet filter");
                continue;
            }
            internals.push(Arc::new(sock));
        }
        if internals.is_empty() {
            return Err(Error::Link(
                self.cfg.internal_interfaces.join(","),
                "no internal interface usable".into(),
            ));
        }
        Ok(internals)
    }

    /// Hand a surviving solicitation to a verification handler thread.
    fn dispatch(&self, solicitation: NsInfo, external: SockRef, internals: &[Arc<Socket>]) {
        if self.inflight.load(Ordering::SeqCst) >= MAX_INFLIGHT {
            trace!(
                target = %solicitation.target,
                "Too many in-flight verifications, dropping solicitation"
            );
            return;
        }
        let guard = InflightGuard::acquire(&self.inflight);

        let handler = Handler {
            mode: self.cfg.mode,
            timeout: self.cfg.timeout,
            board: self.board.clone(),
            internals: internals.to_vec(),
            shutdown: self.shutdown.clone(),
            write_lock: Arc::clone(&self.write_lock),
        };
        let spawned = thread::Builder::new()
            .name("nd-verify".into())
            .spawn(move || {
                let _guard = guard;
                handler.handle(solicitation, external);
            });
        if let Err(e) = spawned {
            warn!(error = %e, "Failed to spawn verification handler");
        }
    }
}

struct InflightGuard(Arc<AtomicUsize>);

impl InflightGuard {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        InflightGuard(Arc::clone(counter))
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything one verification needs, detached from the receive loop.
struct Handler {
    mode: NdMode,
    timeout: Duration,
    board: Option<Arc<dyn RouterBoard>>,
    internals: Vec<Arc<Socket>>,
    shutdown: Shutdown,
    write_lock: Arc<Mutex<()>>,
}

impl Handler {
    fn handle(&self, solicitation: NsInfo, external: SockRef) {
        let target = solicitation.target;
        let verified = match self.mode {
            NdMode::Static => Some(ZERO_MAC),
            NdMode::Proxy => self.solicit_internal(target),
            NdMode::ProxyRos { strict } => {
                let Some(board) = &self.board else {
                    warn!("No board client for proxy-ros verification");
                    return;
                };
                match board.lookup_neighbor(target, self.timeout.as_millis() as u64, strict) {
                    Ok(mac) => mac,
                    Err(e) => {
                        warn!(target = %target, error = %e, "Board neighbor lookup failed");
                        None
                    }
                }
            }
            NdMode::Off => None,
        };

        let Some(hwaddr) = verified else {
            trace!(target = %target, "Verification failed, not answering");
            return;
        };
        trace!(
            target = %target,
            mac = %format_mac(&hwaddr),
            "Verification succeeded"
        );

        let Some(advertise_mac) = external.advertise.resolve(self.board.as_ref()) else {
            warn!(
                ifname = %external.logical,
                target = %target,
                "No advertise MAC available, dropping"
            );
            return;
        };

        let advertisement = packet::neighbor_advertisement(
            advertise_mac,
            solicitation.src_mac,
            solicitation.src_ip,
            target,
        );
        let result = {
            let _guard = self.write_lock.lock().unwrap();
            external.sock.write_once(&advertisement)
        };
        match result {
            Ok(()) => info!(
                ifname = %external.logical,
                target = %target,
                dst = %format_mac(&solicitation.src_mac),
                "Sent neighbor advertisement"
            ),
            Err(e) => warn!(
                ifname = %external.logical,
                target = %target,
                error = %e,
                "Failed to send neighbor advertisement"
            ),
        }
    }

    /// Verify by asking the downstream network ourselves: solicit the
    /// target on every internal link and wait for a matching advertisement.
    fn solicit_internal(&self, target: Ipv6Addr) -> Option<[u8; 6]> {
        for sock in &self.internals {
            if let Err(e) = sock.flush_all() {
                warn!(ifname = %sock.ifname, error = %e, "Failed to drain internal socket");
                continue;
            }
            let Some(src) = sock.link_local() else {
                warn!(ifname = %sock.ifname, "No link-local address, skipping");
                continue;
            };
            let Some(mac) = sock.hardware_addr() else {
                warn!(ifname = %sock.ifname, "No hardware address, skipping");
                continue;
            };
            if let Err(e) = sock.write_once(&packet::neighbor_solicitation(src, mac, target)) {
                warn!(ifname = %sock.ifname, error = %e, "Failed to send internal solicitation");
            }
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                trace!(target = %target, "Verification timed out");
                return None;
            };
            match read_any(&self.internals, Some(remaining), &self.shutdown) {
                Ok((_, frame)) => {
                    let Ok(data) = Icmpv6Data::decode(&frame) else {
                        continue;
                    };
                    if let NdPayload::NeighborAdvert {
                        target: advertised, ..
                    } = data.payload
                        && advertised == target
                    {
                        return Some(data.src_mac);
                    }
                }
                Err(Error::ReadTimeout(_)) => {
                    trace!(target = %target, "Verification timed out");
                    return None;
                }
                Err(e) => {
                    trace!(target = %target, error = %e, "Internal wait failed");
                    return None;
                }
            }
        }
    }
}
