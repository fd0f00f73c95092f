//! Test helpers shared by unit and integration tests.

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use ipnet::Ipv6Net;

use crate::board::{AssignOptions, RouterBoard, ZERO_MAC};
use crate::error::{Error, Result};

/// One recorded board operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardCall {
    AssignAddress {
        ifname: String,
        address: Ipv6Net,
        key: String,
        options: AssignOptions,
    },
    SetDefaultGateway {
        ifname: String,
        gateway: Ipv6Addr,
    },
    DeclarePool {
        name: String,
        prefix: Ipv6Net,
        sub_prefix_len: u8,
    },
    LookupNeighbor {
        addr: Ipv6Addr,
        timeout_ms: u64,
        strict: bool,
    },
}

/// A router board that records every call and answers from canned state.
#[derive(Default)]
pub struct MockBoard {
    calls: Mutex<Vec<BoardCall>>,
    neighbor: Mutex<Option<[u8; 6]>>,
    echo_ok: AtomicBool,
    interface_macs: Mutex<HashMap<String, [u8; 6]>>,
    fail_interface_mac: AtomicBool,
}

impl MockBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<BoardCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Neighbor-table answer for `lookup_neighbor`.
    pub fn set_neighbor(&self, mac: Option<[u8; 6]>) {
        *self.neighbor.lock().unwrap() = mac;
    }

    /// Whether the reachability probe succeeds (non-strict sentinel path).
    pub fn set_echo_ok(&self, ok: bool) {
        self.echo_ok.store(ok, Ordering::SeqCst);
    }

    pub fn set_interface_mac(&self, ifname: &str, mac: [u8; 6]) {
        self.interface_macs
            .lock()
            .unwrap()
            .insert(ifname.to_string(), mac);
    }

    /// Make `interface_mac` fail until cleared.
    pub fn set_fail_interface_mac(&self, fail: bool) {
        self.fail_interface_mac.store(fail, Ordering::SeqCst);
    }
}

impl RouterBoard for MockBoard {
    fn assign_address(
        &self,
        ifname: &str,
        address: Ipv6Net,
        key: &str,
        options: AssignOptions,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(BoardCall::AssignAddress {
            ifname: ifname.to_string(),
            address,
            key: key.to_string(),
            options,
        });
        Ok(())
    }

    fn set_default_gateway(&self, ifname: &str, gateway: Ipv6Addr) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(BoardCall::SetDefaultGateway {
                ifname: ifname.to_string(),
                gateway,
            });
        Ok(())
    }

    fn declare_pool(&self, name: &str, prefix: Ipv6Net, sub_prefix_len: u8) -> Result<()> {
        self.calls.lock().unwrap().push(BoardCall::DeclarePool {
            name: name.to_string(),
            prefix,
            sub_prefix_len,
        });
        Ok(())
    }

    fn lookup_neighbor(
        &self,
        addr: Ipv6Addr,
        timeout_ms: u64,
        strict: bool,
    ) -> Result<Option<[u8; 6]>> {
        self.calls.lock().unwrap().push(BoardCall::LookupNeighbor {
            addr,
            timeout_ms,
            strict,
        });
        if let Some(mac) = *self.neighbor.lock().unwrap() {
            return Ok(Some(mac));
        }
        if !strict && self.echo_ok.load(Ordering::SeqCst) {
            return Ok(Some(ZERO_MAC));
        }
        Ok(None)
    }

    fn interface_mac(&self, ifname: &str) -> Result<[u8; 6]> {
        if self.fail_interface_mac.load(Ordering::SeqCst) {
            return Err(Error::Board("interface lookup unavailable".into()));
        }
        self.interface_macs
            .lock()
            .unwrap()
            .get(ifname)
            .copied()
            .ok_or_else(|| Error::Board(format!("no MAC for interface '{ifname}'")))
    }
}
