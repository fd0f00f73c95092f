//! Raw AF_PACKET sockets bound to one link.
//!
//! Each socket is scoped to EtherType 0x86DD (IPv6), bound to a single
//! link index with the reception address wildcarded, marked non-blocking
//! and registered with the reactor. A kernel packet filter can be attached
//! after construction and before the first drain.
//!
//! Concurrency contract: one reader at a time per socket; writers serialize
//! among themselves (the ND worker holds one mutex across all of its
//! external sockets when emitting advertisements).

use std::io;
use std::net::Ipv6Addr;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Select, bounded};
use nix::libc;
use tracing::trace;

use crate::error::{Error, Result};
use crate::filter::{self, Insn};
use crate::link;
use crate::reactor::{Reactor, Wake, WakeState};
use crate::supervisor::Shutdown;

/// Receive buffer size. ND frames are small; anything up to the usual link
/// MTU fits with room to spare.
const READ_BUF_SIZE: usize = 2048;

pub struct Socket {
    fd: OwnedFd,
    /// Actual kernel link name (a VLAN declaration resolves to its sub-link).
    pub ifname: String,
    pub index: u32,
    state: Arc<WakeState>,
    reactor: Arc<Reactor>,
    valid: AtomicBool,
}

impl Socket {
    /// Open a raw IPv6 packet socket on the link with the given index.
    pub fn open(reactor: &Arc<Reactor>, ifname: &str, index: u32) -> Result<Socket> {
        let protocol = (libc::ETH_P_IPV6 as u16).to_be();
        let raw = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                i32::from(protocol),
            )
        };
        if raw < 0 {
            return Err(Error::Socket(io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = protocol;
        sll.sll_ifindex = index as i32;
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(Error::Socket(io::Error::last_os_error()));
        }

        let state = Arc::new(WakeState::default());
        reactor.register(fd.as_fd(), Arc::clone(&state))?;

        Ok(Socket {
            fd,
            ifname: ifname.to_string(),
            index,
            state,
            reactor: Arc::clone(reactor),
            valid: AtomicBool::new(true),
        })
    }

    /// Attach a kernel packet filter.
    pub fn apply_filter(&self, program: &[Insn]) -> Result<()> {
        let prog = filter::assemble(program);
        let fprog = libc::sock_fprog {
            len: prog.len() as u16,
            filter: prog.as_ptr() as *mut libc::sock_filter,
        };
        let rc = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                &fprog as *const libc::sock_fprog as *const libc::c_void,
                std::mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(Error::Socket(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// One non-blocking read. `Ok(None)` means would-block.
    pub fn read_immediate(&self) -> Result<Option<Vec<u8>>> {
        if !self.valid.load(Ordering::SeqCst) || self.state.is_closed() {
            return Err(Error::SocketClosed);
        }

        let mut buf = [0u8; READ_BUF_SIZE];
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                self.state.clear_readable();
                return Ok(None);
            }
            return Err(Error::Socket(err));
        }

        // Edge-triggered: peek for queued frames and keep the readable latch
        // set so the next read does not sleep on a wake-up that will not come.
        let peek = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                1,
                libc::MSG_PEEK | libc::MSG_DONTWAIT,
            )
        };
        if peek >= 0 {
            self.state.notify_readable();
        }

        Ok(Some(buf[..n as usize].to_vec()))
    }

    /// Wait for the next frame: try immediately, then block on the reactor
    /// up to `timeout`. Cancellation and reactor-reported closure both
    /// produce definite errors.
    pub fn read_once(&self, timeout: Option<Duration>, shutdown: &Shutdown) -> Result<Vec<u8>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(frame) = self.read_immediate()? {
                return Ok(frame);
            }
            let (tx, rx) = bounded(1);
            self.state.add_waiter(tx.clone());
            let wake = wait_wake(&rx, deadline, shutdown);
            self.state.remove_waiter(&tx);
            match wake? {
                None => {
                    return Err(Error::ReadTimeout(
                        timeout.unwrap_or_default().as_millis() as u64,
                    ));
                }
                Some(Wake::Closed) => return Err(Error::SocketClosed),
                Some(Wake::Readable) => continue,
            }
        }
    }

    /// One write of a complete frame.
    pub fn write_once(&self, frame: &[u8]) -> Result<()> {
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
            )
        };
        if n < 0 {
            return Err(Error::Socket(io::Error::last_os_error()));
        }
        if n as usize != frame.len() {
            return Err(Error::Socket(io::Error::other(format!(
                "short write: {n} of {} bytes",
                frame.len()
            ))));
        }
        Ok(())
    }

    /// Drain the receive queue until would-block.
    pub fn flush_all(&self) -> Result<()> {
        while self.read_immediate()?.is_some() {}
        Ok(())
    }

    /// First fe80::/10 unicast address assigned to the link.
    pub fn link_local(&self) -> Option<Ipv6Addr> {
        link::link_local(&self.ifname)
    }

    /// Hardware address of the link.
    pub fn hardware_addr(&self) -> Option<[u8; 6]> {
        link::hardware_addr(&self.ifname)
    }

    /// Mark invalid, deregister from the reactor and wake any readers.
    /// Idempotent; the descriptor itself is released on drop.
    pub fn close(&self) {
        if self.valid.swap(false, Ordering::SeqCst) {
            trace!(ifname = %self.ifname, "Closing socket");
            self.reactor.deregister(self.fd.as_fd());
            self.state.notify_closed();
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

/// Block until any of the sockets delivers a frame. Closure of one socket
/// keeps the wait going on the remaining set; only when every socket is
/// closed does the call fail with `SocketClosed`.
pub fn read_any(
    socks: &[Arc<Socket>],
    timeout: Option<Duration>,
    shutdown: &Shutdown,
) -> Result<(usize, Vec<u8>)> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let mut any_open = false;
        for (i, sock) in socks.iter().enumerate() {
            match sock.read_immediate() {
                Ok(Some(frame)) => return Ok((i, frame)),
                Ok(None) => any_open = true,
                Err(Error::SocketClosed) => {}
                Err(e) => return Err(e),
            }
        }
        if !any_open {
            return Err(Error::SocketClosed);
        }

        // One round of waiting: register a shared channel on every open
        // socket, sleep, then deregister and rescan.
        let (tx, rx) = bounded(socks.len());
        for sock in socks {
            if !sock.state.is_closed() {
                sock.state.add_waiter(tx.clone());
            }
        }
        let wake = wait_wake(&rx, deadline, shutdown);
        for sock in socks {
            sock.state.remove_waiter(&tx);
        }
        if wake?.is_none() {
            return Err(Error::ReadTimeout(
                timeout.unwrap_or_default().as_millis() as u64,
            ));
        }
        // Either a frame arrived somewhere or a socket closed; rescan.
    }
}

/// Wait for a wake-up, the deadline, or cancellation, whichever first.
/// `Ok(None)` reports that the deadline passed.
fn wait_wake(
    rx: &Receiver<Wake>,
    deadline: Option<Instant>,
    shutdown: &Shutdown,
) -> Result<Option<Wake>> {
    let mut sel = Select::new();
    let wake_idx = sel.recv(rx);
    let stop_idx = sel.recv(shutdown.receiver());

    let op = match deadline {
        Some(deadline) => match sel.select_deadline(deadline) {
            Ok(op) => op,
            Err(_) => return Ok(None),
        },
        None => sel.select(),
    };

    if op.index() == stop_idx {
        let _ = op.recv(shutdown.receiver());
        return Err(Error::Canceled);
    }
    debug_assert_eq!(op.index(), wake_idx);
    op.recv(rx).map(Some).map_err(|_| Error::SocketClosed)
}
