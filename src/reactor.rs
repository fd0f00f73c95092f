//! Process-wide readiness reactor for the raw link sockets.
//!
//! One dedicated thread runs epoll in edge-triggered mode and forwards
//! readiness to blocked readers through per-socket wake state:
//! `EPOLLERR`/`EPOLLHUP` mark the socket closed and wake every waiter,
//! `EPOLLIN` wakes the next waiter or latches a readable flag for the next
//! reader. Spurious wake-ups are allowed; readers re-try their reads.

use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::Sender;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use tracing::{trace, warn};

use crate::error::{Error, Result};

/// What a waiter is woken with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Readable,
    Closed,
}

#[derive(Default)]
struct WakeQueue {
    readable: bool,
    closed: bool,
    waiters: VecDeque<Sender<Wake>>,
}

/// Per-socket wake state shared between the reactor thread and readers.
#[derive(Default)]
pub struct WakeState {
    queue: Mutex<WakeQueue>,
}

impl WakeState {
    pub fn is_closed(&self) -> bool {
        self.queue.lock().unwrap().closed
    }

    /// Wake the next waiter, or latch the readable flag when nobody waits.
    pub(crate) fn notify_readable(&self) {
        let mut q = self.queue.lock().unwrap();
        while let Some(tx) = q.waiters.pop_front() {
            if tx.try_send(Wake::Readable).is_ok() {
                return;
            }
        }
        q.readable = true;
    }

    /// Mark closed and wake every waiter.
    pub(crate) fn notify_closed(&self) {
        let mut q = self.queue.lock().unwrap();
        q.closed = true;
        for tx in q.waiters.drain(..) {
            let _ = tx.try_send(Wake::Closed);
        }
    }

    /// The socket reported would-block; drop the readable latch.
    pub(crate) fn clear_readable(&self) {
        self.queue.lock().unwrap().readable = false;
    }

    /// Register a waiter. Latched readiness or closure is delivered
    /// immediately instead of queueing.
    pub(crate) fn add_waiter(&self, tx: Sender<Wake>) {
        let mut q = self.queue.lock().unwrap();
        if q.closed {
            let _ = tx.try_send(Wake::Closed);
        } else if q.readable {
            q.readable = false;
            let _ = tx.try_send(Wake::Readable);
        } else {
            q.waiters.push_back(tx);
        }
    }

    pub(crate) fn remove_waiter(&self, tx: &Sender<Wake>) {
        self.queue
            .lock()
            .unwrap()
            .waiters
            .retain(|w| !w.same_channel(tx));
    }
}

/// The epoll loop and the fd-to-socket table it serves.
pub struct Reactor {
    epoll: Epoll,
    table: Mutex<HashMap<RawFd, Arc<WakeState>>>,
}

impl Reactor {
    pub fn new() -> Result<Arc<Reactor>> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Arc::new(Reactor {
            epoll,
            table: Mutex::new(HashMap::new()),
        }))
    }

    /// Start the reactor thread. It runs for the life of the process.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let reactor = Arc::clone(self);
        thread::Builder::new()
            .name("reactor".into())
            .spawn(move || reactor.run())
            .map_err(Error::Socket)?;
        Ok(())
    }

    fn run(&self) {
        let mut events = [EpollEvent::empty(); 32];
        loop {
            let n = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    warn!(error = %e, "epoll_wait failed");
                    continue;
                }
            };
            for event in &events[..n] {
                let fd = event.data() as RawFd;
                let state = {
                    let table = self.table.lock().unwrap();
                    table.get(&fd).cloned()
                };
                let Some(state) = state else { continue };

                let flags = event.events();
                if flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
                    trace!(fd, "Reactor: socket closed by kernel");
                    state.notify_closed();
                }
                if flags.contains(EpollFlags::EPOLLIN) {
                    trace!(fd, "Reactor: socket readable");
                    state.notify_readable();
                }
            }
        }
    }

    pub(crate) fn register(&self, fd: impl AsFd, state: Arc<WakeState>) -> Result<()> {
        let raw = fd.as_fd().as_raw_fd();
        let mut table = self.table.lock().unwrap();
        if !table.contains_key(&raw) {
            self.epoll.add(
                fd,
                EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLET, raw as u64),
            )?;
        }
        table.insert(raw, state);
        Ok(())
    }

    pub(crate) fn deregister(&self, fd: impl AsFd) {
        let raw = fd.as_fd().as_raw_fd();
        if self.table.lock().unwrap().remove(&raw).is_none() {
            return;
        }
        if let Err(e) = self.epoll.delete(fd) {
            warn!(fd = raw, error = %e, "EPOLL_CTL_DEL failed");
        }
    }
}
