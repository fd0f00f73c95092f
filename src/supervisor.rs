//! Worker supervision: shared cancellation and restart with backoff.
//!
//! Workers run on named threads. A worker returning an error is restarted
//! after a 10 second cancellation-aware holdoff; configuration errors and
//! panics are fatal to the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// How long a failed worker waits before restarting.
const RESTART_BACKOFF: Duration = Duration::from_secs(10);

/// Root cancellation token. Cloning shares the token; `receiver()` yields a
/// channel that becomes ready once the token fires, for use in selects.
#[derive(Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    tx: Arc<Mutex<Option<Sender<()>>>>,
    rx: Receiver<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        // Nothing is ever sent; dropping the sender is what makes the
        // receiver permanently ready.
        let (tx, rx) = bounded::<()>(0);
        Shutdown {
            flag: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(Mutex::new(Some(tx))),
            rx,
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.tx.lock().unwrap().take();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }

    /// Sleep for `duration`, returning `true` when shutdown fired first.
    pub fn sleep(&self, duration: Duration) -> bool {
        !matches!(self.rx.recv_timeout(duration), Err(RecvTimeoutError::Timeout))
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

struct WorkerExit {
    name: &'static str,
    result: Result<()>,
}

/// Spawns supervised workers and waits for them.
pub struct Supervisor {
    shutdown: Shutdown,
    exit_tx: Sender<WorkerExit>,
    exit_rx: Receiver<WorkerExit>,
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

impl Supervisor {
    pub fn new(shutdown: Shutdown) -> Self {
        let (exit_tx, exit_rx) = unbounded();
        Supervisor {
            shutdown,
            exit_tx,
            exit_rx,
            workers: Vec::new(),
        }
    }

    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Spawn a worker under the restart policy. `work` runs one attempt and
    /// returns on failure or cancellation.
    pub fn spawn<F>(&mut self, name: &'static str, mut work: F) -> Result<()>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        let exit_tx = self.exit_tx.clone();
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let result = loop {
                    match work() {
                        Ok(()) => break Ok(()),
                        Err(e) if e.is_canceled() || shutdown.is_triggered() => break Ok(()),
                        Err(e @ Error::Config(_)) => break Err(e),
                        Err(e) => {
                            error!(worker = name, error = %e, "Worker failed");
                            warn!(worker = name, "Waiting 10s to avoid error bursting");
                            if shutdown.sleep(RESTART_BACKOFF) {
                                break Ok(());
                            }
                        }
                    }
                };
                let _ = exit_tx.send(WorkerExit { name, result });
            })
            .map_err(Error::Socket)?;
        self.workers.push((name, handle));
        Ok(())
    }

    /// Wait for all workers. A fatal worker error triggers shutdown and a
    /// non-zero exit code; panics count as fatal too.
    pub fn run(mut self) -> i32 {
        let mut code = 0;
        let mut remaining = self.workers.len();
        while remaining > 0 {
            let Ok(exit) = self.exit_rx.recv() else { break };
            remaining -= 1;
            match exit.result {
                Ok(()) => info!(worker = exit.name, "Worker stopped"),
                Err(e) => {
                    error!(worker = exit.name, error = %e, "Worker failed fatally");
                    code = 1;
                    self.shutdown.trigger();
                }
            }
        }
        for (name, handle) in self.workers.drain(..) {
            if handle.join().is_err() {
                error!(worker = name, "Worker thread panicked");
                code = 1;
            }
        }
        code
    }
}

/// Route SIGINT/SIGTERM into the cancellation token.
pub fn install_signals(shutdown: &Shutdown) -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(Error::Socket)?;
    let shutdown = shutdown.clone();
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal, "Received termination signal, shutting down");
                shutdown.trigger();
            }
        })
        .map_err(Error::Socket)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn sleep_returns_early_after_trigger() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.sleep(Duration::from_millis(1)));

        shutdown.trigger();
        assert!(shutdown.is_triggered());
        // Permanently ready: no 10 s wait here.
        assert!(shutdown.sleep(Duration::from_secs(10)));
        assert!(shutdown.sleep(Duration::from_secs(10)));
    }

    #[test]
    fn receiver_becomes_ready_on_trigger() {
        let shutdown = Shutdown::new();
        assert!(shutdown.receiver().try_recv().is_err());
        shutdown.trigger();
        // A closed channel is always ready for selects.
        assert!(
            shutdown
                .receiver()
                .recv_timeout(Duration::from_millis(10))
                .is_err()
        );
    }

    #[test]
    fn clean_worker_exit_is_code_zero() {
        let mut sup = Supervisor::new(Shutdown::new());
        sup.spawn("noop", || Ok(())).unwrap();
        assert_eq!(sup.run(), 0);
    }

    #[test]
    fn config_errors_are_fatal() {
        let mut sup = Supervisor::new(Shutdown::new());
        sup.spawn("bad", || Err(Error::Config("broken".into())))
            .unwrap();
        assert_eq!(sup.run(), 1);
    }

    #[test]
    fn canceled_workers_exit_cleanly() {
        let shutdown = Shutdown::new();
        let mut sup = Supervisor::new(shutdown.clone());
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();
        sup.spawn("canceled", move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(Error::Canceled)
        })
        .unwrap();
        assert_eq!(sup.run(), 0);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
