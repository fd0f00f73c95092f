//! Error types for the companion daemon.

use std::io;
use thiserror::Error;

/// Main error type for companion operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Socket I/O failed: {0}")]
    Socket(#[source] io::Error),

    #[error("The socket has been closed")]
    SocketClosed,

    #[error("Read timed out after {0} ms")]
    ReadTimeout(u64),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Interface '{0}' could not be resolved: {1}")]
    Link(String, String),

    #[error("Netlink operation failed: {0}")]
    Netlink(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Router board request failed: {0}")]
    Board(String),

    #[error("Canceled by shutdown")]
    Canceled,
}

impl Error {
    /// Whether this error means the root cancellation fired, as opposed to
    /// a failure the supervisor should back off and restart from.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Socket(e)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::Socket(io::Error::from_raw_os_error(e as i32))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
