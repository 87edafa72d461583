//! Bidirectional JSON message channel between controller and launchers.
//!
//! One logical endpoint path is shared by both sides: on POSIX it is a Unix
//! domain socket bound at that path, on Windows it is a duplex named pipe
//! whose name is derived deterministically by hashing the same path. The
//! controller runs the asynchronous [`IpcServer`]; every launcher is a
//! short-lived synchronous [`IpcClient`] that sends one invocation, waits
//! for its response, and (for passthrough) reports back once more on the
//! same connection.
//!
//! Framing is newline-delimited single-line JSON; see
//! [`cmdmox_common::wire`] for the message kinds.

mod client;
mod endpoint;
mod server;

pub use client::{ClientConfig, IpcClient};
pub use endpoint::Endpoint;
pub use server::{IpcServer, MessageHandler, ServerConfig};

use std::io;
use std::time::Duration;

use cmdmox_common::wire::ProtocolError;
use thiserror::Error;

/// Transport-level failure: connect, send, receive, timeout, or framing.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind endpoint {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("could not connect to {endpoint} after {attempts} attempts: {source}")]
    Connect {
        endpoint: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("endpoint {endpoint} did not become ready within {waited:?}")]
    NotReady { endpoint: String, waited: Duration },
    #[error("transport i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("peer sent an unexpected message kind: {0}")]
    UnexpectedMessage(&'static str),
    #[error("connection closed before a response arrived")]
    Disconnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl TransportError {
    /// Map an I/O error from a timed read/write to [`TransportError::Timeout`]
    /// when the error kind indicates the deadline fired.
    pub(crate) fn from_timed_io(err: io::Error, timeout: Duration) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::Timeout(timeout),
            _ => Self::Io(err),
        }
    }
}
