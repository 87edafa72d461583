//! The IPC rendezvous point.
//!
//! Both sides agree on a single logical path (the socket file inside the
//! shim directory). POSIX binds a Unix socket there; Windows hashes the
//! path into a named-pipe name, so launchers carry no platform branch —
//! they read the same environment variable everywhere.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// A logical endpoint path plus its platform-specific address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    logical: PathBuf,
}

impl Endpoint {
    pub fn new(logical: impl Into<PathBuf>) -> Self {
        Self {
            logical: logical.into(),
        }
    }

    /// The logical path exported as `CMDMOX_IPC_SOCKET`.
    pub fn logical_path(&self) -> &Path {
        &self.logical
    }

    /// Derived named-pipe name, stable for a given logical path.
    pub fn pipe_name(&self) -> String {
        let digest = Sha256::digest(self.logical.to_string_lossy().as_bytes());
        let mut short = String::with_capacity(16);
        for byte in digest.iter().take(8) {
            short.push_str(&format!("{byte:02x}"));
        }
        format!(r"\\.\pipe\cmdmox-{short}")
    }

    /// The address actually dialed on this host.
    #[cfg(unix)]
    pub fn address(&self) -> String {
        self.logical.to_string_lossy().into_owned()
    }

    /// The address actually dialed on this host.
    #[cfg(windows)]
    pub fn address(&self) -> String {
        self.pipe_name()
    }
}
