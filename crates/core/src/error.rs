//! Error taxonomy for the controller side.

use std::fmt;

use cmdmox_common::wire::ProtocolError;
use cmdmox_ipc::TransportError;
use thiserror::Error;

/// Failures surfaced by the controller API.
#[derive(Debug, Error)]
pub enum MoxError {
    /// An operation was called in the wrong phase (e.g. `verify` before
    /// `replay`).
    #[error("lifecycle error: {0}")]
    Lifecycle(String),
    /// Replay-time work was attempted without a live environment.
    #[error("environment not ready: {0}")]
    MissingEnvironment(String),
    /// Invalid registration or controller configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Aggregate of every discrepancy the verifier found.
    #[error("verification failed\n{0}")]
    Verification(VerificationReport),
}

/// The verifier's findings, one section per sub-verifier.
#[derive(Debug, Default)]
pub struct VerificationReport {
    /// Journal entries that matched no expectation.
    pub unexpected: Vec<String>,
    /// Ordered expectations satisfied out of declaration order.
    pub misordered: Vec<String>,
    /// Expectations called too few or too many times.
    pub unfulfilled: Vec<String>,
    /// Recording sessions that could not be finalized.
    pub recording: Vec<String>,
}

impl VerificationReport {
    pub fn is_empty(&self) -> bool {
        self.unexpected.is_empty()
            && self.misordered.is_empty()
            && self.unfulfilled.is_empty()
            && self.recording.is_empty()
    }

    pub(crate) fn into_result(self) -> Result<(), MoxError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(MoxError::Verification(self))
        }
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut write_section = |title: &str, items: &[String]| -> fmt::Result {
            if items.is_empty() {
                return Ok(());
            }
            writeln!(f, "{title}:")?;
            for item in items {
                writeln!(f, "  - {item}")?;
            }
            Ok(())
        };
        write_section("unexpected commands", &self.unexpected)?;
        write_section("ordering violations", &self.misordered)?;
        write_section("unfulfilled expectations", &self.unfulfilled)?;
        write_section("recording failures", &self.recording)
    }
}
