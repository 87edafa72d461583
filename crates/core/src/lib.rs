//! Controller, matcher and verifier for cmdmox command doubles.
//!
//! The lifecycle is record → replay → verify: declare how external
//! commands should behave, let the code under test run them against
//! PATH shims, then check that the observed calls matched the declared
//! expectations.
//!
//! ```no_run
//! use cmdmox_core::CmdMox;
//!
//! # fn main() -> Result<(), cmdmox_core::MoxError> {
//! let mut mox = CmdMox::new()?;
//! mox.enter()?;
//! mox.mock("git")?.with_args(["clone", "repo"]).returns("", "", 0);
//! mox.replay()?;
//! // ... run the code under test ...
//! mox.verify()?;
//! # Ok(())
//! # }
//! ```

mod controller;
mod doubles;
mod environment;
mod error;
mod journal;
mod matchers;
mod passthrough;
mod record;
mod replay;
mod shims;
mod verify;

pub use controller::{CmdMox, CommandHandle, Config, Phase};
pub use doubles::{CommandOutput, DoubleKind};
pub use error::{MoxError, VerificationReport};
pub use journal::JournalEntry;
pub use matchers::{ArgMatcher, StdinMatcher, ValueType};

// The invocation record is part of the handler and journal API surface.
pub use cmdmox_common::wire::{CommandResponse, Invocation};
