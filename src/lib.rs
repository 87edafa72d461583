//! cmdmox — record/replay/verify test doubles for external commands.
//!
//! Declare how `git`, `curl`, or any other executable should behave; the
//! controller intercepts every invocation the code under test makes via
//! PATH shims, supplies the scripted behavior, records the interaction,
//! and verifies the observed calls against the declared expectations.
//!
//! ```no_run
//! use cmdmox::CmdMox;
//!
//! # fn main() -> Result<(), cmdmox::MoxError> {
//! let mut mox = CmdMox::new()?;
//! mox.enter()?;
//! mox.stub("hi")?.returns("hello\n", "", 0);
//! mox.replay()?;
//! // run the code under test; `hi` now prints "hello"
//! mox.verify()?;
//! # Ok(())
//! # }
//! ```
//!
//! The matching engine, verifier, and lifecycle live in `cmdmox-core`;
//! the universal launcher that impersonates commands is the
//! `cmdmox-shim` binary built from this package.

pub use cmdmox_core::{
    ArgMatcher, CmdMox, CommandHandle, CommandOutput, CommandResponse, Config, DoubleKind,
    Invocation, JournalEntry, MoxError, Phase, StdinMatcher, ValueType, VerificationReport,
};
