//! The universal cmdmox launcher binary.
//!
//! The controller links this binary under every mocked command name inside
//! its shim directory; PATH resolution brings invocations here, and the
//! library forwards them to the controller over IPC.

use std::process::ExitCode;

use cmdmox_shim::run_shim;

fn main() -> ExitCode {
    match run_shim() {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(err) => {
            eprintln!("cmdmox-shim: {err:#}");
            ExitCode::from(125)
        }
    }
}
