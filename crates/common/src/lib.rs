//! Shared conventions for cmdmox components.
//!
//! Everything that both sides of the shim boundary must agree on lives here:
//! the environment variable names published to launchers, the wire message
//! types exchanged over the IPC channel, PATH manipulation helpers, platform
//! detection, and the secret-redaction lexicon used in diagnostics.

pub mod paths;
pub mod platform;
pub mod redact;
pub mod wire;

pub use platform::Platform;
pub use wire::{
    CommandResponse, Invocation, PassthroughRequest, PassthroughResult, ProtocolError, WireMessage,
};

/// Logical transport endpoint path published to launchers.
pub const IPC_SOCKET_VAR: &str = "CMDMOX_IPC_SOCKET";
/// Client-side per-operation timeout in seconds (positive finite float).
pub const IPC_TIMEOUT_VAR: &str = "CMDMOX_IPC_TIMEOUT";
/// Advisory override of the detected platform (testing aid).
pub const PLATFORM_OVERRIDE_VAR: &str = "CMDMOX_PLATFORM_OVERRIDE";
/// Explicit path to the launcher binary, consulted before auto-discovery.
pub const SHIM_BIN_VAR: &str = "CMDMOX_SHIM_BIN";
/// Set by the Windows batch trampoline so the launcher can recover the
/// command identity its `%~f0` carried; unused on POSIX.
pub const INVOKED_AS_VAR: &str = "CMDMOX_INVOKED_AS";

/// Prefix for per-command real-binary overrides used by passthrough spies.
pub const REAL_COMMAND_PREFIX: &str = "CMDMOX_REAL_COMMAND_";

/// Default client-side IPC timeout when `CMDMOX_IPC_TIMEOUT` is unset.
pub const DEFAULT_IPC_TIMEOUT_SECS: f64 = 5.0;
/// Default wall-clock budget for a passthrough execution.
pub const DEFAULT_PASSTHROUGH_TIMEOUT_SECS: f64 = 30.0;

/// Name of the endpoint file created inside the shim directory on POSIX.
pub const SOCKET_FILE_NAME: &str = "ipc.sock";

/// Environment variable naming the real binary for `command`.
///
/// The command name is uppercased and every non-alphanumeric byte maps to
/// `_`, so `git-lfs` becomes `CMDMOX_REAL_COMMAND_GIT_LFS`.
pub fn real_command_var(command: &str) -> String {
    let mut name = String::with_capacity(REAL_COMMAND_PREFIX.len() + command.len());
    name.push_str(REAL_COMMAND_PREFIX);
    for ch in command.chars() {
        if ch.is_ascii_alphanumeric() {
            name.push(ch.to_ascii_uppercase());
        } else {
            name.push('_');
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_command_var_uppercases_and_mangles() {
        assert_eq!(real_command_var("git"), "CMDMOX_REAL_COMMAND_GIT");
        assert_eq!(real_command_var("git-lfs"), "CMDMOX_REAL_COMMAND_GIT_LFS");
        assert_eq!(real_command_var("a.b c"), "CMDMOX_REAL_COMMAND_A_B_C");
    }
}
