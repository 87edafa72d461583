//! Launcher execution context: command identity, captured argv, stdin and
//! environment snapshot.

use std::collections::BTreeMap;
use std::env;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use cmdmox_common::wire::Invocation;
use cmdmox_common::{Platform, INVOKED_AS_VAR, IPC_SOCKET_VAR, IPC_TIMEOUT_VAR};
use cmdmox_ipc::{ClientConfig, Endpoint};

/// Everything captured before the launcher talks to the controller.
#[derive(Debug)]
pub struct ShimContext {
    /// The command name this launcher was invoked as (e.g. `git`).
    pub command_name: String,
    /// Arguments after the program name, batch-unescaped on Windows.
    pub args: Vec<String>,
    /// Piped stdin, or empty when stdin is a terminal.
    pub stdin: String,
    /// Shallow snapshot of the process environment at call time.
    pub env: BTreeMap<String, String>,
    /// Fresh unique token for this call.
    pub invocation_id: String,
}

impl ShimContext {
    /// Capture the current process state.
    pub fn from_environment() -> Result<Self> {
        let platform = Platform::current();
        let command_name = detect_command_name(platform)?;

        let mut args: Vec<String> = env::args_os()
            .skip(1)
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        if platform == Platform::Windows {
            for arg in &mut args {
                *arg = collapse_batch_escapes(arg);
            }
        }

        let stdin = read_piped_stdin()?;
        let env = env::vars_os()
            .map(|(key, value)| {
                (
                    key.to_string_lossy().into_owned(),
                    value.to_string_lossy().into_owned(),
                )
            })
            .collect();

        Ok(Self {
            command_name,
            args,
            stdin,
            env,
            invocation_id: uuid::Uuid::now_v7().to_string(),
        })
    }

    /// The transport endpoint published by the controller.
    pub fn endpoint(&self) -> Result<Endpoint> {
        let path = self
            .env
            .get(IPC_SOCKET_VAR)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                anyhow!("{IPC_SOCKET_VAR} is not set; is a cmdmox controller replaying?")
            })?;
        Ok(Endpoint::new(path))
    }

    /// Client settings, honoring the published timeout override.
    pub fn client_config(&self) -> Result<ClientConfig> {
        let Some(raw) = self.env.get(IPC_TIMEOUT_VAR) else {
            return Ok(ClientConfig::default());
        };
        let seconds: f64 = raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {IPC_TIMEOUT_VAR} value {raw:?}"))?;
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(anyhow!(
                "{IPC_TIMEOUT_VAR} must be a positive finite number of seconds (got {raw:?})"
            ));
        }
        Ok(ClientConfig::with_timeout(Duration::from_secs_f64(seconds)))
    }

    /// Build the wire invocation for this call.
    pub fn invocation(&self) -> Invocation {
        Invocation::new(
            self.invocation_id.clone(),
            self.command_name.clone(),
            self.args.clone(),
            self.stdin.clone(),
            self.env.clone(),
        )
    }
}

/// Recover the command identity.
///
/// The Windows batch trampoline exports `CMDMOX_INVOKED_AS` because a `.cmd`
/// file cannot control the launcher's argv[0]; everywhere else argv[0] is
/// authoritative. Extensions are stripped on Windows so `git.cmd` and
/// `git.exe` both mean `git`.
fn detect_command_name(platform: Platform) -> Result<String> {
    if let Ok(invoked_as) = env::var(INVOKED_AS_VAR) {
        if !invoked_as.trim().is_empty() {
            return Ok(command_name_from_path(&invoked_as, platform));
        }
    }

    let argv0 = env::args_os()
        .next()
        .ok_or_else(|| anyhow!("argv is empty; cannot determine command identity"))?;
    let argv0 = argv0.to_string_lossy();
    if argv0.is_empty() {
        return Err(anyhow!("argv[0] is empty; cannot determine command identity"));
    }
    Ok(command_name_from_path(&argv0, platform))
}

fn command_name_from_path(raw: &str, platform: Platform) -> String {
    let path = Path::new(raw);
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| raw.to_string());
    if platform == Platform::Windows {
        if let Some((stem, _ext)) = name.rsplit_once('.') {
            if !stem.is_empty() {
                return stem.to_string();
            }
        }
    }
    name
}

/// Undo one layer of cmd.exe escaping: each `^^` collapses to `^`.
fn collapse_batch_escapes(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut chars = arg.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '^' && chars.peek() == Some(&'^') {
            chars.next();
        }
        out.push(ch);
    }
    out
}

/// Read stdin to EOF as UTF-8 with replacement, but only when it is not a
/// terminal; reading an interactive console would hang the test.
fn read_piped_stdin() -> Result<String> {
    if atty::is(atty::Stream::Stdin) {
        return Ok(String::new());
    }
    let mut bytes = Vec::new();
    std::io::stdin()
        .read_to_end(&mut bytes)
        .context("reading piped stdin")?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmdmox_common::PLATFORM_OVERRIDE_VAR;
    use serial_test::serial;

    #[test]
    fn command_name_keeps_extension_on_posix() {
        assert_eq!(
            command_name_from_path("/opt/shims/tool.sh", Platform::Posix),
            "tool.sh"
        );
        assert_eq!(command_name_from_path("/opt/shims/git", Platform::Posix), "git");
    }

    #[test]
    fn command_name_strips_extension_on_windows() {
        assert_eq!(
            command_name_from_path(r"C:\shims\git.cmd", Platform::Windows),
            "git"
        );
        assert_eq!(
            command_name_from_path(r"C:\shims\git.exe", Platform::Windows),
            "git"
        );
        // A bare dotfile-style name keeps its text rather than vanishing.
        assert_eq!(command_name_from_path(r".hidden", Platform::Windows), ".hidden");
    }

    #[test]
    fn collapse_batch_escapes_halves_caret_runs() {
        assert_eq!(collapse_batch_escapes("a^^b"), "a^b");
        assert_eq!(collapse_batch_escapes("^^^^"), "^^");
        assert_eq!(collapse_batch_escapes("plain"), "plain");
        assert_eq!(collapse_batch_escapes("^"), "^");
    }

    #[test]
    #[serial]
    fn invoked_as_variable_wins() {
        env::set_var(PLATFORM_OVERRIDE_VAR, "windows");
        env::set_var(INVOKED_AS_VAR, r"C:\temp\shims\curl.cmd");
        let name = detect_command_name(Platform::current()).unwrap();
        assert_eq!(name, "curl");
        env::remove_var(INVOKED_AS_VAR);
        env::remove_var(PLATFORM_OVERRIDE_VAR);
    }

    #[test]
    #[serial]
    fn endpoint_requires_socket_variable() {
        let ctx = ShimContext {
            command_name: "git".to_string(),
            args: vec![],
            stdin: String::new(),
            env: BTreeMap::new(),
            invocation_id: "inv".to_string(),
        };
        let err = ctx.endpoint().unwrap_err();
        assert!(err.to_string().contains(IPC_SOCKET_VAR));
    }

    #[test]
    fn client_config_rejects_nonpositive_timeout() {
        let mut env = BTreeMap::new();
        env.insert(IPC_TIMEOUT_VAR.to_string(), "0".to_string());
        let ctx = ShimContext {
            command_name: "git".to_string(),
            args: vec![],
            stdin: String::new(),
            env,
            invocation_id: "inv".to_string(),
        };
        assert!(ctx.client_config().is_err());
    }

    #[test]
    fn client_config_parses_fractional_seconds() {
        let mut env = BTreeMap::new();
        env.insert(IPC_TIMEOUT_VAR.to_string(), "2.5".to_string());
        let ctx = ShimContext {
            command_name: "git".to_string(),
            args: vec![],
            stdin: String::new(),
            env,
            invocation_id: "inv".to_string(),
        };
        let config = ctx.client_config().unwrap();
        assert_eq!(config.timeout, Duration::from_secs_f64(2.5));
    }
}
