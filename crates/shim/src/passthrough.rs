//! Real-command execution for passthrough spies.
//!
//! The controller never runs the real binary itself; it hands the launcher
//! a lookup path, extra environment, and a timeout, and the launcher
//! reports back what actually happened.

use std::env;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use cmdmox_common::wire::{PassthroughRequest, PassthroughResult};
use cmdmox_common::{paths, real_command_var, Platform};

use crate::ShimContext;

enum Resolution {
    Found(PathBuf),
    NotExecutable(PathBuf),
    NotFound,
}

/// Resolve and run the real command, honoring the request's timeout.
///
/// Resolution failures map to the shell conventions: 127 when nothing was
/// found, 126 when a match exists but is not executable. A timeout yields
/// 124 with a stderr line naming the budget.
pub fn run_real_command(ctx: &ShimContext, request: &PassthroughRequest) -> PassthroughResult {
    match resolve_real_binary(&ctx.command_name, &request.lookup_path) {
        Resolution::Found(binary) => execute(ctx, request, &binary),
        Resolution::NotExecutable(path) => failure(
            request,
            126,
            format!("cmdmox-shim: {}: not executable", path.display()),
        ),
        Resolution::NotFound => failure(
            request,
            127,
            format!("cmdmox-shim: {}: command not found", ctx.command_name),
        ),
    }
}

fn failure(request: &PassthroughRequest, exit_code: i32, message: String) -> PassthroughResult {
    PassthroughResult {
        invocation_id: request.invocation_id.clone(),
        stdout: String::new(),
        stderr: format!("{message}\n"),
        exit_code,
    }
}

/// Locate the real binary: the explicit per-command override variable wins,
/// otherwise the supplied lookup path is searched in order.
fn resolve_real_binary(command: &str, lookup_path: &str) -> Resolution {
    if let Ok(override_path) = env::var(real_command_var(command)) {
        if !override_path.trim().is_empty() {
            let path = PathBuf::from(override_path);
            return if is_executable(&path) {
                Resolution::Found(path)
            } else if path.is_file() {
                Resolution::NotExecutable(path)
            } else {
                Resolution::NotFound
            };
        }
    }

    let platform = Platform::current();
    let mut blocked = None;
    for dir in paths::split_entries(lookup_path, platform) {
        for candidate in candidate_paths(Path::new(&dir), command) {
            if is_executable(&candidate) {
                return Resolution::Found(candidate);
            }
            if blocked.is_none() && candidate.is_file() {
                blocked = Some(candidate);
            }
        }
    }
    match blocked {
        Some(path) => Resolution::NotExecutable(path),
        None => Resolution::NotFound,
    }
}

#[cfg(windows)]
fn candidate_paths(dir: &Path, command: &str) -> Vec<PathBuf> {
    let base = dir.join(command);
    let mut candidates = vec![base.clone()];
    let extensions = env::var("PATHEXT").unwrap_or_else(|_| ".COM;.EXE;.BAT;.CMD".to_string());
    for ext in extensions.split(';') {
        let trimmed = ext.trim().trim_start_matches('.');
        if trimmed.is_empty() {
            continue;
        }
        let mut with_ext = base.clone();
        with_ext.set_extension(trimmed);
        candidates.push(with_ext);
    }
    candidates
}

#[cfg(not(windows))]
fn candidate_paths(dir: &Path, command: &str) -> Vec<PathBuf> {
    vec![dir.join(command)]
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(path) {
            Ok(metadata) => metadata.is_file() && metadata.permissions().mode() & 0o111 != 0,
            Err(_) => false,
        }
    }
    #[cfg(windows)]
    {
        path.is_file()
    }
}

fn execute(ctx: &ShimContext, request: &PassthroughRequest, binary: &Path) -> PassthroughResult {
    let mut command = Command::new(binary);
    command
        .args(&ctx.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // The captured environment is the baseline; expectation-declared
    // overrides win on conflict.
    command.env_clear();
    command.envs(&ctx.env);
    command.envs(&request.extra_env);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            return failure(
                request,
                126,
                format!("cmdmox-shim: failed to spawn {}: {err}", binary.display()),
            )
        }
    };

    let stdin_writer = child.stdin.take().map(|mut pipe| {
        let bytes = ctx.stdin.clone().into_bytes();
        thread::spawn(move || {
            let _ = pipe.write_all(&bytes);
        })
    });
    let stdout_reader = child.stdout.take().map(collect_pipe);
    let stderr_reader = child.stderr.take().map(collect_pipe);

    let timeout = request.timeout_duration();
    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if !timeout.is_zero() && Instant::now() >= deadline {
                    timed_out = true;
                    let _ = child.kill();
                    break child.wait().ok();
                }
                thread::sleep(Duration::from_millis(10));
            }
            Err(_) => break child.wait().ok(),
        }
    };

    if let Some(writer) = stdin_writer {
        let _ = writer.join();
    }
    let stdout = join_pipe(stdout_reader);
    let mut stderr = join_pipe(stderr_reader);

    if timed_out {
        stderr.push_str(&format!(
            "cmdmox-shim: passthrough timed out after {}s\n",
            request.timeout
        ));
        return PassthroughResult {
            invocation_id: request.invocation_id.clone(),
            stdout,
            stderr,
            exit_code: 124,
        };
    }

    PassthroughResult {
        invocation_id: request.invocation_id.clone(),
        stdout,
        stderr,
        exit_code: status.map(exit_code_of).unwrap_or(1),
    }
}

fn collect_pipe<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        let _ = pipe.read_to_end(&mut bytes);
        bytes
    })
}

fn join_pipe(handle: Option<thread::JoinHandle<Vec<u8>>>) -> String {
    let bytes = handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(1)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::BTreeMap;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn context(command: &str, args: &[&str], stdin: &str) -> ShimContext {
        ShimContext {
            command_name: command.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            stdin: stdin.to_string(),
            env: BTreeMap::new(),
            invocation_id: "inv-test".to_string(),
        }
    }

    fn request(dir: &Path, timeout: f64) -> PassthroughRequest {
        PassthroughRequest {
            invocation_id: "inv-test".to_string(),
            lookup_path: dir.to_string_lossy().into_owned(),
            extra_env: BTreeMap::new(),
            timeout,
        }
    }

    #[test]
    fn runs_real_binary_with_args_and_stdin() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "combine", "#!/bin/sh\necho \"arg:$1\"\ncat\n");

        let ctx = context("combine", &["alpha"], "from-stdin\n");
        let result = run_real_command(&ctx, &request(dir.path(), 5.0));
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "arg:alpha\nfrom-stdin\n");
        assert!(result.stderr.is_empty());
    }

    #[test]
    fn missing_binary_exits_127() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context("does-not-exist", &[], "");
        let result = run_real_command(&ctx, &request(dir.path(), 5.0));
        assert_eq!(result.exit_code, 127);
        assert!(result.stderr.contains("not found"));
    }

    #[test]
    fn non_executable_target_exits_126() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("blocked"), "not a program").unwrap();

        let ctx = context("blocked", &[], "");
        let result = run_real_command(&ctx, &request(dir.path(), 5.0));
        assert_eq!(result.exit_code, 126);
        assert!(result.stderr.contains("not executable"));
    }

    #[test]
    fn timeout_kills_child_and_exits_124() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "slow", "#!/bin/sh\nsleep 5\n");

        let ctx = context("slow", &[], "");
        let result = run_real_command(&ctx, &request(dir.path(), 0.2));
        assert_eq!(result.exit_code, 124);
        assert!(result.stderr.contains("timed out after 0.2s"));
    }

    #[test]
    #[serial]
    fn override_variable_wins_over_lookup_path() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        write_script(dir.path(), "tool", "#!/bin/sh\necho from-lookup\n");
        let real = write_script(other.path(), "real-tool", "#!/bin/sh\necho from-override\n");

        env::set_var(real_command_var("tool"), &real);
        let ctx = context("tool", &[], "");
        let result = run_real_command(&ctx, &request(dir.path(), 5.0));
        env::remove_var(real_command_var("tool"));

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "from-override\n");
    }

    #[test]
    fn expectation_env_wins_over_captured_env() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "show", "#!/bin/sh\necho \"$MARKER\"\n");

        let mut ctx = context("show", &[], "");
        ctx.env
            .insert("MARKER".to_string(), "from-capture".to_string());
        let mut req = request(dir.path(), 5.0);
        req.extra_env
            .insert("MARKER".to_string(), "from-expectation".to_string());

        let result = run_real_command(&ctx, &req);
        assert_eq!(result.stdout, "from-expectation\n");
    }
}
