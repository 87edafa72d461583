//! Per-command launcher entries inside the shim directory.
//!
//! One universal launcher binary serves every command: POSIX gets a
//! symlink per command name, Windows gets a small `.cmd` trampoline.
//! Generation is idempotent and repairs broken or missing entries.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use cmdmox_common::Platform;
use tracing::debug;

use crate::error::MoxError;

/// Populate `shim_dir` with one entry per command, all resolving to
/// `launcher`.
pub(crate) fn generate_shims(
    shim_dir: &Path,
    launcher: &Path,
    commands: &[String],
) -> Result<(), MoxError> {
    let platform = Platform::current();
    validate_commands(commands, platform)?;

    if platform == Platform::Posix {
        ensure_launcher_executable(launcher)?;
    }

    for command in commands {
        match platform {
            Platform::Posix => link_command(shim_dir, launcher, command)?,
            Platform::Windows => write_trampoline(shim_dir, launcher, command)?,
        }
        debug!(command, shim_dir = %shim_dir.display(), "shim entry ready");
    }
    Ok(())
}

fn validate_commands(commands: &[String], platform: Platform) -> Result<(), MoxError> {
    let mut seen = HashSet::new();
    for command in commands {
        if command.trim().is_empty() {
            return Err(MoxError::Configuration(
                "command name must not be empty".to_string(),
            ));
        }
        if command.contains('/') || command.contains('\\') {
            return Err(MoxError::Configuration(format!(
                "command name {command:?} must not contain path separators"
            )));
        }
        if !seen.insert(platform.fold_case(command)) {
            return Err(MoxError::Configuration(format!(
                "command name {command:?} conflicts with another declaration \
                 under this host's case semantics"
            )));
        }
    }
    Ok(())
}

#[cfg(unix)]
fn ensure_launcher_executable(launcher: &Path) -> Result<(), MoxError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(launcher)?;
    let mut permissions = metadata.permissions();
    if permissions.mode() & 0o111 == 0 {
        permissions.set_mode(permissions.mode() | 0o755);
        fs::set_permissions(launcher, permissions)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_launcher_executable(_launcher: &Path) -> Result<(), MoxError> {
    Ok(())
}

#[cfg(unix)]
fn link_command(shim_dir: &Path, launcher: &Path, command: &str) -> Result<(), MoxError> {
    let link = shim_dir.join(command);
    match fs::symlink_metadata(&link) {
        Ok(_) => {
            if matches!(fs::read_link(&link).map(|target| target == launcher), Ok(true)) {
                return Ok(());
            }
            fs::remove_file(&link)?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    std::os::unix::fs::symlink(launcher, &link)?;
    Ok(())
}

#[cfg(not(unix))]
fn link_command(_shim_dir: &Path, _launcher: &Path, command: &str) -> Result<(), MoxError> {
    Err(MoxError::Configuration(format!(
        "posix symlink shims are not available on this host (command {command:?}); \
         unset CMDMOX_PLATFORM_OVERRIDE"
    )))
}

fn write_trampoline(shim_dir: &Path, launcher: &Path, command: &str) -> Result<(), MoxError> {
    let path = shim_dir.join(format!("{command}.cmd"));
    fs::write(&path, trampoline_script(launcher))?;
    Ok(())
}

/// The `.cmd` body. CRLF endings regardless of host; `^` and `%` in the
/// launcher path are escaped one batch layer; arguments forward via `%*`.
/// `%~f0` is the trampoline's own invocation path, exported so the
/// launcher can recover the command identity.
fn trampoline_script(launcher: &Path) -> String {
    let escaped = batch_escape(&launcher.to_string_lossy());
    format!(
        "@echo off\r\n\
         set \"CMDMOX_INVOKED_AS=%~f0\"\r\n\
         \"{escaped}\" %*\r\n\
         exit /b %ERRORLEVEL%\r\n"
    )
}

fn batch_escape(text: &str) -> String {
    text.replace('^', "^^").replace('%', "%%")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::path::PathBuf;

    #[test]
    fn rejects_empty_and_path_like_names() {
        let empty = vec![String::new()];
        assert!(matches!(
            validate_commands(&empty, Platform::Posix),
            Err(MoxError::Configuration(_))
        ));
        let nested = vec!["bin/git".to_string()];
        assert!(matches!(
            validate_commands(&nested, Platform::Posix),
            Err(MoxError::Configuration(_))
        ));
    }

    #[test]
    fn case_conflicts_depend_on_platform() {
        let commands = vec!["Git".to_string(), "git".to_string()];
        assert!(validate_commands(&commands, Platform::Posix).is_ok());
        assert!(matches!(
            validate_commands(&commands, Platform::Windows),
            Err(MoxError::Configuration(_))
        ));
    }

    #[test]
    fn trampoline_uses_crlf_and_escapes_specials() {
        let script = trampoline_script(&PathBuf::from(r"C:\tools\100%\cmdmox-shim.exe"));
        assert!(script.contains("\r\n"));
        assert!(!script.replace("\r\n", "").contains('\n'));
        assert!(script.contains("100%%"));
        assert!(script.contains("set \"CMDMOX_INVOKED_AS=%~f0\""));
        assert!(script.ends_with("exit /b %ERRORLEVEL%\r\n"));
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn generation_is_idempotent_and_repairs_entries() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let shim_dir = dir.path().join("shims");
        fs::create_dir(&shim_dir).unwrap();
        let launcher = dir.path().join("cmdmox-shim");
        fs::write(&launcher, "#!/bin/sh\nexit 0\n").unwrap();
        let mut perms = fs::metadata(&launcher).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&launcher, perms).unwrap();

        let commands = vec!["git".to_string(), "curl".to_string()];
        generate_shims(&shim_dir, &launcher, &commands).unwrap();
        assert_eq!(fs::read_link(shim_dir.join("git")).unwrap(), launcher);

        // Break one entry, point another somewhere else; regeneration heals both.
        fs::remove_file(shim_dir.join("git")).unwrap();
        fs::remove_file(shim_dir.join("curl")).unwrap();
        std::os::unix::fs::symlink("/nonexistent", shim_dir.join("curl")).unwrap();
        generate_shims(&shim_dir, &launcher, &commands).unwrap();
        assert_eq!(fs::read_link(shim_dir.join("git")).unwrap(), launcher);
        assert_eq!(fs::read_link(shim_dir.join("curl")).unwrap(), launcher);
    }
}
