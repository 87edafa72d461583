//! Scoped acquisition of the shim directory and environment mutations.
//!
//! The process environment and PATH are a global singleton; this module is
//! the only place in the controller that touches them. Every mutation is
//! recorded so `release` can restore the exact prior state, and release
//! runs on every exit path through `Drop`.

use std::env;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use cmdmox_common::{paths, Platform, IPC_SOCKET_VAR, SOCKET_FILE_NAME};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::MoxError;

/// One environment per process; nesting is a precondition error.
static ENVIRONMENT_ACTIVE: AtomicBool = AtomicBool::new(false);

pub(crate) struct Environment {
    temp: Option<TempDir>,
    shim_dir: PathBuf,
    saved: Vec<(String, Option<OsString>)>,
    released: bool,
}

impl Environment {
    /// Create the shim directory, prepend it to PATH, and export the
    /// transport address.
    pub fn enter() -> Result<Self, MoxError> {
        if ENVIRONMENT_ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(MoxError::Lifecycle(
                "a cmdmox environment is already active in this process".to_string(),
            ));
        }
        Self::enter_inner().inspect_err(|_| ENVIRONMENT_ACTIVE.store(false, Ordering::SeqCst))
    }

    fn enter_inner() -> Result<Self, MoxError> {
        let worker = env::var("CMDMOX_TEST_WORKER").unwrap_or_else(|_| "main".to_string());
        let prefix = format!("cmdmox-{worker}-{}-", std::process::id());
        let temp = tempfile::Builder::new().prefix(&prefix).tempdir()?;
        let shim_dir = normalize_shim_dir(temp.path());
        debug!(shim_dir = %shim_dir.display(), "entering cmdmox environment");

        let mut environment = Self {
            temp: Some(temp),
            shim_dir,
            saved: Vec::new(),
            released: false,
        };

        let platform = Platform::current();
        let shim_dir_text = environment.shim_dir.to_string_lossy().into_owned();
        let current_path = env::var("PATH").unwrap_or_default();
        let updated_path = paths::prepend_dir(&current_path, &shim_dir_text, platform);
        environment.set_var("PATH", updated_path);

        if platform == Platform::Windows {
            environment.ensure_cmd_pathext();
        }

        let socket = environment.socket_path();
        environment.set_var(IPC_SOCKET_VAR, socket.as_os_str());

        Ok(environment)
    }

    /// Set a variable, remembering its prior state the first time.
    pub fn set_var(&mut self, key: &str, value: impl AsRef<OsStr>) {
        if !self.saved.iter().any(|(saved_key, _)| saved_key == key) {
            self.saved.push((key.to_string(), env::var_os(key)));
        }
        env::set_var(key, value);
    }

    fn ensure_cmd_pathext(&mut self) {
        let current = env::var("PATHEXT").unwrap_or_default();
        let has_cmd = current
            .split(';')
            .any(|ext| ext.trim().eq_ignore_ascii_case(".CMD"));
        if !has_cmd {
            let updated = if current.trim().is_empty() {
                ".CMD".to_string()
            } else {
                format!("{current};.CMD")
            };
            self.set_var("PATHEXT", updated);
        }
    }

    pub fn shim_dir(&self) -> &Path {
        &self.shim_dir
    }

    pub fn socket_path(&self) -> PathBuf {
        self.shim_dir.join(SOCKET_FILE_NAME)
    }

    /// The live PATH minus the shim directory; what passthrough launchers
    /// search for real binaries.
    pub fn lookup_path(&self) -> String {
        let platform = Platform::current();
        let current = env::var("PATH").unwrap_or_default();
        paths::remove_dir(&current, &self.shim_dir.to_string_lossy(), platform)
    }

    /// Restore mutated variables and delete the shim directory.
    ///
    /// Failures are logged and do not stop the remaining cleanup actions.
    /// Safe to call more than once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        for (key, original) in std::mem::take(&mut self.saved).into_iter().rev() {
            match original {
                Some(value) => env::set_var(&key, value),
                None => env::remove_var(&key),
            }
        }

        if let Some(temp) = self.temp.take() {
            let path = temp.path().to_path_buf();
            if let Err(err) = temp.close() {
                warn!(path = %path.display(), error = %err, "failed to remove shim directory");
            }
        }

        ENVIRONMENT_ACTIVE.store(false, Ordering::SeqCst);
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.release();
    }
}

/// Keep the published shim directory in its plainest spelling. On Windows
/// this strips the `\\?\` verbatim prefix, which many tools cannot pass
/// back through PATH resolution.
#[cfg(windows)]
fn normalize_shim_dir(path: &Path) -> PathBuf {
    dunce::simplified(path).to_path_buf()
}

#[cfg(not(windows))]
fn normalize_shim_dir(path: &Path) -> PathBuf {
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn enter_prepends_shim_dir_and_exports_socket() {
        let original_path = env::var("PATH").unwrap_or_default();
        let environment = Environment::enter().unwrap();

        let shim_dir = environment.shim_dir().to_path_buf();
        let platform = Platform::current();
        let entries = paths::split_entries(&env::var("PATH").unwrap(), platform);
        assert_eq!(entries[0], shim_dir.to_string_lossy());

        let socket = env::var(IPC_SOCKET_VAR).unwrap();
        assert_eq!(socket, environment.socket_path().to_string_lossy());
        assert!(shim_dir.is_dir());

        drop(environment);
        assert_eq!(env::var("PATH").unwrap_or_default(), original_path);
        assert!(env::var(IPC_SOCKET_VAR).is_err());
        assert!(!shim_dir.exists());
    }

    #[test]
    #[serial]
    fn nesting_is_rejected() {
        let _outer = Environment::enter().unwrap();
        match Environment::enter() {
            Err(MoxError::Lifecycle(message)) => assert!(message.contains("already active")),
            other => panic!("expected lifecycle error, got {other:?}"),
        }
    }

    #[test]
    #[serial]
    fn release_is_idempotent_and_restores_added_vars() {
        let mut environment = Environment::enter().unwrap();
        environment.set_var("CMDMOX_TEST_SENTINEL", "1");
        assert_eq!(env::var("CMDMOX_TEST_SENTINEL").unwrap(), "1");

        environment.release();
        environment.release();
        assert!(env::var("CMDMOX_TEST_SENTINEL").is_err());
    }

    #[test]
    #[serial]
    fn lookup_path_excludes_shim_dir() {
        let environment = Environment::enter().unwrap();
        let lookup = environment.lookup_path();
        assert!(!lookup.contains(&*environment.shim_dir().to_string_lossy()));
        assert!(!lookup.is_empty());
    }
}
