//! Host platform detection with a test-only override.

use std::env;

use crate::PLATFORM_OVERRIDE_VAR;

/// The two filesystem/transport flavors cmdmox distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Posix,
    Windows,
}

impl Platform {
    /// Detect the platform, honoring `CMDMOX_PLATFORM_OVERRIDE` when set.
    ///
    /// The override only needs to name a family; `linux`, `darwin` and
    /// `macos` all mean [`Platform::Posix`]. Unrecognized values fall back
    /// to the compiled target.
    pub fn current() -> Self {
        if let Ok(value) = env::var(PLATFORM_OVERRIDE_VAR) {
            match value.trim().to_ascii_lowercase().as_str() {
                "windows" | "win32" => return Self::Windows,
                "posix" | "linux" | "darwin" | "macos" | "unix" => return Self::Posix,
                _ => {}
            }
        }
        Self::native()
    }

    /// The platform this binary was compiled for, ignoring the override.
    pub fn native() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Posix
        }
    }

    /// Separator between PATH entries.
    pub fn path_list_separator(self) -> char {
        match self {
            Self::Posix => ':',
            Self::Windows => ';',
        }
    }

    /// Whether PATH entries and command names compare case-insensitively.
    pub fn case_insensitive(self) -> bool {
        matches!(self, Self::Windows)
    }

    /// Fold a name for comparison under this platform's case semantics.
    pub fn fold_case(self, name: &str) -> String {
        if self.case_insensitive() {
            name.to_ascii_lowercase()
        } else {
            name.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn override_selects_family() {
        env::set_var(PLATFORM_OVERRIDE_VAR, "windows");
        assert_eq!(Platform::current(), Platform::Windows);
        env::set_var(PLATFORM_OVERRIDE_VAR, "linux");
        assert_eq!(Platform::current(), Platform::Posix);
        env::set_var(PLATFORM_OVERRIDE_VAR, "not-a-platform");
        assert_eq!(Platform::current(), Platform::native());
        env::remove_var(PLATFORM_OVERRIDE_VAR);
    }

    #[test]
    fn case_folding_follows_platform() {
        assert_eq!(Platform::Windows.fold_case("Git"), "git");
        assert_eq!(Platform::Posix.fold_case("Git"), "Git");
    }

    #[test]
    fn separators() {
        assert_eq!(Platform::Posix.path_list_separator(), ':');
        assert_eq!(Platform::Windows.path_list_separator(), ';');
    }
}
