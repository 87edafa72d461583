//! PATH-list manipulation with host-appropriate case semantics.
//!
//! All helpers operate on the textual PATH value rather than `PathBuf`s so
//! the same code serves both the live process environment and the
//! `lookup_path` strings shipped to launchers.

use std::collections::HashSet;

use crate::platform::Platform;

/// Split a PATH-like string into trimmed, non-empty entries.
pub fn split_entries(value: &str, platform: Platform) -> Vec<String> {
    value
        .split(platform.path_list_separator())
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join entries back into a PATH-like string.
pub fn join_entries<I, S>(entries: I, platform: Platform) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let sep = platform.path_list_separator().to_string();
    entries
        .into_iter()
        .map(|entry| entry.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(&sep)
}

fn normalize_entry(entry: &str, platform: Platform) -> String {
    let trimmed = entry.trim_end_matches(['/', '\\']);
    let trimmed = if trimmed.is_empty() { entry } else { trimmed };
    platform.fold_case(trimmed)
}

/// Deduplicate entries, preserving first-seen order.
pub fn dedupe_entries(entries: Vec<String>, platform: Platform) -> Vec<String> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|entry| seen.insert(normalize_entry(entry, platform)))
        .collect()
}

/// Prepend `dir` to a PATH value.
///
/// Entries are trimmed and deduplicated first, and any pre-existing
/// occurrence of `dir` is removed so the prepended copy is the only one.
pub fn prepend_dir(value: &str, dir: &str, platform: Platform) -> String {
    let target = normalize_entry(dir, platform);
    let mut entries = vec![dir.to_string()];
    entries.extend(
        split_entries(value, platform)
            .into_iter()
            .filter(|entry| normalize_entry(entry, platform) != target),
    );
    join_entries(dedupe_entries(entries, platform), platform)
}

/// Remove every occurrence of `dir` from a PATH value, deduplicating the
/// remainder. Used to derive the real-binary lookup path shipped to
/// passthrough launchers.
pub fn remove_dir(value: &str, dir: &str, platform: Platform) -> String {
    let target = normalize_entry(dir, platform);
    let entries = split_entries(value, platform)
        .into_iter()
        .filter(|entry| normalize_entry(entry, platform) != target)
        .collect();
    join_entries(dedupe_entries(entries, platform), platform)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_trims_and_drops_empties() {
        let entries = split_entries(" /usr/bin : :/bin ", Platform::Posix);
        assert_eq!(entries, vec!["/usr/bin", "/bin"]);
    }

    #[test]
    fn dedupe_preserves_first_occurrence() {
        let entries = vec![
            "/usr/bin".to_string(),
            "/bin".to_string(),
            "/usr/bin/".to_string(),
            "/usr/local/bin".to_string(),
        ];
        let deduped = dedupe_entries(entries, Platform::Posix);
        assert_eq!(deduped, vec!["/usr/bin", "/bin", "/usr/local/bin"]);
    }

    #[test]
    fn dedupe_is_case_insensitive_on_windows() {
        let entries = vec![r"C:\Tools".to_string(), r"c:\tools\".to_string()];
        let deduped = dedupe_entries(entries, Platform::Windows);
        assert_eq!(deduped, vec![r"C:\Tools"]);
    }

    #[test]
    fn prepend_removes_prior_occurrence() {
        let value = "/usr/bin:/opt/shims:/bin";
        let updated = prepend_dir(value, "/opt/shims", Platform::Posix);
        assert_eq!(updated, "/opt/shims:/usr/bin:/bin");
    }

    #[test]
    fn remove_dir_strips_all_copies() {
        let value = "/opt/shims:/usr/bin:/opt/shims/:/bin";
        let updated = remove_dir(value, "/opt/shims", Platform::Posix);
        assert_eq!(updated, "/usr/bin:/bin");
    }
}
