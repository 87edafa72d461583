//! Secret redaction for diagnostics.
//!
//! Verifier output and journal dumps include captured environments; any
//! value whose key matches the secrets lexicon is replaced with `***`
//! before it reaches an error message or log line.

use std::collections::BTreeMap;

/// Key fragments that mark an environment variable as sensitive.
const SECRET_MARKERS: &[&str] = &[
    "KEY",
    "TOKEN",
    "SECRET",
    "PASSWORD",
    "CREDENTIALS",
    "PASS",
    "PWD",
];

/// Replacement string for redacted values.
pub const REDACTED: &str = "***";

/// Whether an environment key matches the secrets lexicon.
pub fn is_sensitive_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    SECRET_MARKERS.iter().any(|marker| upper.contains(marker))
}

/// Copy an environment mapping, replacing sensitive values with `***`.
pub fn redact_env(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .map(|(key, value)| {
            let value = if is_sensitive_key(key) {
                REDACTED.to_string()
            } else {
                value.clone()
            };
            (key.clone(), value)
        })
        .collect()
}

/// Render an environment mapping as `KEY='value'` pairs with secrets
/// redacted, for inclusion in diagnostics.
pub fn format_env(env: &BTreeMap<String, String>) -> String {
    let redacted = redact_env(env);
    let pairs: Vec<String> = redacted
        .iter()
        .map(|(key, value)| format!("{key}='{value}'"))
        .collect();
    format!("{{{}}}", pairs.join(", "))
}
