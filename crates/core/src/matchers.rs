//! Argument and stdin comparators.
//!
//! The display representations are part of the contract: they appear
//! verbatim in verifier diagnostics, so an expectation can be read back
//! from an error message.

use std::fmt;
use std::sync::Arc;

use crate::error::MoxError;

/// User-supplied predicate over a single argument.
pub type PredicateFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Value classes accepted by [`ArgMatcher::IsA`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Int,
    Float,
    Bool,
}

impl ValueType {
    fn accepts(self, value: &str) -> bool {
        match self {
            Self::Int => value.parse::<i64>().is_ok(),
            Self::Float => value.parse::<f64>().is_ok(),
            Self::Bool => matches!(value, "true" | "false"),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
        }
    }
}

/// One predicate over one argv element.
#[derive(Clone)]
pub enum ArgMatcher {
    /// Matches anything.
    Any,
    /// Matches values parseable as the given type.
    IsA(ValueType),
    /// Full-match not required; the pattern searches the value.
    Regex(regex::Regex),
    /// Substring containment.
    Contains(String),
    /// Prefix match.
    StartsWith(String),
    /// Arbitrary user callable.
    Predicate(PredicateFn),
}

impl ArgMatcher {
    pub fn any() -> Self {
        Self::Any
    }

    pub fn is_a(value_type: ValueType) -> Self {
        Self::IsA(value_type)
    }

    /// Compile a pattern; an invalid pattern is a configuration error.
    pub fn regex(pattern: &str) -> Result<Self, MoxError> {
        regex::Regex::new(pattern)
            .map(Self::Regex)
            .map_err(|err| MoxError::Configuration(format!("invalid regex {pattern:?}: {err}")))
    }

    pub fn contains(needle: impl Into<String>) -> Self {
        Self::Contains(needle.into())
    }

    pub fn starts_with(prefix: impl Into<String>) -> Self {
        Self::StartsWith(prefix.into())
    }

    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(predicate))
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Any => true,
            Self::IsA(value_type) => value_type.accepts(value),
            Self::Regex(pattern) => pattern.is_match(value),
            Self::Contains(needle) => value.contains(needle.as_str()),
            Self::StartsWith(prefix) => value.starts_with(prefix.as_str()),
            Self::Predicate(predicate) => predicate(value),
        }
    }
}

impl fmt::Display for ArgMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "Any()"),
            Self::IsA(value_type) => write!(f, "IsA({})", value_type.name()),
            Self::Regex(pattern) => write!(f, "Regex('{}')", pattern.as_str()),
            Self::Contains(needle) => write!(f, "Contains('{needle}')"),
            Self::StartsWith(prefix) => write!(f, "StartsWith('{prefix}')"),
            Self::Predicate(_) => write!(f, "Predicate(<callable>)"),
        }
    }
}

impl fmt::Debug for ArgMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Expected stdin for an invocation; an expectation without one accepts
/// any stdin.
#[derive(Clone, Debug)]
pub enum StdinMatcher {
    Exact(String),
    Matches(ArgMatcher),
}

impl StdinMatcher {
    pub fn matches(&self, stdin: &str) -> bool {
        match self {
            Self::Exact(expected) => expected == stdin,
            Self::Matches(matcher) => matcher.matches(stdin),
        }
    }
}

impl fmt::Display for StdinMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(expected) => write!(f, "{expected:?}"),
            Self::Matches(matcher) => fmt::Display::fmt(matcher, f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_matches_everything() {
        assert!(ArgMatcher::any().matches(""));
        assert!(ArgMatcher::any().matches("--verbose"));
    }

    #[test]
    fn is_a_checks_parseability() {
        assert!(ArgMatcher::is_a(ValueType::Int).matches("42"));
        assert!(!ArgMatcher::is_a(ValueType::Int).matches("4.2"));
        assert!(ArgMatcher::is_a(ValueType::Float).matches("4.2"));
        assert!(ArgMatcher::is_a(ValueType::Bool).matches("true"));
        assert!(!ArgMatcher::is_a(ValueType::Bool).matches("yes"));
    }

    #[test]
    fn regex_searches_value() {
        let matcher = ArgMatcher::regex("^--jobs=\\d+$").unwrap();
        assert!(matcher.matches("--jobs=4"));
        assert!(!matcher.matches("--jobs=many"));
    }

    #[test]
    fn invalid_regex_is_a_configuration_error() {
        assert!(matches!(
            ArgMatcher::regex("("),
            Err(MoxError::Configuration(_))
        ));
    }

    #[test]
    fn substring_and_prefix() {
        assert!(ArgMatcher::contains("clone").matches("git-clone-url"));
        assert!(ArgMatcher::starts_with("--").matches("--force"));
        assert!(!ArgMatcher::starts_with("--").matches("-f"));
    }

    #[test]
    fn predicate_runs_user_callable() {
        let matcher = ArgMatcher::predicate(|value| value.len() == 3);
        assert!(matcher.matches("abc"));
        assert!(!matcher.matches("abcd"));
    }

    #[test]
    fn display_reprs_are_stable() {
        assert_eq!(ArgMatcher::any().to_string(), "Any()");
        assert_eq!(ArgMatcher::is_a(ValueType::Int).to_string(), "IsA(int)");
        assert_eq!(
            ArgMatcher::regex("^a$").unwrap().to_string(),
            "Regex('^a$')"
        );
        assert_eq!(ArgMatcher::contains("x").to_string(), "Contains('x')");
        assert_eq!(ArgMatcher::starts_with("x").to_string(), "StartsWith('x')");
        assert_eq!(
            ArgMatcher::predicate(|_| true).to_string(),
            "Predicate(<callable>)"
        );
    }

    #[test]
    fn stdin_matcher_variants() {
        assert!(StdinMatcher::Exact("ping\n".to_string()).matches("ping\n"));
        assert!(!StdinMatcher::Exact("ping\n".to_string()).matches("pong\n"));
        assert!(StdinMatcher::Matches(ArgMatcher::contains("ping")).matches("ping pong"));
    }
}
