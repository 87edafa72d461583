//! Command doubles: one tagged record covering stubs, mocks, and spies.
//!
//! The `kind` tag is the only thing distinguishing the three flavors; the
//! verifier switches on it. Everything configurable through the fluent
//! handle ends up in this record.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use cmdmox_common::redact::{is_sensitive_key, REDACTED};
use cmdmox_common::wire::{format_call, CommandResponse, Invocation};

use crate::matchers::{ArgMatcher, StdinMatcher};
use crate::record::RecordingSession;

/// Verification semantics of a double.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoubleKind {
    /// Behavioral replacement; never required to be called.
    Stub,
    /// Required to be called, exactly matching.
    Mock,
    /// Records calls; may be passthrough; asserts only on demand.
    Spy,
}

impl DoubleKind {
    pub(crate) fn label(self) -> &'static str {
        match self {
            Self::Stub => "stub",
            Self::Mock => "mock",
            Self::Spy => "spy",
        }
    }
}

/// What a handler or static expectation produces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
        }
    }
}

impl<A: Into<String>, B: Into<String>> From<(A, B, i32)> for CommandOutput {
    fn from((stdout, stderr, exit_code): (A, B, i32)) -> Self {
        Self::new(stdout, stderr, exit_code)
    }
}

impl From<String> for CommandOutput {
    fn from(stdout: String) -> Self {
        Self::new(stdout, "", 0)
    }
}

impl From<&str> for CommandOutput {
    fn from(stdout: &str) -> Self {
        Self::new(stdout, "", 0)
    }
}

impl From<Vec<u8>> for CommandOutput {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(String::from_utf8_lossy(&bytes).into_owned(), "", 0)
    }
}

impl From<CommandResponse> for CommandOutput {
    fn from(response: CommandResponse) -> Self {
        Self::new(response.stdout, response.stderr, response.exit_code)
    }
}

/// Dynamic behavior: a callable the controller invokes per invocation.
pub type HandlerFn = Arc<dyn Fn(&Invocation) -> CommandOutput + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Behavior {
    Static(CommandOutput),
    Handler(HandlerFn),
}

impl fmt::Debug for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(output) => write!(f, "Static({output:?})"),
            Self::Handler(_) => write!(f, "Handler(<callable>)"),
        }
    }
}

/// Declared argument shape.
#[derive(Clone, Debug)]
pub(crate) enum ArgsExpectation {
    /// No declaration: any argument vector matches.
    Any,
    Exact(Vec<String>),
    Matchers(Vec<ArgMatcher>),
}

pub(crate) type RecordingHandle = Arc<Mutex<RecordingSession>>;

/// A registered expectation plus its observed calls.
pub(crate) struct CommandDouble {
    pub id: usize,
    pub name: String,
    pub kind: DoubleKind,
    pub args: ArgsExpectation,
    pub stdin: Option<StdinMatcher>,
    pub env_overrides: BTreeMap<String, String>,
    pub behavior: Behavior,
    pub expected_count: Option<usize>,
    pub ordered: bool,
    pub passthrough: bool,
    pub recording: Option<RecordingHandle>,
    pub calls: Vec<Invocation>,
}

impl CommandDouble {
    pub fn new(id: usize, name: impl Into<String>, kind: DoubleKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            args: ArgsExpectation::Any,
            stdin: None,
            env_overrides: BTreeMap::new(),
            behavior: Behavior::Static(CommandOutput::default()),
            expected_count: None,
            // Mocks participate in ordered verification unless opted out.
            ordered: kind == DoubleKind::Mock,
            passthrough: false,
            recording: None,
            calls: Vec::new(),
        }
    }

    /// The count this double must reach to satisfy verification, if any.
    pub fn required_count(&self) -> Option<usize> {
        self.expected_count.or(match self.kind {
            DoubleKind::Mock => Some(1),
            DoubleKind::Stub | DoubleKind::Spy => None,
        })
    }

    /// Whether further calls would exceed the declared count.
    pub fn fulfilled(&self) -> bool {
        match self.required_count() {
            Some(count) => self.calls.len() >= count,
            None => false,
        }
    }

    pub fn matches(&self, invocation: &Invocation) -> bool {
        self.mismatch(invocation).is_none()
    }

    /// Why this double rejects `invocation`, or `None` on a match.
    pub fn mismatch(&self, invocation: &Invocation) -> Option<String> {
        if self.name != invocation.command {
            return Some(format!(
                "command differs: expected '{}', got '{}'",
                self.name, invocation.command
            ));
        }

        match &self.args {
            ArgsExpectation::Any => {}
            ArgsExpectation::Exact(expected) => {
                if expected.len() != invocation.args.len() {
                    return Some(format!(
                        "argument count mismatch: expected {}, got {}",
                        expected.len(),
                        invocation.args.len()
                    ));
                }
                for (position, (want, got)) in
                    expected.iter().zip(invocation.args.iter()).enumerate()
                {
                    if want != got {
                        return Some(format!(
                            "argument {position} differs: expected '{want}', got '{got}'"
                        ));
                    }
                }
            }
            ArgsExpectation::Matchers(matchers) => {
                if matchers.len() != invocation.args.len() {
                    return Some(format!(
                        "argument count mismatch: expected {}, got {}",
                        matchers.len(),
                        invocation.args.len()
                    ));
                }
                for (position, (matcher, got)) in
                    matchers.iter().zip(invocation.args.iter()).enumerate()
                {
                    if !matcher.matches(got) {
                        return Some(format!("argument {position} rejected by {matcher}"));
                    }
                }
            }
        }

        if let Some(stdin) = &self.stdin {
            if !stdin.matches(&invocation.stdin) {
                return Some(format!(
                    "stdin mismatch: expected {stdin}, got {:?}",
                    truncate(&invocation.stdin)
                ));
            }
        }

        // Declared env overrides must be present on the incoming call.
        for (key, value) in &self.env_overrides {
            match invocation.env.get(key) {
                Some(found) if found == value => {}
                _ => {
                    let shown = if is_sensitive_key(key) { REDACTED } else { value };
                    return Some(format!("environment missing {key}='{shown}'"));
                }
            }
        }

        None
    }

    /// Diagnostic rendering, e.g. `mock git('clone', 'repo') in order`.
    pub fn describe(&self) -> String {
        let args = match &self.args {
            ArgsExpectation::Any => "*".to_string(),
            ArgsExpectation::Exact(expected) => expected
                .iter()
                .map(|arg| format!("'{arg}'"))
                .collect::<Vec<_>>()
                .join(", "),
            ArgsExpectation::Matchers(matchers) => matchers
                .iter()
                .map(|matcher| matcher.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        };
        let mut description = format!("{} {}({args})", self.kind.label(), self.name);
        if let Some(stdin) = &self.stdin {
            description.push_str(&format!(" stdin={stdin}"));
        }
        if !self.env_overrides.is_empty() {
            description.push_str(&format!(
                " env={}",
                cmdmox_common::redact::format_env(&self.env_overrides)
            ));
        }
        if let Some(count) = self.expected_count {
            description.push_str(&format!(" times={count}"));
        }
        if self.ordered {
            description.push_str(" in order");
        }
        if self.passthrough {
            description.push_str(" passthrough");
        }
        description
    }

    /// Rendering of an observed call for this double's diagnostics.
    pub fn describe_call(invocation: &Invocation) -> String {
        format_call(&invocation.command, &invocation.args)
    }
}

fn truncate(text: &str) -> String {
    const LIMIT: usize = 120;
    if text.chars().count() <= LIMIT {
        return text.to_string();
    }
    let kept: String = text.chars().take(LIMIT).collect();
    format!("{kept}…")
}
