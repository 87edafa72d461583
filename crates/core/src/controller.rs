//! The controller: record → replay → verify.
//!
//! `CmdMox` owns the doubles, the environment, and the transport server.
//! Registration happens in the record phase through [`CommandHandle`]s,
//! replay wires the shim directory and IPC endpoint together, and verify
//! drains everything, releases the environment, and reports discrepancies
//! as one aggregate error.

use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cmdmox_common::wire::Invocation;
use cmdmox_common::{IPC_SOCKET_VAR, IPC_TIMEOUT_VAR, SHIM_BIN_VAR};
use cmdmox_ipc::{Endpoint, IpcServer, ServerConfig};
use tracing::debug;

use crate::doubles::{
    ArgsExpectation, Behavior, CommandDouble, CommandOutput, DoubleKind, HandlerFn,
};
use crate::environment::Environment;
use crate::error::MoxError;
use crate::journal::{Journal, JournalEntry};
use crate::matchers::{ArgMatcher, StdinMatcher};
use crate::passthrough::PassthroughCoordinator;
use crate::record::RecordingSession;
use crate::replay::{lock_shared, ReplayRouter, ReplayShared};
use crate::shims::generate_shims;
use crate::verify;

/// Controller settings. Construct with `Config::default()` and override
/// fields as needed; validation happens at controller construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// Journal bound; oldest entries are evicted FIFO beyond this.
    pub max_journal_entries: usize,
    /// Per-operation IPC timeout published to launchers.
    pub ipc_timeout: Duration,
    /// Wall-clock budget for each passthrough execution.
    pub passthrough_timeout: Duration,
    /// How long an unanswered passthrough entry may stay pending.
    pub pending_ttl: Duration,
    /// Explicit launcher binary, bypassing discovery.
    pub launcher: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_journal_entries: 512,
            ipc_timeout: Duration::from_secs_f64(cmdmox_common::DEFAULT_IPC_TIMEOUT_SECS),
            passthrough_timeout: Duration::from_secs_f64(
                cmdmox_common::DEFAULT_PASSTHROUGH_TIMEOUT_SECS,
            ),
            pending_ttl: Duration::from_secs(300),
            launcher: None,
        }
    }
}

impl Config {
    fn validate(&self) -> Result<(), MoxError> {
        if self.max_journal_entries == 0 {
            return Err(MoxError::Configuration(
                "max_journal_entries must be positive".to_string(),
            ));
        }
        if self.ipc_timeout.is_zero() {
            return Err(MoxError::Configuration(
                "ipc_timeout must be positive".to_string(),
            ));
        }
        if self.passthrough_timeout.is_zero() {
            return Err(MoxError::Configuration(
                "passthrough_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Controller lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    Record,
    Replay,
    Verify,
    Disposed,
}

/// The test-double controller.
pub struct CmdMox {
    config: Config,
    phase: Phase,
    shared: Arc<Mutex<ReplayShared>>,
    coordinator: Arc<PassthroughCoordinator>,
    environment: Option<Environment>,
    server: Option<IpcServer>,
}

impl CmdMox {
    pub fn new() -> Result<Self, MoxError> {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Self, MoxError> {
        config.validate()?;
        let shared = Arc::new(Mutex::new(ReplayShared {
            doubles: Vec::new(),
            journal: Journal::new(config.max_journal_entries),
            frozen: false,
        }));
        let coordinator = Arc::new(PassthroughCoordinator::new(config.pending_ttl));
        Ok(Self {
            config,
            phase: Phase::Created,
            shared,
            coordinator,
            environment: None,
            server: None,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Begin accepting expectations. No side effects on the environment.
    pub fn enter(&mut self) -> Result<(), MoxError> {
        if self.phase != Phase::Created {
            return Err(MoxError::Lifecycle(format!(
                "enter is only valid in the created phase (currently {:?})",
                self.phase
            )));
        }
        self.phase = Phase::Record;
        Ok(())
    }

    /// Declare a mock: required to be called, exactly matching.
    pub fn mock(&mut self, name: &str) -> Result<CommandHandle, MoxError> {
        self.register(name, DoubleKind::Mock)
    }

    /// Declare a stub: behavioral replacement, never required to be called.
    pub fn stub(&mut self, name: &str) -> Result<CommandHandle, MoxError> {
        self.register(name, DoubleKind::Stub)
    }

    /// Declare a spy: records calls, may be passthrough, asserts on demand.
    pub fn spy(&mut self, name: &str) -> Result<CommandHandle, MoxError> {
        self.register(name, DoubleKind::Spy)
    }

    fn register(&mut self, name: &str, kind: DoubleKind) -> Result<CommandHandle, MoxError> {
        if self.phase != Phase::Record {
            return Err(MoxError::Lifecycle(format!(
                "doubles are registered in the record phase (currently {:?})",
                self.phase
            )));
        }
        if name.trim().is_empty() {
            return Err(MoxError::Configuration(
                "command name must not be empty".to_string(),
            ));
        }
        let mut shared = lock_shared(&self.shared);
        let id = shared.doubles.len();
        shared.doubles.push(CommandDouble::new(id, name, kind));
        Ok(CommandHandle {
            shared: self.shared.clone(),
            id,
        })
    }

    /// Freeze expectations, acquire the environment, generate shims, and
    /// start the transport. Idempotent while already replaying; any
    /// failure tears the partial environment down before propagating.
    pub fn replay(&mut self) -> Result<(), MoxError> {
        match self.phase {
            Phase::Replay => return Ok(()),
            Phase::Record => {}
            other => {
                return Err(MoxError::Lifecycle(format!(
                    "replay requires the record phase (currently {other:?})"
                )))
            }
        }

        let launcher = locate_launcher(&self.config)?;
        let commands = {
            let mut shared = lock_shared(&self.shared);
            shared.frozen = true;
            let mut seen = HashSet::new();
            shared
                .doubles
                .iter()
                .map(|double| double.name.clone())
                .filter(|name| seen.insert(name.clone()))
                .collect::<Vec<_>>()
        };

        // `environment` is dropped (and the process env restored) if any
        // later startup step fails.
        let mut environment = Environment::enter()?;
        generate_shims(environment.shim_dir(), &launcher, &commands)?;

        let router = Arc::new(ReplayRouter {
            shared: self.shared.clone(),
            coordinator: self.coordinator.clone(),
            lookup_path: environment.lookup_path(),
            passthrough_timeout: self.config.passthrough_timeout,
        });
        let endpoint = Endpoint::new(environment.socket_path());
        let server = IpcServer::start(
            endpoint,
            router,
            &ServerConfig {
                ready_timeout: self.config.ipc_timeout,
                ..ServerConfig::default()
            },
        )?;

        // Publish the live values so launchers forked after this point
        // observe the actual endpoint and timeout.
        environment.set_var(
            IPC_TIMEOUT_VAR,
            self.config.ipc_timeout.as_secs_f64().to_string(),
        );
        environment.set_var(IPC_SOCKET_VAR, server.endpoint().logical_path().as_os_str());

        debug!(shim_dir = %environment.shim_dir().display(), "replay started");
        self.environment = Some(environment);
        self.server = Some(server);
        self.phase = Phase::Replay;
        Ok(())
    }

    /// Join the transport, run the verifiers over the frozen journal,
    /// finalize recordings, and release the environment. Teardown runs
    /// regardless of the verification outcome.
    pub fn verify(&mut self) -> Result<(), MoxError> {
        if self.phase != Phase::Replay {
            return Err(MoxError::Lifecycle(format!(
                "verify requires the replay phase (currently {:?})",
                self.phase
            )));
        }
        self.phase = Phase::Verify;

        // Joining the workers is what freezes the journal.
        if let Some(mut server) = self.server.take() {
            server.stop();
        }

        let mut report = {
            let shared = lock_shared(&self.shared);
            verify::run(&shared.doubles, &shared.journal.snapshot())
        };

        // Recordings are finalized before the environment goes away.
        {
            let shared = lock_shared(&self.shared);
            for double in &shared.doubles {
                let Some(recording) = &double.recording else {
                    continue;
                };
                let mut session = match recording.lock() {
                    Ok(session) => session,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Err(err) = session.finalize() {
                    report
                        .recording
                        .push(format!("{}: {err}", session.path().display()));
                }
            }
        }

        if let Some(mut environment) = self.environment.take() {
            environment.release();
        }
        self.phase = Phase::Disposed;
        report.into_result()
    }

    /// Snapshot of the bounded journal.
    pub fn journal(&self) -> Vec<JournalEntry> {
        lock_shared(&self.shared).journal.snapshot()
    }

    /// The live shim directory, when replaying.
    pub fn shim_dir(&self) -> Result<PathBuf, MoxError> {
        self.environment
            .as_ref()
            .map(|environment| environment.shim_dir().to_path_buf())
            .ok_or_else(|| {
                MoxError::MissingEnvironment("no replay environment is active".to_string())
            })
    }
}

impl Drop for CmdMox {
    fn drop(&mut self) {
        if let Some(mut server) = self.server.take() {
            server.stop();
        }
        if let Some(mut environment) = self.environment.take() {
            environment.release();
        }
        self.phase = Phase::Disposed;
    }
}

/// Fluent configuration and introspection for one registered double.
///
/// Handles stay valid for the controller's lifetime; spy helpers read the
/// live call record during and after replay. Mutating methods panic if
/// called once replay has frozen the expectations.
#[derive(Clone)]
pub struct CommandHandle {
    shared: Arc<Mutex<ReplayShared>>,
    id: usize,
}

impl CommandHandle {
    fn configure<R>(&self, action: impl FnOnce(&mut CommandDouble) -> R) -> R {
        let mut shared = lock_shared(&self.shared);
        assert!(
            !shared.frozen,
            "expectations are frozen once replay starts"
        );
        let id = self.id;
        action(&mut shared.doubles[id])
    }

    fn inspect<R>(&self, action: impl FnOnce(&CommandDouble) -> R) -> R {
        let shared = lock_shared(&self.shared);
        action(&shared.doubles[self.id])
    }

    /// Exact ordered argument list.
    pub fn with_args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        self.configure(move |double| double.args = ArgsExpectation::Exact(args));
        self
    }

    /// One predicate per argv element.
    pub fn with_matching_args<I>(self, matchers: I) -> Self
    where
        I: IntoIterator<Item = ArgMatcher>,
    {
        let matchers: Vec<ArgMatcher> = matchers.into_iter().collect();
        self.configure(move |double| double.args = ArgsExpectation::Matchers(matchers));
        self
    }

    /// Exact stdin comparison.
    pub fn with_stdin(self, stdin: impl Into<String>) -> Self {
        let stdin = stdin.into();
        self.configure(move |double| double.stdin = Some(StdinMatcher::Exact(stdin)));
        self
    }

    /// Predicate stdin comparison.
    pub fn with_stdin_matching(self, matcher: ArgMatcher) -> Self {
        self.configure(move |double| double.stdin = Some(StdinMatcher::Matches(matcher)));
        self
    }

    /// Environment overrides: required on the incoming call, applied to
    /// the recorded invocation, and merged into the launcher's env.
    pub fn with_env<I, K, V>(self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: Vec<(String, String)> = vars
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self.configure(move |double| {
            for (key, value) in vars {
                double.env_overrides.insert(key, value);
            }
        });
        self
    }

    /// Static behavior.
    pub fn returns(
        self,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        exit_code: i32,
    ) -> Self {
        let output = CommandOutput::new(stdout, stderr, exit_code);
        self.configure(move |double| double.behavior = Behavior::Static(output));
        self
    }

    /// Dynamic behavior: the handler receives each matched invocation.
    pub fn runs<F, O>(self, handler: F) -> Self
    where
        F: Fn(&Invocation) -> O + Send + Sync + 'static,
        O: Into<CommandOutput>,
    {
        let wrapped: HandlerFn = Arc::new(move |invocation| handler(invocation).into());
        self.configure(move |double| double.behavior = Behavior::Handler(wrapped));
        self
    }

    /// Exact expected call count.
    pub fn times(self, count: usize) -> Self {
        self.configure(move |double| double.expected_count = Some(count));
        self
    }

    /// Alias for [`CommandHandle::times`].
    pub fn times_called(self, count: usize) -> Self {
        self.times(count)
    }

    pub fn in_order(self) -> Self {
        self.configure(|double| double.ordered = true);
        self
    }

    pub fn any_order(self) -> Self {
        self.configure(|double| double.ordered = false);
        self
    }

    /// Run the real executable for matched calls. Spies only.
    pub fn passthrough(self) -> Result<Self, MoxError> {
        {
            let mut shared = lock_shared(&self.shared);
            if shared.frozen {
                return Err(MoxError::Lifecycle(
                    "expectations are frozen once replay starts".to_string(),
                ));
            }
            let double = &mut shared.doubles[self.id];
            if double.kind != DoubleKind::Spy {
                return Err(MoxError::Configuration(format!(
                    "passthrough is only available on spies ('{}' is a {})",
                    double.name,
                    double.kind.label()
                )));
            }
            double.passthrough = true;
        }
        Ok(self)
    }

    /// Attach a recording session; requires passthrough.
    pub fn record(self, path: impl Into<PathBuf>) -> Result<Self, MoxError> {
        {
            let mut shared = lock_shared(&self.shared);
            if shared.frozen {
                return Err(MoxError::Lifecycle(
                    "expectations are frozen once replay starts".to_string(),
                ));
            }
            let double = &mut shared.doubles[self.id];
            if double.kind != DoubleKind::Spy || !double.passthrough {
                return Err(MoxError::Configuration(format!(
                    "record requires a passthrough spy ('{}' does not qualify)",
                    double.name
                )));
            }
            double.recording = Some(Arc::new(Mutex::new(RecordingSession::new(path.into()))));
        }
        Ok(self)
    }

    pub fn name(&self) -> String {
        self.inspect(|double| double.name.clone())
    }

    /// Number of matched calls observed so far.
    pub fn call_count(&self) -> usize {
        self.inspect(|double| double.calls.len())
    }

    /// The matched calls, finalized with their results.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.inspect(|double| double.calls.clone())
    }

    pub fn assert_called(&self) {
        self.inspect(|double| {
            if double.calls.is_empty() {
                panic!("{} was never called", double.describe());
            }
        });
    }

    pub fn assert_not_called(&self) {
        self.inspect(|double| {
            if !double.calls.is_empty() {
                let observed: Vec<String> =
                    double.calls.iter().map(CommandDouble::describe_call).collect();
                panic!(
                    "{} was called {} time(s): {}",
                    double.describe(),
                    double.calls.len(),
                    observed.join(", ")
                );
            }
        });
    }

    /// Assert the most recent call used exactly these arguments.
    pub fn assert_called_with(&self, args: &[&str]) {
        self.check_last_call(args, None, &[]);
    }

    /// Assert the most recent call used these arguments and this stdin.
    pub fn assert_called_with_stdin(&self, args: &[&str], stdin: &str) {
        self.check_last_call(args, Some(stdin), &[]);
    }

    /// Assert the most recent call used these arguments and carried the
    /// given environment subset.
    pub fn assert_called_with_env(&self, args: &[&str], env: &[(&str, &str)]) {
        self.check_last_call(args, None, env);
    }

    fn check_last_call(&self, args: &[&str], stdin: Option<&str>, env: &[(&str, &str)]) {
        self.inspect(|double| {
            let Some(last) = double.calls.last() else {
                panic!("{} was never called", double.describe());
            };
            if last.args != args {
                panic!(
                    "{} last called as {}, expected {}",
                    double.describe(),
                    CommandDouble::describe_call(last),
                    cmdmox_common::wire::format_call(
                        &double.name,
                        &args.iter().map(|arg| arg.to_string()).collect::<Vec<_>>()
                    )
                );
            }
            if let Some(expected) = stdin {
                if last.stdin != expected {
                    panic!(
                        "{} last called with stdin {:?}, expected {expected:?}",
                        double.describe(),
                        last.stdin
                    );
                }
            }
            for (key, value) in env {
                match last.env.get(*key) {
                    Some(found) if found == value => {}
                    Some(found) => panic!(
                        "{} last called with {key}={found:?}, expected {value:?}",
                        double.describe()
                    ),
                    None => panic!(
                        "{} last called without {key} in its environment",
                        double.describe()
                    ),
                }
            }
        });
    }
}

fn launcher_file_name() -> &'static str {
    if cfg!(windows) {
        "cmdmox-shim.exe"
    } else {
        "cmdmox-shim"
    }
}

/// Find the launcher binary: explicit config, then `CMDMOX_SHIM_BIN`, then
/// next to the current executable (test binaries live in
/// `target/<profile>/deps`, the launcher one level up), then PATH.
fn locate_launcher(config: &Config) -> Result<PathBuf, MoxError> {
    if let Some(path) = &config.launcher {
        if path.is_file() {
            return Ok(path.clone());
        }
        return Err(MoxError::Configuration(format!(
            "configured launcher {} does not exist",
            path.display()
        )));
    }

    if let Ok(value) = env::var(SHIM_BIN_VAR) {
        if !value.trim().is_empty() {
            let path = PathBuf::from(&value);
            if path.is_file() {
                return Ok(path);
            }
            return Err(MoxError::Configuration(format!(
                "{SHIM_BIN_VAR} points at {value:?}, which does not exist"
            )));
        }
    }

    let binary = launcher_file_name();
    if let Ok(exe) = env::current_exe() {
        let mut dirs = Vec::new();
        if let Some(parent) = exe.parent() {
            dirs.push(parent.to_path_buf());
            if let Some(grandparent) = parent.parent() {
                dirs.push(grandparent.to_path_buf());
            }
        }
        for dir in dirs {
            let candidate = dir.join(binary);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    if let Some(path_var) = env::var_os("PATH") {
        for dir in env::split_paths(&path_var) {
            let candidate = dir.join(binary);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    Err(MoxError::Configuration(format!(
        "could not locate the {binary} binary; set {SHIM_BIN_VAR} or Config::launcher"
    )))
}
