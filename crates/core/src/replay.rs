//! Replay-time message routing: match incoming invocations against the
//! registered doubles, run behaviors, and append to the journal.
//!
//! Handlers execute outside the registry lock so invocations arriving on
//! separate connections do not serialize on user code; the journal append
//! happens under the lock after the response is determined, which is what
//! makes journal order equal response-completion order.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use cmdmox_common::wire::{CommandResponse, Invocation, PassthroughResult};
use cmdmox_ipc::MessageHandler;
use tracing::{debug, warn};

use crate::doubles::{Behavior, CommandDouble, CommandOutput};
use crate::journal::{Journal, JournalEntry};
use crate::passthrough::PassthroughCoordinator;

/// Everything the controller and the transport workers share.
pub(crate) struct ReplayShared {
    pub doubles: Vec<CommandDouble>,
    pub journal: Journal,
    /// Set when replay starts; expectation mutation is rejected after.
    pub frozen: bool,
}

pub(crate) fn lock_shared(shared: &Mutex<ReplayShared>) -> MutexGuard<'_, ReplayShared> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) struct ReplayRouter {
    pub shared: Arc<Mutex<ReplayShared>>,
    pub coordinator: Arc<PassthroughCoordinator>,
    pub lookup_path: String,
    pub passthrough_timeout: Duration,
}

struct Planned {
    double_id: usize,
    behavior: Behavior,
    env_overrides: BTreeMap<String, String>,
    invocation: Invocation,
}

impl MessageHandler for ReplayRouter {
    fn on_invocation(&self, invocation: Invocation) -> CommandResponse {
        let planned = {
            let mut shared = lock_shared(&self.shared);
            let Some(double_id) = find_match(&shared.doubles, &invocation) else {
                let mut unmatched = invocation;
                finalize(&mut unmatched, "", "", 0);
                debug!(command = %unmatched.command, "unexpected invocation");
                shared.journal.push(JournalEntry {
                    invocation: unmatched,
                    matched: None,
                });
                // Not fatal during replay; the verifier reports it.
                return CommandResponse::default();
            };

            let double = &shared.doubles[double_id];
            let mut matched = invocation;
            // Expectation-declared env wins over caller-supplied values on
            // the recorded invocation.
            for (key, value) in &double.env_overrides {
                matched.env.insert(key.clone(), value.clone());
            }

            if double.passthrough {
                return self.coordinator.prepare_request(
                    double_id,
                    double.env_overrides.clone(),
                    matched,
                    self.lookup_path.clone(),
                    self.passthrough_timeout,
                );
            }

            Planned {
                double_id,
                behavior: double.behavior.clone(),
                env_overrides: double.env_overrides.clone(),
                invocation: matched,
            }
        };

        let Planned {
            double_id,
            behavior,
            env_overrides,
            mut invocation,
        } = planned;

        let output = run_behavior(&behavior, &invocation);
        finalize(&mut invocation, &output.stdout, &output.stderr, output.exit_code);

        let mut shared = lock_shared(&self.shared);
        shared.doubles[double_id].calls.push(invocation.clone());
        shared.journal.push(JournalEntry {
            invocation,
            matched: Some(double_id),
        });

        CommandResponse {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            env: env_overrides,
            passthrough: None,
        }
    }

    fn on_passthrough_result(&self, result: PassthroughResult) -> CommandResponse {
        let Some((double_id, invocation, response)) = self.coordinator.finalize_result(result)
        else {
            warn!("passthrough result for unknown invocation id");
            return CommandResponse::internal_error(
                "protocol error: unknown or expired passthrough invocation id",
            );
        };

        let mut shared = lock_shared(&self.shared);
        let double = &mut shared.doubles[double_id];
        double.calls.push(invocation.clone());
        if let Some(recording) = &double.recording {
            let mut session = match recording.lock() {
                Ok(session) => session,
                Err(poisoned) => poisoned.into_inner(),
            };
            session.append(invocation.clone(), response.clone());
        }
        shared.journal.push(JournalEntry {
            invocation,
            matched: Some(double_id),
        });
        response
    }
}

/// Candidate selection: declaration order among matching expectations for
/// the command, preferring ones whose count is not yet satisfied. A
/// fulfilled expectation still absorbs the call (the count verifier will
/// report the overrun) rather than marking it unexpected.
fn find_match(doubles: &[CommandDouble], invocation: &Invocation) -> Option<usize> {
    let mut fallback = None;
    for double in doubles.iter().filter(|d| d.name == invocation.command) {
        if double.matches(invocation) {
            if !double.fulfilled() {
                return Some(double.id);
            }
            if fallback.is_none() {
                fallback = Some(double.id);
            }
        }
    }
    fallback
}

fn finalize(invocation: &mut Invocation, stdout: &str, stderr: &str, exit_code: i32) {
    invocation.stdout = Some(stdout.to_string());
    invocation.stderr = Some(stderr.to_string());
    invocation.exit_code = Some(exit_code);
    invocation.timestamp = Some(Utc::now());
}

fn run_behavior(behavior: &Behavior, invocation: &Invocation) -> CommandOutput {
    match behavior {
        Behavior::Static(output) => output.clone(),
        Behavior::Handler(handler) => {
            let handler = handler.clone();
            match catch_unwind(AssertUnwindSafe(|| handler(invocation))) {
                Ok(output) => output,
                Err(payload) => {
                    let message = panic_text(payload.as_ref());
                    warn!(command = %invocation.command, "handler panicked: {message}");
                    CommandOutput::new("", format!("handler panicked: {message}\n"), 1)
                }
            }
        }
    }
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doubles::{ArgsExpectation, DoubleKind};

    fn router_with(doubles: Vec<CommandDouble>) -> ReplayRouter {
        ReplayRouter {
            shared: Arc::new(Mutex::new(ReplayShared {
                doubles,
                journal: Journal::new(64),
                frozen: true,
            })),
            coordinator: Arc::new(PassthroughCoordinator::new(Duration::from_secs(300))),
            lookup_path: "/usr/bin:/bin".to_string(),
            passthrough_timeout: Duration::from_secs(30),
        }
    }

    fn invocation(command: &str, args: &[&str]) -> Invocation {
        Invocation::new(
            format!("inv-{command}-{}", args.len()),
            command,
            args.iter().map(|arg| arg.to_string()).collect(),
            String::new(),
            BTreeMap::new(),
        )
    }

    #[test]
    fn static_double_produces_response_and_journal_entry() {
        let mut double = CommandDouble::new(0, "hi", DoubleKind::Stub);
        double.behavior = Behavior::Static(CommandOutput::new("hello", "", 0));
        let router = router_with(vec![double]);

        let response = router.on_invocation(invocation("hi", &[]));
        assert_eq!(response.stdout, "hello");
        assert_eq!(response.exit_code, 0);

        let shared = lock_shared(&router.shared);
        assert_eq!(shared.journal.len(), 1);
        let entry = shared.journal.iter().next().unwrap();
        assert_eq!(entry.matched, Some(0));
        assert_eq!(entry.invocation.stdout.as_deref(), Some("hello"));
        assert_eq!(shared.doubles[0].calls.len(), 1);
    }

    #[test]
    fn handler_sees_the_invocation() {
        let mut double = CommandDouble::new(0, "greet", DoubleKind::Stub);
        double.behavior = Behavior::Handler(Arc::new(|invocation: &Invocation| {
            CommandOutput::new(format!("hello {}", invocation.args[0]), "", 0)
        }));
        let router = router_with(vec![double]);

        let response = router.on_invocation(invocation("greet", &["world"]));
        assert_eq!(response.stdout, "hello world");
    }

    #[test]
    fn handler_panic_becomes_failure_response() {
        let mut double = CommandDouble::new(0, "boom", DoubleKind::Stub);
        double.behavior = Behavior::Handler(Arc::new(|_: &Invocation| -> CommandOutput {
            panic!("handler exploded")
        }));
        let router = router_with(vec![double]);

        let response = router.on_invocation(invocation("boom", &[]));
        assert_eq!(response.exit_code, 1);
        assert!(response.stderr.contains("handler exploded"));

        // The failure is journaled so verification can report it.
        let shared = lock_shared(&router.shared);
        let entry = shared.journal.iter().next().unwrap();
        assert_eq!(entry.invocation.exit_code, Some(1));
    }

    #[test]
    fn unexpected_invocation_is_journaled_not_fatal() {
        let router = router_with(vec![]);
        let response = router.on_invocation(invocation("mystery", &["arg"]));
        assert_eq!(response.exit_code, 0);
        assert!(response.stdout.is_empty());

        let shared = lock_shared(&router.shared);
        let entry = shared.journal.iter().next().unwrap();
        assert_eq!(entry.matched, None);
        assert_eq!(entry.invocation.command, "mystery");
    }

    #[test]
    fn env_overrides_apply_to_record_and_response() {
        let mut double = CommandDouble::new(0, "deploy", DoubleKind::Stub);
        double
            .env_overrides
            .insert("STAGE".to_string(), "prod".to_string());
        let router = router_with(vec![double]);

        let mut call = invocation("deploy", &[]);
        call.env.insert("STAGE".to_string(), "dev".to_string());
        // The override is also a required subset; the caller must carry it.
        let response = router.on_invocation(call);
        // caller env STAGE=dev does not satisfy STAGE=prod, so unmatched
        assert_eq!(response.exit_code, 0);
        let shared = lock_shared(&router.shared);
        assert_eq!(shared.journal.iter().next().unwrap().matched, None);
        drop(shared);

        let mut call = invocation("deploy", &[]);
        call.env.insert("STAGE".to_string(), "prod".to_string());
        let response = router.on_invocation(call);
        assert_eq!(response.env.get("STAGE").map(String::as_str), Some("prod"));
        let shared = lock_shared(&router.shared);
        let entry = shared.journal.snapshot().pop().unwrap();
        assert_eq!(entry.matched, Some(0));
        assert_eq!(entry.invocation.env["STAGE"], "prod");
    }

    #[test]
    fn declaration_order_breaks_ties_and_prefers_unfulfilled() {
        let mut first = CommandDouble::new(0, "git", DoubleKind::Mock);
        first.args = ArgsExpectation::Any;
        let mut second = CommandDouble::new(1, "git", DoubleKind::Mock);
        second.args = ArgsExpectation::Any;
        let router = router_with(vec![first, second]);

        router.on_invocation(invocation("git", &["one"]));
        router.on_invocation(invocation("git", &["two"]));
        router.on_invocation(invocation("git", &["three"]));

        let shared = lock_shared(&router.shared);
        let matched: Vec<_> = shared.journal.iter().map(|entry| entry.matched).collect();
        // Third call falls back to the first declaration (over-call).
        assert_eq!(matched, vec![Some(0), Some(1), Some(0)]);
        assert_eq!(shared.doubles[0].calls.len(), 2);
    }

    #[test]
    fn passthrough_round_trip_attaches_real_results() {
        let mut spy = CommandDouble::new(0, "echo", DoubleKind::Spy);
        spy.passthrough = true;
        let router = router_with(vec![spy]);

        let call = invocation("echo", &["hello"]);
        let call_id = call.invocation_id.clone();
        let first = router.on_invocation(call);
        let request = first.passthrough.expect("passthrough request");
        assert_eq!(request.invocation_id, call_id);
        assert_eq!(request.lookup_path, "/usr/bin:/bin");

        // Nothing journaled until the result lands.
        assert_eq!(lock_shared(&router.shared).journal.len(), 0);

        let second = router.on_passthrough_result(PassthroughResult {
            invocation_id: call_id,
            stdout: "hello\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
        });
        assert_eq!(second.stdout, "hello\n");

        let shared = lock_shared(&router.shared);
        assert_eq!(shared.doubles[0].calls.len(), 1);
        let entry = shared.journal.iter().next().unwrap();
        assert_eq!(entry.matched, Some(0));
        assert_eq!(entry.invocation.exit_code, Some(0));
    }

    #[test]
    fn unknown_passthrough_result_is_a_protocol_failure() {
        let router = router_with(vec![]);
        let response = router.on_passthrough_result(PassthroughResult {
            invocation_id: "ghost".to_string(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        });
        assert_eq!(response.exit_code, 1);
        assert!(response.stderr.contains("protocol error"));
    }
}
