//! Passthrough coordination.
//!
//! When a spy is marked passthrough, the controller cannot answer the
//! launcher immediately: it hands back a lookup path and waits for the
//! launcher to report what the real binary did. The pending table bridges
//! the two messages. This is the only path by which real-world stdio and
//! exit codes enter the journal.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use cmdmox_common::wire::{CommandResponse, Invocation, PassthroughRequest, PassthroughResult};
use tracing::warn;

struct PendingEntry {
    double_id: usize,
    invocation: Invocation,
    env_overrides: BTreeMap<String, String>,
    expires_at: Instant,
}

pub(crate) struct PassthroughCoordinator {
    pending: Mutex<HashMap<String, PendingEntry>>,
    ttl: Duration,
}

impl PassthroughCoordinator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Store a pending entry and produce the response instructing the
    /// launcher to run the real command.
    pub fn prepare_request(
        &self,
        double_id: usize,
        env_overrides: BTreeMap<String, String>,
        invocation: Invocation,
        lookup_path: String,
        timeout: Duration,
    ) -> CommandResponse {
        let request = PassthroughRequest {
            invocation_id: invocation.invocation_id.clone(),
            lookup_path,
            extra_env: env_overrides.clone(),
            timeout: timeout.as_secs_f64(),
        };

        let mut pending = lock(&self.pending);
        sweep_expired(&mut pending);
        pending.insert(
            invocation.invocation_id.clone(),
            PendingEntry {
                double_id,
                invocation,
                env_overrides,
                expires_at: Instant::now() + self.ttl,
            },
        );

        CommandResponse {
            passthrough: Some(request),
            ..CommandResponse::default()
        }
    }

    /// Pop the pending entry and synthesize the final response from the
    /// launcher's observations. Returns `None` for unknown or expired ids.
    pub fn finalize_result(
        &self,
        result: PassthroughResult,
    ) -> Option<(usize, Invocation, CommandResponse)> {
        let entry = {
            let mut pending = lock(&self.pending);
            sweep_expired(&mut pending);
            pending.remove(&result.invocation_id)?
        };

        let mut invocation = entry.invocation;
        invocation.stdout = Some(result.stdout.clone());
        invocation.stderr = Some(result.stderr.clone());
        invocation.exit_code = Some(result.exit_code);
        invocation.timestamp = Some(Utc::now());

        let response = CommandResponse {
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: result.exit_code,
            env: entry.env_overrides,
            passthrough: None,
        };

        Some((entry.double_id, invocation, response))
    }

    /// Number of entries still awaiting a result.
    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// Swept opportunistically on every prepare/finalize rather than by a
// dedicated timer; a stuck launcher therefore cannot grow the table
// without bound.
fn sweep_expired(pending: &mut HashMap<String, PendingEntry>) {
    let now = Instant::now();
    pending.retain(|invocation_id, entry| {
        let keep = entry.expires_at > now;
        if !keep {
            warn!(invocation_id = %invocation_id, "dropping expired passthrough entry");
        }
        keep
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(id: &str) -> Invocation {
        Invocation::new(id, "echo", vec!["hi".to_string()], String::new(), BTreeMap::new())
    }

    fn result(id: &str) -> PassthroughResult {
        PassthroughResult {
            invocation_id: id.to_string(),
            stdout: "hi\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    #[test]
    fn prepare_then_finalize_round_trip() {
        let coordinator = PassthroughCoordinator::new(Duration::from_secs(300));
        let mut overrides = BTreeMap::new();
        overrides.insert("CI".to_string(), "1".to_string());

        let response = coordinator.prepare_request(
            3,
            overrides.clone(),
            invocation("inv-9"),
            "/usr/bin:/bin".to_string(),
            Duration::from_secs(30),
        );
        let request = response.passthrough.expect("passthrough request");
        assert_eq!(request.invocation_id, "inv-9");
        assert_eq!(request.lookup_path, "/usr/bin:/bin");
        assert_eq!(request.extra_env, overrides);
        assert_eq!(request.timeout, 30.0);

        let (double_id, finalized, final_response) =
            coordinator.finalize_result(result("inv-9")).unwrap();
        assert_eq!(double_id, 3);
        assert_eq!(finalized.stdout.as_deref(), Some("hi\n"));
        assert_eq!(finalized.exit_code, Some(0));
        assert!(finalized.timestamp.is_some());
        assert_eq!(final_response.stdout, "hi\n");
        assert_eq!(final_response.env, overrides);
        assert_eq!(coordinator.pending_len(), 0);
    }

    #[test]
    fn unknown_id_yields_none() {
        let coordinator = PassthroughCoordinator::new(Duration::from_secs(300));
        assert!(coordinator.finalize_result(result("ghost")).is_none());
    }

    #[test]
    fn expired_entries_are_swept() {
        let coordinator = PassthroughCoordinator::new(Duration::ZERO);
        coordinator.prepare_request(
            0,
            BTreeMap::new(),
            invocation("inv-1"),
            String::new(),
            Duration::from_secs(30),
        );
        assert!(coordinator.finalize_result(result("inv-1")).is_none());
        assert_eq!(coordinator.pending_len(), 0);
    }
}
