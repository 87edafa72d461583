//! The three sub-verifiers, run in order over the frozen journal.

use cmdmox_common::redact::format_env;

use crate::doubles::CommandDouble;
use crate::error::VerificationReport;
use crate::journal::JournalEntry;

pub(crate) fn run(doubles: &[CommandDouble], journal: &[JournalEntry]) -> VerificationReport {
    let mut report = VerificationReport::default();
    verify_unexpected(doubles, journal, &mut report);
    verify_order(doubles, journal, &mut report);
    verify_counts(doubles, &mut report);
    report
}

/// Report every journal entry that matched no expectation, with the
/// redacted call context and the candidate expectations for its command.
fn verify_unexpected(
    doubles: &[CommandDouble],
    journal: &[JournalEntry],
    report: &mut VerificationReport,
) {
    for entry in journal.iter().filter(|entry| entry.matched.is_none()) {
        let invocation = &entry.invocation;
        let mut message = format!(
            "{} stdin={:?} env={}",
            invocation.display_call(),
            clip(&invocation.stdin),
            format_env(&invocation.env)
        );

        let candidates: Vec<String> = doubles
            .iter()
            .filter(|double| double.name == invocation.command)
            .map(|double| {
                let reason = double
                    .mismatch(invocation)
                    .unwrap_or_else(|| "would match".to_string());
                format!("{} <- {reason}", double.describe())
            })
            .collect();

        if candidates.is_empty() {
            message.push_str(&format!(
                "; no expectations declared for '{}'",
                invocation.command
            ));
        } else {
            message.push_str(&format!("; candidates: {}", candidates.join("; ")));
        }
        report.unexpected.push(message);
    }
}

/// Journal entries matching ordered expectations must appear in
/// declaration order. Any-order expectations are invisible to this pass:
/// they may be satisfied at any position and never advance the cursor.
fn verify_order(
    doubles: &[CommandDouble],
    journal: &[JournalEntry],
    report: &mut VerificationReport,
) {
    let ordered: Vec<&CommandDouble> = doubles.iter().filter(|double| double.ordered).collect();
    if ordered.len() < 2 {
        return;
    }
    let ordered_ids: Vec<usize> = ordered.iter().map(|double| double.id).collect();
    let observed: Vec<usize> = journal
        .iter()
        .filter_map(|entry| entry.matched)
        .filter(|id| ordered_ids.contains(id))
        .collect();

    // Declaration ids increase with declaration order, so any decreasing
    // adjacent pair means an earlier expectation was satisfied after a
    // later one.
    if observed.windows(2).any(|pair| pair[0] > pair[1]) {
        let expected: Vec<String> = ordered.iter().map(|double| double.describe()).collect();
        let observed_calls: Vec<String> = observed
            .iter()
            .map(|id| doubles[*id].describe())
            .collect();
        report.misordered.push(format!(
            "ordered expectations ran out of declared order: expected [{}], observed [{}]",
            expected.join(", "),
            observed_calls.join(", ")
        ));
    }
}

/// Mocks (and anything with an explicit `times`) must hit their count
/// exactly. Fulfillment counts live on the doubles, so journal eviction
/// cannot skew this pass.
fn verify_counts(doubles: &[CommandDouble], report: &mut VerificationReport) {
    for double in doubles {
        let Some(required) = double.required_count() else {
            // Stubs and spies without an explicit `times` never fail here.
            continue;
        };
        let actual = double.calls.len();
        if actual == required {
            continue;
        }
        let observed = if double.calls.is_empty() {
            "never called".to_string()
        } else {
            double
                .calls
                .iter()
                .map(CommandDouble::describe_call)
                .collect::<Vec<_>>()
                .join(", ")
        };
        report.unfulfilled.push(format!(
            "{}: expected {required} call(s), observed {actual} ({observed})",
            double.describe()
        ));
    }
}

fn clip(text: &str) -> String {
    const LIMIT: usize = 120;
    if text.chars().count() <= LIMIT {
        return text.to_string();
    }
    let kept: String = text.chars().take(LIMIT).collect();
    format!("{kept}…")
}
