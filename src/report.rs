use std::fmt::Write as _;

use chrono::{SecondsFormat, Utc};

use crate::gates::{failed_validations, GateOutcome};
use crate::graph::PatchPlacement;
use crate::orchestrator::{PatchOutcome, RollbackOutcome, RunReport};

/// Human-readable run report: every failed command and gate with its
/// message, then the final status and rollback outcome.
pub fn render_run_report(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Migration run report");
    let _ = writeln!(out, "Environment  : {}", report.environment);
    let _ = writeln!(out, "Mount        : {}", report.mount_env);
    let _ = writeln!(out, "Patches      : {}", report.patches.len());

    for patch in &report.patches {
        let verdict = if patch.passed { "pass" } else { "FAIL" };
        let _ = writeln!(out, "\n{} [{verdict}]", patch.patch_id);
        for (index, result) in patch.execution.results.iter().enumerate() {
            let status = if result.success { "ok" } else { "failed" };
            let _ = writeln!(
                out,
                "  command #{index:<2} {status:<7} {:>6} ms",
                result.duration_ms
            );
            if let Some(error) = &result.error {
                let _ = writeln!(out, "    {}", error.replace('\n', " "));
            }
        }
        render_gate_table(&mut out, &patch.gates);
    }

    let _ = writeln!(out);
    match &report.rollback {
        RollbackOutcome::NotNeeded => {}
        RollbackOutcome::Skipped { reason } => {
            let _ = writeln!(out, "Rollback     : skipped ({reason})");
        }
        RollbackOutcome::RolledBack {
            point_id,
            files_restored,
        } => {
            let _ = writeln!(
                out,
                "Rollback     : restored {files_restored} file(s) from {point_id}"
            );
        }
        RollbackOutcome::RollbackFailed { error } => {
            let _ = writeln!(out, "Rollback     : FAILED - {error}");
        }
    }
    let _ = writeln!(out, "Final status : {}", report.status.as_str());
    out
}

fn render_gate_table(out: &mut String, gates: &[GateOutcome]) {
    if gates.is_empty() {
        return;
    }
    let _ = writeln!(
        out,
        "  {:<22} {:<9} {:<7} {:>13}  Message",
        "Gate", "Required", "Passed", "Duration (ms)"
    );
    for outcome in gates {
        let required = if outcome.required { "yes" } else { "no" };
        let passed = if outcome.result.success { "yes" } else { "no" };
        let _ = writeln!(
            out,
            "  {:<22} {:<9} {:<7} {:>13}  {}",
            outcome.gate,
            required,
            passed,
            outcome.result.duration_ms,
            outcome.result.message.replace('\n', " ")
        );
    }
}

/// Dependency analysis view: execution order plus earliest-feasible
/// advisories. Advisory only; the orchestrator never reorders patches.
pub fn render_placements(order: &[String], placements: &[PatchPlacement]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Execution order:");
    for (index, id) in order.iter().enumerate() {
        let _ = writeln!(out, "  {:>3}. {id}", index + 1);
    }
    let movable: Vec<_> = placements.iter().filter(|p| p.can_run_earlier).collect();
    if movable.is_empty() {
        let _ = writeln!(out, "\nEvery patch sits at its earliest feasible position.");
    } else {
        let _ = writeln!(out, "\nPatches that could run earlier:");
        for placement in movable {
            let _ = writeln!(
                out,
                "  {:<28} declared at {:>3}, feasible from {:>3}",
                placement.patch_id, placement.declared_index, placement.earliest_index
            );
        }
    }
    out
}

/// Per-patch execution summary written next to the queue.
pub fn summary_markdown(outcome: &PatchOutcome) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Patch Execution Summary");
    let _ = writeln!(
        out,
        "Generated: {}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "## Patch Details");
    let _ = writeln!(out, "- **File**: {}", outcome.file_name);
    let _ = writeln!(out, "- **Patch ID**: {}", outcome.patch_id);
    let _ = writeln!(
        out,
        "- **Status**: {}",
        if outcome.passed { "SUCCESS" } else { "FAILED" }
    );
    let _ = writeln!(
        out,
        "- **Commands**: {} run, {} failed",
        outcome.execution.results.len(),
        outcome.execution.failed_results().count()
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "## Gates");
    for gate in &outcome.gates {
        let verdict = if gate.result.success { "passed" } else { "failed" };
        let _ = writeln!(
            out,
            "- `{}` {} ({} ms): {}",
            gate.gate, verdict, gate.result.duration_ms, gate.result.message
        );
    }
    let failures = failed_validations(&outcome.gates);
    if !failures.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Failed Validations");
        for failure in failures {
            let _ = writeln!(out, "- {failure}");
        }
    }
    out
}
