//! Plain-text rendering of engine results for the CLI.

use crate::engine::{RunResult, StatusReport, StepStatus};
use crate::scaffold::ScaffoldedPair;
use crate::step::Position;

fn position(p: Option<Position>) -> String {
    p.map_or_else(|| "unknown".to_string(), |p| p.to_string())
}

pub fn render_run(result: &RunResult) -> String {
    let mut lines = Vec::new();

    for step in &result.steps {
        let label = format!("{}_{}", step.sequence, step.description);
        match &step.status {
            StepStatus::Applied => {
                lines.push(format!("  {:<5} {label}", step.direction.as_str()));
            }
            StepStatus::Failed(reason) => {
                lines.push(format!(
                    "  {:<5} {label}  FAILED: {reason}",
                    step.direction.as_str()
                ));
            }
        }
    }

    let applied = result.applied().count();
    if result.steps.is_empty() && result.error.is_none() {
        lines.push(format!("{}: nothing to do.", result.operation));
    } else {
        lines.push(format!(
            "{}: {applied} migration{} applied.",
            result.operation,
            if applied == 1 { "" } else { "s" }
        ));
    }

    if result.before != result.after {
        lines.push(format!(
            "Changed from {} to {}.",
            position(result.before),
            position(result.after)
        ));
    } else {
        lines.push(format!("Position: {}.", position(result.after)));
    }

    if let Some(err) = &result.error {
        lines.push(format!("Error ({}): {err}", err.kind()));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

pub fn render_status(report: &StatusReport) -> String {
    let last = report
        .current
        .clone()
        .unwrap_or_else(|| "no migrations applied".to_string());
    format!(
        "Last migration: {last}\nApplied: {}, pending: {}\n",
        report.applied, report.pending
    )
}

pub fn render_scaffold(pair: &ScaffoldedPair) -> String {
    format!(
        "Created {}\nCreated {}\n",
        pair.up_path.display(),
        pair.down_path.display()
    )
}
