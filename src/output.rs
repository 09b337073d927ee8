//! CLI output formatting.
//!
//! # Item-First Display
//!
//! Every line leads with the item's position and id; templates and files are
//! indented context underneath. The format functions are pure (they return
//! `Vec<String>`) and the `print_*` wrappers write to stdout, so tests assert
//! on exact lines.
//!
//! # Output Format
//!
//! ## Run
//!
//! ```text
//! Queued 3 items (1 already done, 0 invalid) on 2 workers
//! [001/003] 720575941350274352 ok
//!     VFB_00101567 registered (primary): skeleton created, mesh created (tube), volume present
//!     VFB_00200000 registered: skeleton created
//! [002/003] 720575941350274353 FAILED
//!     fetch: item 720575941350274353 not found
//! Checkpoint (2 items)
//!
//! Succeeded: 1  Failed: 1  Skipped: 1
//! Failed items:
//!     720575941350274353: fetch: item 720575941350274353 not found
//! ```
//!
//! ## Dry run
//!
//! ```text
//! Would process 12 items (3 already done, 1 invalid)
//!     720575941350274352
//!     ...
//!     ... and 2 more
//! ```

use crate::artifacts::MeshOrigin;
use crate::pipeline::{ItemReport, ProgressEvent, RunSummary, TargetReport, WorkPlan};
use crate::state::{PipelineState, Status};
use crate::types::Format;

/// Ids shown in full by the dry-run listing.
const PLAN_PREVIEW: usize = 10;

fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

/// `[007/120]`, widening with the total.
fn position(pos: usize, total: usize) -> String {
    let width = total.to_string().len().max(3);
    format!("[{pos:0>width$}/{total:0>width$}]")
}

fn format_list(formats: &[Format], status: &str) -> Vec<String> {
    formats.iter().map(|f| format!("{f} {status}")).collect()
}

fn target_line(target: &TargetReport) -> String {
    let mut head = format!("{} {}", target.template_id, target.route);
    if target.primary {
        head.push_str(" (primary)");
    }
    let mut parts = format_list(&target.created, "created");
    if let Some(origin) = target.mesh_origin {
        let label = match origin {
            MeshOrigin::Native => "native",
            MeshOrigin::Tube => "tube",
        };
        if let Some(mesh) = parts.iter_mut().find(|p| p.starts_with("mesh ")) {
            mesh.push_str(&format!(" ({label})"));
        }
    }
    parts.extend(format_list(&target.present, "present"));
    format!("{}: {}", head, parts.join(", "))
}

fn item_lines(pos: usize, total: usize, report: &ItemReport) -> Vec<String> {
    let record = &report.record;
    let mut lines = Vec::new();
    match record.status {
        Status::Failed => {
            lines.push(format!("{} {} FAILED", position(pos, total), record.item_id));
            if let Some(error) = &record.error {
                lines.push(format!("{}{}", indent(1), error));
            }
        }
        status => {
            let label = if status == Status::Success { "ok" } else { status_label(status) };
            lines.push(format!("{} {} {}", position(pos, total), record.item_id, label));
            for target in &report.targets {
                lines.push(format!("{}{}", indent(1), target_line(target)));
                for failed in &target.failed_formats {
                    lines.push(format!("{}{} failed: {}", indent(2), target.template_id, failed));
                }
            }
            for unrouted in &report.unrouted {
                lines.push(format!("{}{}", indent(1), unrouted));
            }
        }
    }
    lines
}

fn status_label(status: Status) -> &'static str {
    match status {
        Status::Pending => "pending",
        Status::Success => "success",
        Status::Failed => "failed",
        Status::Skipped => "skipped",
    }
}

/// Format a single progress event as display lines.
pub fn format_progress_event(event: &ProgressEvent) -> Vec<String> {
    match event {
        ProgressEvent::Started {
            queued,
            resumed,
            invalid,
            workers,
        } => {
            let noun = if *workers == 1 { "worker" } else { "workers" };
            vec![format!(
                "Queued {queued} items ({resumed} already done, {invalid} invalid) on {workers} {noun}"
            )]
        }
        ProgressEvent::ItemFinished {
            position,
            total,
            report,
        } => item_lines(*position, *total, report),
        ProgressEvent::Checkpointed { records } => vec![format!("Checkpoint ({records} items)")],
    }
}

/// Format the end-of-run summary.
pub fn format_summary(summary: &RunSummary) -> Vec<String> {
    let mut lines = vec![
        String::new(),
        format!(
            "Succeeded: {}  Failed: {}  Skipped: {}",
            summary.succeeded,
            summary.failed.len(),
            summary.skipped
        ),
    ];
    if summary.cancelled {
        lines.push(format!(
            "Cancelled: {} queued items not started",
            summary.not_started
        ));
    }
    if !summary.failed.is_empty() {
        lines.push("Failed items:".to_string());
        for (id, error) in &summary.failed {
            lines.push(format!("{}{}: {}", indent(1), id, error));
        }
    }
    lines
}

/// Format the dry-run listing.
pub fn format_plan(plan: &WorkPlan) -> Vec<String> {
    let mut lines = vec![format!(
        "Would process {} items ({} already done, {} invalid)",
        plan.queue.len(),
        plan.resumed.len(),
        plan.invalid.len()
    )];
    for id in plan.queue.iter().take(PLAN_PREVIEW) {
        lines.push(format!("{}{}", indent(1), id));
    }
    if plan.queue.len() > PLAN_PREVIEW {
        lines.push(format!("{}... and {} more", indent(1), plan.queue.len() - PLAN_PREVIEW));
    }
    for (raw, error) in &plan.invalid {
        lines.push(format!("{}invalid {:?}: {}", indent(1), raw, error));
    }
    lines
}

/// Format the persisted state for `treewarp status`.
pub fn format_status(state: &PipelineState, state_path: &str) -> Vec<String> {
    let mut lines = vec![format!("State: {state_path}")];
    match state.last_run {
        Some(ts) => lines.push(format!("Last run: {}", ts.to_rfc3339())),
        None => lines.push("Last run: never".to_string()),
    }
    lines.push(format!(
        "Succeeded: {}  Failed: {}  Total: {}",
        state.count(Status::Success),
        state.count(Status::Failed),
        state.records.len()
    ));
    let failures = state.failures();
    if !failures.is_empty() {
        lines.push("Failed items:".to_string());
        for f in failures {
            lines.push(format!("{}{}: {}", indent(1), f.id, f.error));
        }
    }
    lines
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{}", line);
    }
}

pub fn print_summary(summary: &RunSummary) {
    print_lines(format_summary(summary));
}

pub fn print_plan(plan: &WorkPlan) {
    print_lines(format_plan(plan));
}

pub fn print_status(state: &PipelineState, state_path: &str) {
    print_lines(format_status(state, state_path));
}

// ============================================================================
// Tests
// ============================================================================
