//! Structured lifecycle events for patches, rollbacks, sweeps and issue
//! decisions.
//!
//! Events are emitted at `info!` level (filter with `RUST_LOG`).

use tracing::info;

/// Span tagged with the patch id. Attach it with
/// [`tracing::Instrument::instrument`] so that it follows the patch future
/// across await points and worker threads.
pub fn patch_span(patch_id: &str) -> tracing::Span {
    tracing::info_span!("patchctl.patch", patch_id = %patch_id)
}

pub fn emit_patch_started(patch_id: &str, description: &str, dry_run: bool) {
    info!(event = "patch.started", patch_id = %patch_id, description = %description, dry_run);
}

/// Emit event: the patch state machine moved from one state to another.
pub fn emit_patch_transition(patch_id: &str, from: &str, to: &str) {
    info!(event = "patch.transition", patch_id = %patch_id, from = %from, to = %to);
}

pub fn emit_patch_finished(patch_id: &str, branch: &str, success: bool, affected_files: usize) {
    info!(
        event = "patch.finished",
        patch_id = %patch_id,
        branch = %branch,
        success,
        affected_files,
    );
}

pub fn emit_rollback_finished(branch: &str, rollback_type: &str, success: bool) {
    info!(
        event = "rollback.finished",
        branch = %branch,
        rollback_type = %rollback_type,
        success,
    );
}

/// Emit event: a consolidation sweep completed (or was cancelled).
pub fn emit_consolidation_finished(
    run_id: &str,
    files_processed: usize,
    failed: usize,
    total_size_bytes: u64,
    dry_run: bool,
    cancelled: bool,
) {
    info!(
        event = "consolidation.finished",
        run_id = %run_id,
        files_processed,
        failed,
        total_size_bytes,
        dry_run,
        cancelled,
    );
}

pub fn emit_issue_decision(category: &str, decision: &str) {
    info!(event = "issue.decision", category = %category, decision = %decision);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_span_enter_does_not_panic() {
        let span = patch_span("patch-test");
        let _entered = span.enter();
        emit_patch_transition("patch-test", "init", "branch_resolved");
    }
}
