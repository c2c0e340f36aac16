//! Markdown rendering of patch results.

use std::fmt::Write;

use super::result::PatchResult;

/// Render a short Markdown report for a patch run.
pub fn render_patch_report_md(result: &PatchResult) -> String {
    let mut md = String::new();
    let status = if result.success { "succeeded" } else { "failed" };
    let mode = if result.dry_run { " (dry run)" } else { "" };

    let _ = writeln!(md, "# Patch {status}{mode}");
    let _ = writeln!(md);
    let _ = writeln!(md, "- **Description:** {}", result.description);
    let _ = writeln!(md, "- **Patch id:** `{}`", result.patch_id);
    let _ = writeln!(md, "- **Branch:** `{}`", result.branch_name);
    let _ = writeln!(md, "- **Branch decision:** {}", result.branch_plan.reason);
    if let Some(commit) = &result.commit_hash {
        let _ = writeln!(md, "- **Commit:** `{commit}`");
    }
    if result.pushed {
        let _ = writeln!(md, "- **Published:** yes");
    }
    let _ = writeln!(md, "- **Final state:** {}", result.final_state);
    let _ = writeln!(md, "- **Duration:** {} ms", result.duration_ms());

    if let Some(error) = &result.error {
        let _ = writeln!(md);
        let _ = writeln!(md, "## Error");
        let _ = writeln!(md);
        let _ = writeln!(md, "```text\n{}\n```", error.trim());
    }

    let _ = writeln!(md);
    let _ = writeln!(md, "## Affected files ({})", result.affected_files.len());
    let _ = writeln!(md);
    if result.affected_files.is_empty() {
        let _ = writeln!(md, "_none_");
    }
    for path in &result.affected_files {
        let _ = writeln!(md, "- `{}`", path.display());
    }

    if !result.validation_results.is_empty() {
        let _ = writeln!(md);
        let _ = writeln!(md, "## Validation");
        let _ = writeln!(md);
        let _ = writeln!(md, "| Command | Result | Exit | Duration (ms) |");
        let _ = writeln!(md, "|---|---|---|---|");
        for (name, outcome) in &result.validation_results {
            let verdict = match (outcome.success, outcome.interrupted) {
                (true, _) => "pass",
                (false, true) => "interrupted",
                (false, false) => "fail",
            };
            let exit = outcome
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                md,
                "| `{}` | {verdict} | {exit} | {} |",
                name.replace('|', "\\|"),
                outcome.duration_ms
            );
        }
    }

    if let Some(rollback) = &result.rollback {
        let _ = writeln!(md);
        let _ = writeln!(md, "## Rollback");
        let _ = writeln!(md);
        let _ = writeln!(
            md,
            "- {} via `{}`: {}",
            if rollback.success { "completed" } else { "FAILED" },
            rollback.rollback_type.as_str(),
            rollback.restored_state
        );
        if let Some(error) = &rollback.error {
            let _ = writeln!(md, "- error: {error}");
        }
    }

    if !result.warnings.is_empty() {
        let _ = writeln!(md);
        let _ = writeln!(md, "## Warnings");
        let _ = writeln!(md);
        for warning in &result.warnings {
            let _ = writeln!(md, "- {warning}");
        }
    }
    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::BranchPlan;
    use crate::patch::state::PatchState;
    use crate::patch::validation::ValidationOutcome;
    use std::path::PathBuf;

    #[test]
    fn report_lists_files_validation_and_warnings() {
        let plan = BranchPlan {
            current_branch: "main".into(),
            skip_branch_creation: false,
            target_branch_name: "patch/20260101-000000-fix".into(),
            reason: "on trunk branch".into(),
        };
        let mut result = PatchResult::begin("p-1".into(), "fix the thing", false, plan);
        result.affected_files.insert(PathBuf::from("src/lib.rs"));
        result
            .validation_results
            .insert("cargo test".into(), ValidationOutcome::failed("1 test failed"));
        result.warnings.push("no changes to commit".into());
        result.advance(PatchState::BranchResolved);
        result.advance(PatchState::Applied);

        let md = render_patch_report_md(&result);
        assert!(md.starts_with("# Patch failed"));
        assert!(md.contains("`src/lib.rs`"));
        assert!(md.contains("| `cargo test` | fail | - |"));
        assert!(md.contains("## Warnings"));
        assert!(!md.contains("## Rollback"));
    }
}
