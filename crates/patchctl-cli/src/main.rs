//! patchctl - git-controlled patch orchestration
//!
//! ## Commands
//!
//! - `plan`: Show the branch decision for a change without touching anything
//! - `patch`: Apply a shell operation on a patch branch, validate, commit
//! - `rollback`: Undo a patch branch (reset, delete or revert)
//! - `prune-branches`: Delete stale patch branches
//! - `consolidate`: Sweep old backup artifacts into a timestamped archive
//! - `analyze`: Report on backup artifacts
//! - `issue`: File a failure report through the duplicate guard

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, Level};

use patchctl_core::consolidate::Exclusions;
use patchctl_core::issues::{GitHubIssueTracker, IssueTracker};
use patchctl_core::patch::{render_patch_report_md, ShellOperation};
use patchctl_core::stats::{analyze_all, inventory_archive, inventory_for_targets, render_report_md, scan_inventory};
use patchctl_core::telemetry::init_tracing;
use patchctl_core::{
    ArtifactConsolidator, BranchStrategyResolver, CancellationToken, ChangeRequest, CleanupTarget, Confirmation,
    ConsolidateOptions, Disposition, IssueCategory, IssueDuplicationGuard, IssueRecord, PatchExecutor,
    PatchctlConfig, RepoContext, ReportMode, RollbackManager, RollbackOptions, RollbackType, METRICS,
};

#[derive(Parser)]
#[command(name = "patchctl")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Git-controlled patch orchestration", long_about = None)]
struct Cli {
    /// Repository to operate on (default: current directory)
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Configuration file (default: <repo>/patchctl.toml)
    #[arg(long, global = true, env = "PATCHCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true, env = "PATCHCTL_LOG_JSON")]
    json_logs: bool,

    /// Print results as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the branch decision for a change
    Plan {
        /// Change description
        description: String,

        /// Always branch off, even from a feature branch
        #[arg(long)]
        force_new_branch: bool,
    },

    /// Apply a change on a patch branch, validate and commit it
    Patch {
        /// Change description (becomes the commit subject)
        description: String,

        /// Shell command that performs the change
        #[arg(short = 'c', long = "command")]
        operation: String,

        /// Validation command; repeat for several (run in order)
        #[arg(short, long = "test")]
        tests: Vec<String>,

        /// Run in a scratch copy and report what would happen
        #[arg(long)]
        dry_run: bool,

        /// Commit pre-existing uncommitted changes together with the patch
        #[arg(long)]
        auto_commit: bool,

        /// Always branch off, even from a feature branch
        #[arg(long)]
        force_new_branch: bool,

        /// Push the branch after committing
        #[arg(long)]
        publish: bool,

        /// Print a Markdown report instead of the plain summary
        #[arg(long)]
        markdown: bool,
    },

    /// Roll a branch back
    Rollback {
        /// Branch to roll back
        branch: String,

        /// Strategy
        #[arg(short = 't', long = "type", value_enum, default_value = "reset")]
        rollback_type: RollbackArg,

        /// Reset target, or the commit to revert
        #[arg(long)]
        checkpoint: Option<String>,

        /// Branch to check out before deleting
        #[arg(long)]
        return_to: Option<String>,
    },

    /// Delete stale patch branches, keeping the newest per hour
    PruneBranches {
        /// Branch prefix to consider
        #[arg(long, default_value = "patch/")]
        prefix: String,

        /// Only report what would be deleted
        #[arg(long)]
        dry_run: bool,
    },

    /// Sweep old backup artifacts into a timestamped archive
    Consolidate {
        /// Only report what would be moved or deleted
        #[arg(long)]
        dry_run: bool,

        /// Delete without asking
        #[arg(long)]
        force: bool,

        /// Extra target as PATH:DAYS:PATTERN[:delete]; replaces configured targets
        #[arg(long = "target")]
        targets: Vec<String>,
    },

    /// Report on backup artifacts
    Analyze {
        /// Report mode; repeat for several (default: all)
        #[arg(short, long = "mode", value_enum)]
        modes: Vec<ModeArg>,

        /// Glob pattern to inventory instead of the configured targets
        #[arg(short, long = "pattern")]
        patterns: Vec<String>,

        /// Inventory the consolidated archive instead of the working tree
        #[arg(long)]
        archive: bool,
    },

    /// File a failure report through the duplicate guard
    Issue {
        /// Issue title
        #[arg(long)]
        title: String,

        /// Issue body; read from stdin when omitted
        #[arg(long)]
        body: Option<String>,

        /// Category (default: inferred from title and body)
        #[arg(long)]
        category: Option<IssueCategory>,

        /// Only print the decision
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RollbackArg {
    Reset,
    Delete,
    Revert,
}

impl From<RollbackArg> for RollbackType {
    fn from(arg: RollbackArg) -> Self {
        match arg {
            RollbackArg::Reset => RollbackType::ResetToParent,
            RollbackArg::Delete => RollbackType::DeleteBranch,
            RollbackArg::Revert => RollbackType::RevertCommit,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Summary,
    Detailed,
    Historical,
    Size,
    All,
}

/// Everything subcommands share.
struct App {
    context: RepoContext,
    config: PatchctlConfig,
    cancel: CancellationToken,
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json_logs, level);

    let config = match &cli.config {
        Some(path) => PatchctlConfig::load(path),
        None => PatchctlConfig::load_for_repo(&cli.repo),
    }
    .context("Failed to load configuration")?;

    let context = RepoContext::discover(&cli.repo, &config.git)
        .await
        .context("Failed to resolve repository context")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; cancelling");
                cancel.cancel();
            }
        });
    }

    let app = App {
        context,
        config,
        cancel,
        json: cli.json,
    };

    let outcome = match cli.command {
        Commands::Plan {
            description,
            force_new_branch,
        } => cmd_plan(&app, &description, force_new_branch).await,
        Commands::Patch {
            description,
            operation,
            tests,
            dry_run,
            auto_commit,
            force_new_branch,
            publish,
            markdown,
        } => {
            let request = ChangeRequest::new(
                description,
                Arc::new(ShellOperation::new(operation, app.config.patch.operation_timeout())),
            )?
            .with_test_commands(tests)
            .dry_run(dry_run)
            .auto_commit(auto_commit)
            .force_new_branch(force_new_branch)
            .publish(publish);
            cmd_patch(&app, &request, markdown).await
        }
        Commands::Rollback {
            branch,
            rollback_type,
            checkpoint,
            return_to,
        } => cmd_rollback(&app, &branch, rollback_type.into(), RollbackOptions { checkpoint, return_to }).await,
        Commands::PruneBranches { prefix, dry_run } => cmd_prune(&app, &prefix, dry_run).await,
        Commands::Consolidate {
            dry_run,
            force,
            targets,
        } => cmd_consolidate(&app, dry_run, force, &targets).await,
        Commands::Analyze {
            modes,
            patterns,
            archive,
        } => cmd_analyze(&app, &modes, &patterns, archive).await,
        Commands::Issue {
            title,
            body,
            category,
            dry_run,
        } => cmd_issue(&app, &title, body, category, dry_run).await,
    };

    METRICS.flush();
    outcome
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Show the branch plan for a change
async fn cmd_plan(app: &App, description: &str, force_new_branch: bool) -> Result<()> {
    if !app.context.is_git_repo() {
        bail!("{} is not a git repository", app.context.root().display());
    }
    let resolution = BranchStrategyResolver::new(app.context.git(), app.context.trunk_branch())
        .resolve(description, force_new_branch)
        .await;

    if app.json {
        return print_json(&resolution);
    }
    let plan = &resolution.plan;
    println!("Current branch: {}", plan.current_branch);
    if plan.skip_branch_creation {
        println!("Stay on:        {}", plan.target_branch_name);
    } else {
        println!("Create branch:  {}", plan.target_branch_name);
    }
    println!("Reason:         {}", plan.reason);
    if let Some(warning) = &resolution.warning {
        println!("Warning:        {warning}");
    }
    Ok(())
}

/// Execute a change request
async fn cmd_patch(app: &App, request: &ChangeRequest, markdown: bool) -> Result<()> {
    let executor = PatchExecutor::new(app.context.clone(), app.config.patch.clone()).with_cancel(app.cancel.clone());
    let result = executor.execute(request).await.context("Patch could not start")?;

    if app.json {
        print_json(&result)?;
    } else if markdown {
        print!("{}", render_patch_report_md(&result));
    } else {
        let status = if result.success { "ok" } else { "FAILED" };
        println!("[{}] {} ({})", result.branch_name, result.description, status);
        println!("State:    {}", result.final_state);
        if let Some(commit) = &result.commit_hash {
            println!("Commit:   {commit}");
        }
        println!("Affected: {} file(s)", result.affected_files.len());
        for path in &result.affected_files {
            println!("  {}", path.display());
        }
        for (name, outcome) in &result.validation_results {
            println!(
                "Check:    {name}: {} ({} ms)",
                if outcome.success { "passed" } else { "failed" },
                outcome.duration_ms
            );
        }
        if let Some(rollback) = &result.rollback {
            println!(
                "Rollback: {} {} -> {}",
                rollback.rollback_type.as_str(),
                if rollback.success { "succeeded" } else { "FAILED" },
                rollback.restored_state
            );
        }
        for warning in &result.warnings {
            println!("Warning:  {warning}");
        }
        if let Some(error) = &result.error {
            println!("Error:    {error}");
        }
    }

    if !result.success {
        bail!("patch '{}' failed", result.description);
    }
    Ok(())
}

/// Roll back a branch
async fn cmd_rollback(app: &App, branch: &str, rollback_type: RollbackType, options: RollbackOptions) -> Result<()> {
    let result = RollbackManager::new(&app.context)
        .rollback_with(branch, rollback_type, &options)
        .await;

    if app.json {
        print_json(&result)?;
    } else {
        println!(
            "{} {}: {}",
            rollback_type.as_str(),
            branch,
            if result.success {
                result.restored_state.as_str()
            } else {
                result.error.as_deref().unwrap_or("failed")
            }
        );
    }
    if !result.success {
        bail!("rollback of '{branch}' failed");
    }
    Ok(())
}

/// Prune stale patch branches
async fn cmd_prune(app: &App, prefix: &str, dry_run: bool) -> Result<()> {
    let report = RollbackManager::new(&app.context)
        .prune_stale_branches(prefix, dry_run)
        .await
        .context("Failed to list branches")?;

    if app.json {
        return print_json(&report);
    }
    let verb = if dry_run { "Would delete" } else { "Deleted" };
    for name in &report.deleted {
        println!("{verb}: {name}");
    }
    for name in &report.failed {
        println!("Failed:  {name}");
    }
    println!("Kept {} branch(es)", report.kept.len());
    Ok(())
}

/// Parse `PATH:DAYS:PATTERN[:delete]`.
fn parse_target(raw: &str) -> Result<CleanupTarget> {
    let parts: Vec<&str> = raw.split(':').collect();
    let (path, days, pattern, disposition) = match parts.as_slice() {
        [path, days, pattern] => (*path, *days, *pattern, Disposition::Archive),
        [path, days, pattern, "delete"] => (*path, *days, *pattern, Disposition::Delete),
        [path, days, pattern, "archive"] => (*path, *days, *pattern, Disposition::Archive),
        _ => bail!("invalid target '{raw}', expected PATH:DAYS:PATTERN[:delete]"),
    };
    let days: u32 = days
        .parse()
        .with_context(|| format!("invalid age '{days}' in target '{raw}'"))?;
    Ok(CleanupTarget::new(path, days, pattern)?.with_disposition(disposition))
}

/// Asks on the terminal before deleting.
struct StdinConfirmation;

impl Confirmation for StdinConfirmation {
    fn confirm(&self, target: &CleanupTarget, files: &[PathBuf]) -> bool {
        let mut stderr = std::io::stderr();
        let _ = writeln!(
            stderr,
            "Delete {} file(s) matching '{}' under '{}'?",
            files.len(),
            target.pattern(),
            target.path().display()
        );
        for file in files.iter().take(20) {
            let _ = writeln!(stderr, "  {}", file.display());
        }
        if files.len() > 20 {
            let _ = writeln!(stderr, "  ... and {} more", files.len() - 20);
        }
        let _ = write!(stderr, "[y/N] ");
        let _ = stderr.flush();

        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

/// Consolidate backup artifacts
async fn cmd_consolidate(app: &App, dry_run: bool, force: bool, raw_targets: &[String]) -> Result<()> {
    let consolidator = ArtifactConsolidator::new(app.context.clone(), app.config.consolidation.clone());
    let targets = if raw_targets.is_empty() {
        consolidator.configured_targets().to_vec()
    } else {
        raw_targets.iter().map(|t| parse_target(t)).collect::<Result<Vec<_>>>()?
    };

    let options = ConsolidateOptions {
        dry_run,
        force,
        confirmation: Some(Arc::new(StdinConfirmation)),
        cancel: app.cancel.clone(),
    };
    let manifest = consolidator
        .consolidate(&targets, &options)
        .await
        .context("Consolidation could not start")?;

    if app.json {
        return print_json(&manifest);
    }
    let verb = if dry_run { "Would process" } else { "Processed" };
    println!(
        "{verb} {} file(s), {} byte(s) -> {}",
        manifest.files_processed,
        manifest.total_size_bytes,
        manifest.destination.display()
    );
    for entry in &manifest.moved_files {
        let action = match entry.action {
            Disposition::Archive => "archive",
            Disposition::Delete if entry.pending_confirmation => "delete (needs confirmation)",
            Disposition::Delete => "delete",
        };
        println!("  {action}: {}", entry.source.display());
    }
    for failed in &manifest.failed_files {
        println!("  failed: {} ({})", failed.path.display(), failed.reason);
    }
    for warning in &manifest.warnings {
        println!("Warning: {warning}");
    }
    if manifest.cancelled {
        bail!("consolidation was cancelled");
    }
    Ok(())
}

fn report_modes(modes: &[ModeArg]) -> Vec<ReportMode> {
    if modes.is_empty() || modes.iter().any(|m| matches!(m, ModeArg::All)) {
        return ReportMode::ALL.to_vec();
    }
    let mut out = Vec::new();
    for mode in modes {
        let mode = match mode {
            ModeArg::Summary => ReportMode::Summary,
            ModeArg::Detailed => ReportMode::Detailed,
            ModeArg::Historical => ReportMode::Historical,
            ModeArg::Size => ReportMode::SizeAnalysis,
            ModeArg::All => continue,
        };
        if !out.contains(&mode) {
            out.push(mode);
        }
    }
    out
}

/// Analyze backup artifacts
async fn cmd_analyze(app: &App, modes: &[ModeArg], patterns: &[String], archive: bool) -> Result<()> {
    let root = app.context.root();
    let settings = &app.config.consolidation;
    let now = Utc::now();
    let exclusions = Exclusions::new(root, &settings.archive_root, &settings.extra_exclusions, now);

    let files = if archive {
        inventory_archive(&root.join(&settings.archive_root))
    } else if !patterns.is_empty() {
        scan_inventory(root, patterns, &exclusions)?
    } else {
        inventory_for_targets(root, &settings.targets, &exclusions)
    };
    info!(files = files.len(), archive, "inventory complete");

    let reports = analyze_all(Arc::new(files), &report_modes(modes), now).await;
    if app.json {
        return print_json(&reports);
    }
    for report in &reports {
        println!("{}", render_report_md(report));
    }
    Ok(())
}

fn tracker_for(app: &App) -> Result<Arc<dyn IssueTracker>> {
    let repository = app
        .config
        .issues
        .github_repo
        .clone()
        .or_else(|| std::env::var("GITHUB_REPOSITORY").ok().filter(|r| !r.is_empty()));
    let Some(repository) = repository else {
        bail!(
            "no issue tracker configured; set issues.github_repo in {} or GITHUB_REPOSITORY",
            config_hint(app.context.root())
        );
    };
    let tracker = GitHubIssueTracker::from_env(&repository).context("Failed to create GitHub issue tracker")?;
    Ok(Arc::new(tracker))
}

fn config_hint(root: &Path) -> String {
    root.join(patchctl_core::config::CONFIG_FILE_NAME).display().to_string()
}

/// File a failure report
async fn cmd_issue(
    app: &App,
    title: &str,
    body: Option<String>,
    category: Option<IssueCategory>,
    dry_run: bool,
) -> Result<()> {
    let body = match body {
        Some(body) => body,
        None => {
            let mut buf = String::new();
            for line in std::io::stdin().lock().lines() {
                buf.push_str(&line.context("Failed to read body from stdin")?);
                buf.push('\n');
            }
            buf
        }
    };
    let candidate = match category {
        Some(category) => IssueRecord::with_category(title, body, category),
        None => IssueRecord::candidate(title, body),
    }
    .environment(app.context.environment_snapshot().await);

    let guard = IssueDuplicationGuard::new(tracker_for(app)?, &app.config.issues);
    if dry_run {
        let evaluation = guard.evaluate(&candidate).await;
        if app.json {
            return print_json(&evaluation);
        }
        println!("Category: {}", candidate.category);
        println!("Decision: {}", evaluation.decision.as_str());
        for warning in &evaluation.warnings {
            println!("Warning:  {warning}");
        }
        return Ok(());
    }

    let outcome = guard.report(candidate).await.context("Failed to file issue")?;
    if app.json {
        return print_json(&outcome);
    }
    println!(
        "{} #{} \"{}\" (occurrences: {})",
        outcome.decision.as_str(),
        outcome.record.id.as_deref().unwrap_or("?"),
        outcome.record.title,
        outcome.record.occurrence_counter
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn target_spec_parsing() {
        let target = parse_target("build:7:*.tmp:delete").unwrap();
        assert_eq!(target.path(), Path::new("build"));
        assert_eq!(target.max_age_days(), 7);
        assert_eq!(target.disposition(), Disposition::Delete);

        assert_eq!(parse_target(".:30:*.bak").unwrap().disposition(), Disposition::Archive);
        assert!(parse_target("build:seven:*.tmp").is_err());
        assert!(parse_target("build").is_err());
        assert!(parse_target("/abs:1:*.x").is_err());
    }

    #[test]
    fn all_mode_expands() {
        assert_eq!(report_modes(&[]), ReportMode::ALL.to_vec());
        assert_eq!(report_modes(&[ModeArg::Size, ModeArg::All]), ReportMode::ALL.to_vec());
        assert_eq!(
            report_modes(&[ModeArg::Size, ModeArg::Summary, ModeArg::Size]),
            vec![ReportMode::SizeAnalysis, ReportMode::Summary]
        );
    }
}
