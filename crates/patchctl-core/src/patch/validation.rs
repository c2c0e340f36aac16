//! Validation capabilities run after the operation has been applied.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::error::PatchError;
use crate::process::{run_command, truncate_output, CommandSpec};

const MAX_DETAILS_CHARS: usize = 4000;

/// Result of a single validation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub success: bool,
    /// Truncated output or the reason the step did not finish.
    pub details: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Set when the step was stopped by its timeout or by cancellation.
    #[serde(default)]
    pub interrupted: bool,
}

impl ValidationOutcome {
    pub fn passed(details: impl Into<String>) -> Self {
        Self {
            success: true,
            details: details.into(),
            exit_code: Some(0),
            duration_ms: 0,
            interrupted: false,
        }
    }

    pub fn failed(details: impl Into<String>) -> Self {
        Self {
            success: false,
            details: details.into(),
            exit_code: None,
            duration_ms: 0,
            interrupted: false,
        }
    }
}

/// A check that decides whether an applied patch is acceptable.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Key under which the outcome is reported.
    fn name(&self) -> String;

    async fn validate(&self, workdir: &Path, cancel: &CancellationToken) -> ValidationOutcome;
}

/// Runs a shell command; exit code 0 passes.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    command: String,
    timeout: Duration,
}

impl CommandValidator {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Validator for CommandValidator {
    fn name(&self) -> String {
        self.command.clone()
    }

    async fn validate(&self, workdir: &Path, cancel: &CancellationToken) -> ValidationOutcome {
        let spec = CommandSpec::shell(&self.command, workdir, self.timeout);
        tracing::info!(command = %self.command, "running validation");
        match run_command(&spec, cancel).await {
            Ok(output) => {
                if !output.success {
                    tracing::warn!(command = %self.command, exit_code = ?output.exit_code, "validation failed");
                }
                ValidationOutcome {
                    success: output.success,
                    details: truncate_output(&output.combined(), MAX_DETAILS_CHARS),
                    exit_code: output.exit_code,
                    duration_ms: output.duration_ms,
                    interrupted: false,
                }
            }
            Err(e) => {
                tracing::warn!(command = %self.command, error = %e, "validation did not finish");
                ValidationOutcome {
                    success: false,
                    details: e.to_string(),
                    exit_code: None,
                    duration_ms: 0,
                    interrupted: matches!(e, PatchError::Timeout { .. } | PatchError::Cancelled(_)),
                }
            }
        }
    }
}

/// Unique report key for `name`: repeated names get `#2`, `#3`, ...
pub(crate) fn unique_key<V>(existing: &std::collections::BTreeMap<String, V>, name: &str) -> String {
    if !existing.contains_key(name) {
        return name.to_string();
    }
    (2..)
        .map(|n| format!("{name} #{n}"))
        .find(|candidate| !existing.contains_key(candidate))
        .unwrap_or_else(|| name.to_string())
}
