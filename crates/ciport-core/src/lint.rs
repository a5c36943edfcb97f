use std::io::Write;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::types::{StageStatus, ValidationOutcome};

const ACTIONLINT_TIMEOUT: Duration = Duration::from_secs(30);

/// How the linter's output is classified. The non-blocking category is
/// deliberately narrow: only action-version advisories and informational
/// shellcheck notes qualify, and only with zero blocking diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LintSeverity {
    /// No diagnostics at all.
    Clean,
    /// Only advisories; the workflow is acceptable as-is.
    NonBlocking,
    /// At least one diagnostic that breaks the workflow.
    Blocking,
    /// Diagnostics of no recognised class; the exit code decides.
    Other,
}

/// Validate a generated workflow: YAML parse first, then `actionlint`.
/// A YAML parse failure short-circuits; the linter never runs.
pub async fn validate_workflow(yaml: &str) -> ValidationOutcome {
    let mut out = ValidationOutcome::default();

    if let Err(e) = serde_yaml::from_str::<serde_yaml::Value>(yaml) {
        out.yaml_valid = false;
        out.lint_valid = false;
        out.messages = vec![format!("YAML syntax error: {e}")];
        out.status = StageStatus::Failed;
        return out;
    }
    out.yaml_valid = true;

    match run_actionlint(yaml).await {
        Ok(None) => {
            // Linter not installed; the parse check stands alone.
            out.lint_valid = true;
            out.messages = vec!["actionlint not available; lint step skipped".into()];
            out.status = StageStatus::Success;
        }
        Ok(Some(run)) => {
            out.lint_valid = run.passed;
            out.messages = run.messages;
            out.status = if run.passed {
                StageStatus::Success
            } else {
                StageStatus::Failed
            };
        }
        Err(e) => {
            warn!("actionlint invocation failed: {e}");
            out.lint_valid = false;
            out.messages = vec![format!("actionlint error: {e}")];
            out.status = StageStatus::Failed;
        }
    }
    out
}

struct LintRun {
    passed: bool,
    messages: Vec<String>,
}

/// Run `actionlint` on the YAML via a scratch file. `Ok(None)` when the
/// binary is unavailable.
async fn run_actionlint(yaml: &str) -> anyhow::Result<Option<LintRun>> {
    let probe = Command::new("actionlint").arg("--version").output().await;
    if probe.is_err() {
        debug!("actionlint binary not found");
        return Ok(None);
    }

    let mut file = tempfile::Builder::new().suffix(".yml").tempfile()?;
    file.write_all(yaml.as_bytes())?;
    file.flush()?;
    let temp_path = file.path().to_string_lossy().into_owned();

    let output = match tokio::time::timeout(
        ACTIONLINT_TIMEOUT,
        Command::new("actionlint")
            .arg(&temp_path)
            .kill_on_drop(true)
            .output(),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => {
            return Ok(Some(LintRun {
                passed: false,
                messages: vec!["actionlint timed out".into()],
            }));
        }
    };

    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );

    let severity = classify_lint_output(&text);
    let passed = match severity {
        LintSeverity::Clean | LintSeverity::NonBlocking => true,
        LintSeverity::Blocking => false,
        LintSeverity::Other => output.status.success(),
    };

    let mut messages: Vec<String> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.replace(&temp_path, "workflow.yml"))
        .collect();
    if severity == LintSeverity::NonBlocking {
        messages.push("[Note: non-blocking warnings; consider updating action versions to @v4]".into());
    }

    Ok(Some(LintRun { passed, messages }))
}

/// Pure classifier over the linter's human-readable output; the semantic
/// verifier and the PR gate both rely on this taxonomy, so it must stay in
/// lock-step with the linter's diagnostic tags.
pub fn classify_lint_output(output: &str) -> LintSeverity {
    if output.trim().is_empty() {
        return LintSeverity::Clean;
    }
    let lower = output.to_lowercase();

    let has_syntax = output.contains("[syntax-check]");
    let has_expression = output.contains("[expression]");
    let has_type = output.contains("[type-check]");
    let has_runner_label = output.contains("[runner-label]");
    let has_action = output.contains("[action]");

    let is_action_too_old =
        lower.contains("action is too old") || lower.contains("is too old to run");
    let is_shellcheck_info = lower.contains(":info:") && output.contains("[shellcheck]");

    let has_blocking = has_syntax
        || has_expression
        || has_type
        || has_runner_label
        || (has_action && !is_action_too_old);

    if has_blocking {
        LintSeverity::Blocking
    } else if is_action_too_old || is_shellcheck_info {
        LintSeverity::NonBlocking
    } else {
        LintSeverity::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_output_is_clean() {
        assert_eq!(classify_lint_output(""), LintSeverity::Clean);
        assert_eq!(classify_lint_output("  \n"), LintSeverity::Clean);
    }

    #[test]
    fn syntax_errors_block() {
        let out = "workflow.yml:3:1: unexpected key \"foo\" [syntax-check]";
        assert_eq!(classify_lint_output(out), LintSeverity::Blocking);
    }

    #[test]
    fn expression_and_type_errors_block() {
        assert_eq!(
            classify_lint_output("workflow.yml:9:12: undefined variable \"x\" [expression]"),
            LintSeverity::Blocking
        );
        assert_eq!(
            classify_lint_output("workflow.yml:4:5: type mismatch [type-check]"),
            LintSeverity::Blocking
        );
    }

    #[test]
    fn invalid_runner_label_blocks() {
        let out = "workflow.yml:6:14: label \"ubunt-latest\" is unknown [runner-label]";
        assert_eq!(classify_lint_output(out), LintSeverity::Blocking);
    }

    #[test]
    fn action_too_old_alone_is_non_blocking() {
        let out = "workflow.yml:12:15: the runner of \"actions/checkout@v2\" action is too old to run on GitHub Actions [action]";
        assert_eq!(classify_lint_output(out), LintSeverity::NonBlocking);
    }

    #[test]
    fn other_action_errors_block() {
        let out = "workflow.yml:12:15: could not parse action metadata [action]";
        assert_eq!(classify_lint_output(out), LintSeverity::Blocking);
    }

    #[test]
    fn shellcheck_info_alone_is_non_blocking() {
        let out = "workflow.yml:20:9: shellcheck reported issue in this script: SC2086:info:1:5: Double quote to prevent globbing [shellcheck]";
        assert_eq!(classify_lint_output(out), LintSeverity::NonBlocking);
    }

    #[test]
    fn shellcheck_warning_defers_to_exit_code() {
        let out = "workflow.yml:20:9: shellcheck reported issue in this script: SC2086:warning:1:5: quote this [shellcheck]";
        assert_eq!(classify_lint_output(out), LintSeverity::Other);
    }

    #[test]
    fn advisory_plus_blocking_still_blocks() {
        let out = "workflow.yml:12:15: action is too old to run [action]\nworkflow.yml:3:1: bad key [syntax-check]";
        assert_eq!(classify_lint_output(out), LintSeverity::Blocking);
    }

    #[tokio::test]
    async fn yaml_parse_failure_short_circuits() {
        let out = validate_workflow("on: [push\njobs: {").await;
        assert!(!out.yaml_valid);
        assert!(!out.lint_valid);
        assert_eq!(out.status, StageStatus::Failed);
        assert!(out.messages[0].starts_with("YAML syntax error"));
    }
}
