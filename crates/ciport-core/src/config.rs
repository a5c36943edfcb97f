use std::collections::HashMap;
use std::time::Duration;

use crate::types::ErrorKind;

/// Gate policy deciding whether a PR is opened when validation gates fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// Lint and double-check must pass before a PR is opened.
    Strict,
    /// Only lint gates PR creation.
    LintOnly,
    /// Always open a PR (for feedback collection).
    Permissive,
    /// Report only, never open a PR.
    DryRun,
}

impl Strictness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strictness::Strict => "strict",
            Strictness::LintOnly => "lint_only",
            Strictness::Permissive => "permissive",
            Strictness::DryRun => "dry_run",
        }
    }
}

impl std::str::FromStr for Strictness {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(Strictness::Strict),
            "lint_only" => Ok(Strictness::LintOnly),
            "permissive" => Ok(Strictness::Permissive),
            "dry_run" => Ok(Strictness::DryRun),
            other => Err(format!(
                "unknown strictness '{other}' (expected strict|lint_only|permissive|dry_run)"
            )),
        }
    }
}

impl std::fmt::Display for Strictness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full batch-pipeline configuration, assembled by the CLI from flags,
/// environment and `.env`.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub input_file: String,
    pub output_file: String,

    pub strictness: Strictness,
    pub pr_on_lint_fail: bool,
    pub pr_on_double_check_fail: bool,
    /// Skip the (expensive) semantic check when lint already failed.
    pub skip_double_check_on_lint_fail: bool,

    pub max_concurrent: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,

    pub llm_provider: String,
    pub llm_model: String,
    pub llm_api_key: String,
    pub llm_base_url: Option<String>,

    /// Host credentials, rotated on throttling.
    pub github_tokens: Vec<String>,
    pub branch_prefix: String,
    pub target_branch: String,

    pub resume: bool,

    /// Run migrated workflows in the host's job runner and watch them.
    pub cloud_verify: bool,
    /// Budget for one workflow run to reach a terminal state.
    pub cloud_verify_timeout: Duration,
    /// Repair attempts per row before the strictness policy decides.
    pub cloud_verify_retries: u32,

    /// Drain budget after an interrupt before the queue is hard-cancelled.
    pub shutdown_grace: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_file: String::new(),
            output_file: "results.csv".into(),
            strictness: Strictness::Strict,
            pr_on_lint_fail: false,
            pr_on_double_check_fail: false,
            skip_double_check_on_lint_fail: true,
            max_concurrent: 2,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            llm_provider: "xai".into(),
            llm_model: "grok-4-1-fast-reasoning".into(),
            llm_api_key: String::new(),
            llm_base_url: None,
            github_tokens: Vec::new(),
            branch_prefix: "ciport/migrated".into(),
            target_branch: "main".into(),
            resume: false,
            cloud_verify: false,
            cloud_verify_timeout: Duration::from_secs(600),
            cloud_verify_retries: 2,
            shutdown_grace: Duration::from_secs(45),
        }
    }
}

impl PipelineConfig {
    /// Whether the semantic double-check should run at all for this row.
    pub fn should_run_double_check(&self, lint_passed: bool) -> bool {
        if self.strictness == Strictness::DryRun {
            // Still run it: dry runs exist to report what would happen.
            return true;
        }
        if !lint_passed && self.skip_double_check_on_lint_fail {
            return false;
        }
        true
    }

    /// The static gate: may this row proceed toward a PR given the lint and
    /// double-check outcomes?
    pub fn should_create_pr(&self, lint_passed: bool, double_check_passed: bool) -> bool {
        match self.strictness {
            Strictness::DryRun => false,
            Strictness::Permissive => true,
            Strictness::LintOnly => lint_passed || self.pr_on_lint_fail,
            Strictness::Strict => {
                if !lint_passed {
                    return self.pr_on_lint_fail;
                }
                if !double_check_passed {
                    return self.pr_on_double_check_fail;
                }
                true
            }
        }
    }

    /// The runtime gate: after the workflow run has been observed (or given
    /// up on), may the PR still be opened? `Secret` is "verified as far as
    /// possible" and always passes outside dry runs; exhausted/timeout/
    /// unknown outcomes pass only under the lenient policies.
    pub fn should_open_pr_after_runtime(&self, kind: ErrorKind) -> bool {
        if self.strictness == Strictness::DryRun {
            return false;
        }
        match kind {
            ErrorKind::None | ErrorKind::Secret => true,
            ErrorKind::Fixable | ErrorKind::Timeout | ErrorKind::Unknown => {
                matches!(self.strictness, Strictness::LintOnly | Strictness::Permissive)
            }
        }
    }
}

// ── Environment helpers ──────────────────────────────────────────────────

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

/// Load `.env` into the process environment without clobbering variables
/// that are already set. Call once at startup, before argument parsing, so
/// env-backed flags see the merged view.
pub fn load_dotenv() {
    for (k, v) in parse_dotenv() {
        if std::env::var_os(&k).is_none() {
            std::env::set_var(k, v);
        }
    }
}

/// Split a comma-separated credential list, dropping empties.
pub fn split_tokens(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(strictness: Strictness) -> PipelineConfig {
        PipelineConfig {
            strictness,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn strict_requires_both_gates() {
        let c = config(Strictness::Strict);
        assert!(c.should_create_pr(true, true));
        assert!(!c.should_create_pr(false, true));
        assert!(!c.should_create_pr(true, false));
    }

    #[test]
    fn strict_overrides_open_individual_gates() {
        let mut c = config(Strictness::Strict);
        c.pr_on_lint_fail = true;
        assert!(c.should_create_pr(false, true));
        assert!(!c.should_create_pr(true, false));
        c.pr_on_double_check_fail = true;
        assert!(c.should_create_pr(true, false));
    }

    #[test]
    fn lint_only_ignores_double_check() {
        let c = config(Strictness::LintOnly);
        assert!(c.should_create_pr(true, false));
        assert!(!c.should_create_pr(false, true));
    }

    #[test]
    fn permissive_always_opens() {
        let c = config(Strictness::Permissive);
        assert!(c.should_create_pr(false, false));
    }

    #[test]
    fn dry_run_never_opens() {
        let c = config(Strictness::DryRun);
        assert!(!c.should_create_pr(true, true));
        assert!(!c.should_open_pr_after_runtime(ErrorKind::None));
    }

    #[test]
    fn double_check_skipped_after_lint_failure() {
        let c = config(Strictness::Strict);
        assert!(c.should_run_double_check(true));
        assert!(!c.should_run_double_check(false));
        // Dry runs report everything.
        assert!(config(Strictness::DryRun).should_run_double_check(false));
    }

    #[test]
    fn runtime_gate_matrix() {
        for kind in [ErrorKind::None, ErrorKind::Secret] {
            assert!(config(Strictness::Strict).should_open_pr_after_runtime(kind));
            assert!(config(Strictness::LintOnly).should_open_pr_after_runtime(kind));
            assert!(config(Strictness::Permissive).should_open_pr_after_runtime(kind));
        }
        for kind in [ErrorKind::Fixable, ErrorKind::Timeout, ErrorKind::Unknown] {
            assert!(!config(Strictness::Strict).should_open_pr_after_runtime(kind));
            assert!(config(Strictness::LintOnly).should_open_pr_after_runtime(kind));
            assert!(config(Strictness::Permissive).should_open_pr_after_runtime(kind));
        }
    }

    #[test]
    fn split_tokens_trims_and_drops_empties() {
        assert_eq!(split_tokens("a, b,,c ,"), vec!["a", "b", "c"]);
        assert!(split_tokens("").is_empty());
    }

    #[test]
    fn strictness_parses() {
        assert_eq!("lint_only".parse::<Strictness>(), Ok(Strictness::LintOnly));
        assert!("lenient".parse::<Strictness>().is_err());
    }
}
