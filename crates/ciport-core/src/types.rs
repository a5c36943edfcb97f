use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── CI kinds ─────────────────────────────────────────────────────────────

/// Legacy CI systems the detector recognises. GitHub Actions is the
/// migration target and is deliberately absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CiKind {
    #[serde(rename = "circleci")]
    CircleCi,
    #[serde(rename = "travis")]
    Travis,
    #[serde(rename = "gitlab")]
    Gitlab,
    #[serde(rename = "jenkins")]
    Jenkins,
    #[serde(rename = "azure-pipelines")]
    AzurePipelines,
    #[serde(rename = "bitbucket")]
    Bitbucket,
    #[serde(rename = "drone")]
    Drone,
    #[serde(rename = "semaphore")]
    Semaphore,
    #[serde(rename = "buildkite")]
    Buildkite,
    #[serde(rename = "appveyor")]
    Appveyor,
    #[serde(rename = "codefresh")]
    Codefresh,
}

impl CiKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CiKind::CircleCi => "circleci",
            CiKind::Travis => "travis",
            CiKind::Gitlab => "gitlab",
            CiKind::Jenkins => "jenkins",
            CiKind::AzurePipelines => "azure-pipelines",
            CiKind::Bitbucket => "bitbucket",
            CiKind::Drone => "drone",
            CiKind::Semaphore => "semaphore",
            CiKind::Buildkite => "buildkite",
            CiKind::Appveyor => "appveyor",
            CiKind::Codefresh => "codefresh",
        }
    }

    /// Human-facing name for PR titles and bodies ("azure-pipelines" →
    /// "Azure Pipelines").
    pub fn display_name(&self) -> String {
        self.as_str()
            .split('-')
            .map(|w| {
                let mut chars = w.chars();
                match chars.next() {
                    Some(c) => c.to_uppercase().chain(chars).collect::<String>(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn parse(s: &str) -> Option<CiKind> {
        match s {
            "circleci" => Some(CiKind::CircleCi),
            "travis" => Some(CiKind::Travis),
            "gitlab" => Some(CiKind::Gitlab),
            "jenkins" => Some(CiKind::Jenkins),
            "azure-pipelines" => Some(CiKind::AzurePipelines),
            "bitbucket" => Some(CiKind::Bitbucket),
            "drone" => Some(CiKind::Drone),
            "semaphore" => Some(CiKind::Semaphore),
            "buildkite" => Some(CiKind::Buildkite),
            "appveyor" => Some(CiKind::Appveyor),
            "codefresh" => Some(CiKind::Codefresh),
            _ => None,
        }
    }
}

impl std::fmt::Display for CiKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Stage / row status ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Success => "success",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> StageStatus {
        match s {
            "running" => StageStatus::Running,
            "success" => StageStatus::Success,
            "failed" => StageStatus::Failed,
            "skipped" => StageStatus::Skipped,
            _ => StageStatus::Pending,
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row-level status. `RuntimePending` is first-class: the row has been
/// written to disk while its workflow run is still being watched on the
/// verification queue, and will be updated in place exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    #[default]
    Pending,
    RuntimePending,
    Success,
    Partial,
    Failed,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::Pending => "pending",
            OverallStatus::RuntimePending => "runtime_pending",
            OverallStatus::Success => "success",
            OverallStatus::Partial => "partial",
            OverallStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> OverallStatus {
        match s {
            "runtime_pending" => OverallStatus::RuntimePending,
            "success" => OverallStatus::Success,
            "partial" => OverallStatus::Partial,
            "failed" => OverallStatus::Failed,
            _ => OverallStatus::Pending,
        }
    }

    /// Terminal rows are never re-processed in resume mode.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OverallStatus::Pending | OverallStatus::RuntimePending)
    }
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Runtime error classification ─────────────────────────────────────────

/// What a failed workflow run's logs tell us. Only `Fixable` is eligible
/// for the repair agent; `Secret` is a user-configuration matter and counts
/// as "verified as far as possible".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[default]
    None,
    Secret,
    Fixable,
    Timeout,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::None => "",
            ErrorKind::Secret => "secret",
            ErrorKind::Fixable => "fixable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> ErrorKind {
        match s {
            "secret" => ErrorKind::Secret,
            "fixable" => ErrorKind::Fixable,
            "timeout" => ErrorKind::Timeout,
            "unknown" => ErrorKind::Unknown,
            _ => ErrorKind::None,
        }
    }
}

// ── Repository input ─────────────────────────────────────────────────────

/// One input repository. Identity is the URL; owner/name are derived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoRef {
    pub url: String,
    /// Base branch PRs target (defaults to "main").
    pub target_branch: String,
}

impl RepoRef {
    pub fn new(url: impl Into<String>, target_branch: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            target_branch: target_branch.into(),
        }
    }

    fn path_parts(&self) -> Vec<&str> {
        self.url
            .trim_start_matches("https://github.com/")
            .trim_start_matches("http://github.com/")
            .trim_matches('/')
            .split('/')
            .collect()
    }

    pub fn owner(&self) -> String {
        let parts = self.path_parts();
        if parts.len() >= 2 {
            parts[0].to_string()
        } else {
            String::new()
        }
    }

    pub fn name(&self) -> String {
        let parts = self.path_parts();
        if parts.len() >= 2 {
            parts[1].trim_end_matches(".git").to_string()
        } else {
            self.url.clone()
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner(), self.name())
    }
}

/// A CI configuration found in a repository. At most one per kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedConfig {
    pub ci_kind: CiKind,
    pub source_path: String,
    pub source_yaml: String,
}

// ── Stage outcomes ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct DetectionOutcome {
    pub status: StageStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TranslationOutcome {
    pub status: StageStatus,
    pub attempts: u32,
    pub yaml: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub status: StageStatus,
    pub yaml_valid: bool,
    pub lint_valid: bool,
    /// One entry per linter diagnostic line (or the YAML parse error).
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DoubleCheckOutcome {
    pub status: StageStatus,
    pub passed: bool,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub missing_features: Vec<String>,
    pub hallucinated_steps: Vec<String>,
    pub error: Option<String>,
}

impl DoubleCheckOutcome {
    /// Skipped double-checks do not gate PR creation.
    pub fn passed_or_skipped(&self) -> bool {
        self.passed || self.status == StageStatus::Skipped
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOutcome {
    pub status: StageStatus,
    pub error_kind: ErrorKind,
    pub run_id: Option<u64>,
    pub run_url: Option<String>,
    pub conclusion: Option<String>,
    /// Representative slice of the failing job's logs.
    pub log_snippet: Option<String>,
    pub fix_attempts: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PullRequestOutcome {
    pub status: StageStatus,
    pub pr_url: Option<String>,
    pub pr_number: Option<u64>,
    pub fork_url: Option<String>,
    pub branch_name: Option<String>,
    pub skipped_reason: Option<String>,
    pub error: Option<String>,
}

// ── Per-row result ───────────────────────────────────────────────────────

/// One migration attempt: a (repository, detected CI kind) pair. A
/// repository with k detected CIs produces exactly k of these.
#[derive(Debug, Clone)]
pub struct RepoResult {
    pub input: RepoRef,
    pub detection: DetectionOutcome,
    /// The config this row migrates. None on detection failure / no-CI rows.
    pub config: Option<DetectedConfig>,
    /// Every CI kind found in the repository, so one row shows its siblings.
    pub all_detected: Vec<CiKind>,
    pub translation: TranslationOutcome,
    pub validation: ValidationOutcome,
    pub double_check: DoubleCheckOutcome,
    pub runtime: RuntimeOutcome,
    pub pull_request: PullRequestOutcome,
    pub overall_status: OverallStatus,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
}

impl RepoResult {
    pub fn new(input: RepoRef) -> Self {
        Self {
            input,
            detection: DetectionOutcome::default(),
            config: None,
            all_detected: Vec::new(),
            translation: TranslationOutcome::default(),
            validation: ValidationOutcome::default(),
            double_check: DoubleCheckOutcome::default(),
            runtime: RuntimeOutcome::default(),
            pull_request: PullRequestOutcome::default(),
            overall_status: OverallStatus::Pending,
            error_message: None,
            started_at: Some(Utc::now()),
            completed_at: None,
            duration_seconds: 0.0,
        }
    }

    /// Stamp completion time and duration. Idempotent on the start side.
    pub fn finalize(&mut self) {
        let now = Utc::now();
        if let Some(started) = self.started_at {
            self.duration_seconds = (now - started).num_milliseconds() as f64 / 1000.0;
        }
        self.completed_at = Some(now);
    }
}

// ── Semantic verdict ─────────────────────────────────────────────────────

/// The verifier model's JSON verdict, parsed leniently: every field has a
/// default so a sparse envelope still deserializes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawVerdict {
    #[serde(default)]
    pub passed: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub missing_features: Vec<String>,
    #[serde(default)]
    pub hallucinated_steps: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
}

impl RawVerdict {
    /// Fallback for empty or unparseable verifier output. Biased toward
    /// pass so a flaky verifier cannot discard an otherwise good
    /// translation; confidence is lowered to make the downgrade visible.
    pub fn lenient_pass() -> Self {
        Self {
            passed: true,
            reasons: vec!["verifier response was empty or unparseable; defaulting to pass".into()],
            missing_features: Vec::new(),
            hallucinated_steps: Vec::new(),
            confidence: 0.3,
        }
    }
}

// ── Runtime verification task ────────────────────────────────────────────

/// A unit of work on the secondary verification queue. Tasks re-enter the
/// queue after a successful repair with `fix_attempt` incremented; the row
/// index ties the eventual update back to the right CSV row.
#[derive(Debug, Clone)]
pub struct RuntimeTask {
    pub row_index: usize,
    pub repo: RepoRef,
    pub ci_kind: CiKind,
    pub fork_owner: String,
    pub branch: String,
    pub workflow_yaml: String,
    pub fix_attempt: u32,
    pub lint_passed: bool,
    pub double_check_passed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_ref_parses_owner_and_name() {
        let r = RepoRef::new("https://github.com/rust-lang/cargo", "main");
        assert_eq!(r.owner(), "rust-lang");
        assert_eq!(r.name(), "cargo");
        assert_eq!(r.full_name(), "rust-lang/cargo");
    }

    #[test]
    fn repo_ref_tolerates_trailing_slash_and_git_suffix() {
        let r = RepoRef::new("https://github.com/a/b.git/", "main");
        assert_eq!(r.full_name(), "a/b");
    }

    #[test]
    fn repo_ref_without_owner_falls_back_to_url() {
        let r = RepoRef::new("not-a-url", "main");
        assert_eq!(r.owner(), "");
        assert_eq!(r.name(), "not-a-url");
    }

    #[test]
    fn ci_kind_round_trips_through_str() {
        for kind in [
            CiKind::CircleCi,
            CiKind::Travis,
            CiKind::Gitlab,
            CiKind::Jenkins,
            CiKind::AzurePipelines,
            CiKind::Bitbucket,
            CiKind::Drone,
            CiKind::Semaphore,
            CiKind::Buildkite,
            CiKind::Appveyor,
            CiKind::Codefresh,
        ] {
            assert_eq!(CiKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(CiKind::parse("github-actions"), None);
    }

    #[test]
    fn ci_kind_display_name_title_cases() {
        assert_eq!(CiKind::AzurePipelines.display_name(), "Azure Pipelines");
        assert_eq!(CiKind::Travis.display_name(), "Travis");
    }

    #[test]
    fn overall_status_terminality() {
        assert!(OverallStatus::Success.is_terminal());
        assert!(OverallStatus::Partial.is_terminal());
        assert!(OverallStatus::Failed.is_terminal());
        assert!(!OverallStatus::RuntimePending.is_terminal());
        assert!(!OverallStatus::Pending.is_terminal());
    }
}
