use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::types::{
    CiKind, OverallStatus, PullRequestOutcome, RepoRef, RepoResult, RuntimeOutcome,
};

/// Every column of the flattened RepoResult, in output order. The full
/// source and translated YAML ride along so analysis needs no second file.
const COLUMNS: &[&str] = &[
    "repo_url",
    "repo_full_name",
    "target_branch",
    "detected_ci",
    "all_detected_ci",
    "detection_status",
    "source_path",
    "migration_status",
    "migration_attempts",
    "yaml_valid",
    "lint_valid",
    "lint_errors",
    "validation_status",
    "double_check_status",
    "double_check_passed",
    "double_check_confidence",
    "double_check_reasons",
    "missing_features",
    "hallucinated_steps",
    "gha_verify_status",
    "gha_run_id",
    "gha_run_url",
    "gha_run_conclusion",
    "gha_error_kind",
    "gha_fix_attempts",
    "pr_status",
    "pr_url",
    "pr_number",
    "pr_skipped_reason",
    "fork_url",
    "branch_name",
    "overall_status",
    "error_message",
    "duration_seconds",
    "started_at",
    "completed_at",
    "source_yaml",
    "migrated_yaml",
];

/// The one permitted in-place update: moving a row out of
/// `runtime_pending` once its verification has concluded.
#[derive(Debug, Clone)]
pub struct RowUpdate {
    pub runtime: RuntimeOutcome,
    pub pull_request: PullRequestOutcome,
    pub overall_status: OverallStatus,
    pub error_message: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// A `runtime_pending` row read back from disk, carrying enough to rebuild
/// its verification task and to update the row in place afterwards.
#[derive(Debug, Clone)]
pub struct PendingRow {
    pub row_index: usize,
    pub repo: RepoRef,
    pub ci_kind: Option<CiKind>,
    pub fork_owner: Option<String>,
    pub branch: Option<String>,
    pub migrated_yaml: String,
    pub fix_attempts: u32,
    pub lint_passed: bool,
    pub double_check_passed: bool,
}

#[derive(Debug, Default)]
pub struct ResumeState {
    /// Repositories with at least one terminal row; never re-processed.
    pub processed: HashSet<String>,
    /// Rows whose runtime verification was cut short.
    pub pending: Vec<PendingRow>,
}

/// Streaming CSV output: one row per (repository × detected CI), appended
/// as each row's state is finalised. The reporter is the system's
/// persistence layer (there is no database), so writes are serialised by a
/// lock and the in-place update rewrites the file atomically.
pub struct CsvReporter {
    path: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    rows: usize,
    initialized: bool,
}

impl CsvReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: Mutex::new(Inner {
                rows: 0,
                initialized: false,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the file with a header, or pick up the row count of an
    /// existing file so fresh appends index correctly after a resume.
    pub fn initialize(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.initialized {
            return Ok(());
        }
        if self.path.exists() {
            let mut reader = csv::Reader::from_path(&self.path)
                .with_context(|| format!("open {}", self.path.display()))?;
            inner.rows = reader.records().filter_map(|r| r.ok()).count();
        } else {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let mut writer = csv::Writer::from_path(&self.path)?;
            writer.write_record(COLUMNS)?;
            writer.flush()?;
            inner.rows = 0;
        }
        inner.initialized = true;
        Ok(())
    }

    /// Start a fresh output file, truncating anything already there. Used
    /// by non-resume runs so indices start at zero.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut writer = csv::Writer::from_path(&self.path)?;
        writer.write_record(COLUMNS)?;
        writer.flush()?;
        inner.rows = 0;
        inner.initialized = true;
        Ok(())
    }

    /// Append one row; returns its monotonically increasing index.
    pub fn write_result(&self, result: &RepoResult) -> Result<usize> {
        self.initialize()?;
        let mut inner = self.lock()?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer.write_record(to_record(result))?;
        writer.flush()?;
        let index = inner.rows;
        inner.rows += 1;
        Ok(index)
    }

    /// Rewrite one row in place, patching only the runtime / PR / overall
    /// columns. Whole-file rewrite through a tempfile plus atomic rename.
    pub fn update_result(&self, row_index: usize, update: &RowUpdate) -> Result<()> {
        let _inner = self.lock()?;
        let mut reader = csv::Reader::from_path(&self.path)?;
        let headers = reader.headers()?.clone();
        let col = |name: &str| -> Result<usize> {
            headers
                .iter()
                .position(|h| h == name)
                .with_context(|| format!("column '{name}' missing from {}", self.path.display()))
        };

        let mut records: Vec<csv::StringRecord> = Vec::new();
        for record in reader.records() {
            records.push(record?);
        }
        let record = records
            .get(row_index)
            .with_context(|| format!("row {row_index} not found for update"))?;

        let mut fields: Vec<String> = record.iter().map(str::to_string).collect();
        fields.resize(headers.len(), String::new());

        let rt = &update.runtime;
        fields[col("gha_verify_status")?] = rt.status.to_string();
        fields[col("gha_run_id")?] = rt.run_id.map(|id| id.to_string()).unwrap_or_default();
        fields[col("gha_run_url")?] = rt.run_url.clone().unwrap_or_default();
        fields[col("gha_run_conclusion")?] = rt.conclusion.clone().unwrap_or_default();
        fields[col("gha_error_kind")?] = rt.error_kind.as_str().to_string();
        fields[col("gha_fix_attempts")?] = rt.fix_attempts.to_string();

        let pr = &update.pull_request;
        fields[col("pr_status")?] = pr.status.to_string();
        fields[col("pr_url")?] = pr.pr_url.clone().unwrap_or_default();
        fields[col("pr_number")?] = pr.pr_number.map(|n| n.to_string()).unwrap_or_default();
        fields[col("pr_skipped_reason")?] = pr.skipped_reason.clone().unwrap_or_default();

        fields[col("overall_status")?] = update.overall_status.to_string();
        fields[col("error_message")?] = update.error_message.clone().unwrap_or_default();
        fields[col("completed_at")?] = update.completed_at.to_rfc3339();
        if let Ok(started) =
            DateTime::parse_from_rfc3339(&fields[col("started_at")?])
        {
            let secs = (update.completed_at - started.with_timezone(&Utc)).num_milliseconds()
                as f64
                / 1000.0;
            fields[col("duration_seconds")?] = format!("{secs:.2}");
        }

        records[row_index] = csv::StringRecord::from(fields);

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let tmp = tempfile::NamedTempFile::new_in(&dir)?;
        {
            let mut writer = csv::Writer::from_writer(tmp.as_file());
            writer.write_record(&headers)?;
            for record in &records {
                writer.write_record(record)?;
            }
            writer.flush()?;
        }
        tmp.persist(&self.path)
            .map_err(|e| anyhow::anyhow!("persist updated results: {e}"))?;
        Ok(())
    }

    /// Scan an existing output file: which repositories are done, and which
    /// rows went to disk as `runtime_pending` and need re-queueing.
    pub fn load_for_resume(&self) -> Result<ResumeState> {
        let mut state = ResumeState::default();
        if !self.path.exists() {
            return Ok(state);
        }
        let mut reader = csv::Reader::from_path(&self.path)?;
        let headers = reader.headers()?.clone();
        let col = |name: &str| headers.iter().position(|h| h == name);
        let field = |record: &csv::StringRecord, name: &str| -> String {
            col(name)
                .and_then(|i| record.get(i))
                .unwrap_or_default()
                .to_string()
        };

        for (index, record) in reader.records().enumerate() {
            let record = record?;
            let repo_url = field(&record, "repo_url");
            if repo_url.is_empty() {
                continue;
            }
            let overall = OverallStatus::parse(&field(&record, "overall_status"));
            if overall == OverallStatus::RuntimePending {
                let target_branch = match field(&record, "target_branch") {
                    b if b.is_empty() => "main".to_string(),
                    b => b,
                };
                state.pending.push(PendingRow {
                    row_index: index,
                    repo: RepoRef::new(repo_url, target_branch),
                    ci_kind: CiKind::parse(&field(&record, "detected_ci")),
                    fork_owner: fork_owner_from_url(&field(&record, "fork_url")),
                    branch: match field(&record, "branch_name") {
                        b if b.is_empty() => None,
                        b => Some(b),
                    },
                    migrated_yaml: field(&record, "migrated_yaml"),
                    fix_attempts: field(&record, "gha_fix_attempts").parse().unwrap_or(0),
                    lint_passed: field(&record, "lint_valid") == "true",
                    double_check_passed: field(&record, "double_check_passed") == "true",
                });
            } else if overall.is_terminal() {
                state.processed.insert(repo_url);
            }
        }
        Ok(state)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("reporter lock poisoned"))
    }
}

fn fork_owner_from_url(url: &str) -> Option<String> {
    let path = url
        .trim_start_matches("https://github.com/")
        .trim_start_matches("http://github.com/");
    let owner = path.split('/').next().unwrap_or_default();
    if owner.is_empty() || owner == url {
        None
    } else {
        Some(owner.to_string())
    }
}

fn join_semi(items: &[String]) -> String {
    items.join("; ")
}

fn to_record(r: &RepoResult) -> Vec<String> {
    let kinds: Vec<String> = r.all_detected.iter().map(|k| k.to_string()).collect();
    vec![
        r.input.url.clone(),
        r.input.full_name(),
        r.input.target_branch.clone(),
        r.config.as_ref().map(|c| c.ci_kind.to_string()).unwrap_or_default(),
        kinds.join(","),
        r.detection.status.to_string(),
        r.config.as_ref().map(|c| c.source_path.clone()).unwrap_or_default(),
        r.translation.status.to_string(),
        r.translation.attempts.to_string(),
        r.validation.yaml_valid.to_string(),
        r.validation.lint_valid.to_string(),
        join_semi(&r.validation.messages),
        r.validation.status.to_string(),
        r.double_check.status.to_string(),
        r.double_check.passed.to_string(),
        format!("{:.2}", r.double_check.confidence),
        join_semi(&r.double_check.reasons),
        join_semi(&r.double_check.missing_features),
        join_semi(&r.double_check.hallucinated_steps),
        r.runtime.status.to_string(),
        r.runtime.run_id.map(|id| id.to_string()).unwrap_or_default(),
        r.runtime.run_url.clone().unwrap_or_default(),
        r.runtime.conclusion.clone().unwrap_or_default(),
        r.runtime.error_kind.as_str().to_string(),
        r.runtime.fix_attempts.to_string(),
        r.pull_request.status.to_string(),
        r.pull_request.pr_url.clone().unwrap_or_default(),
        r.pull_request.pr_number.map(|n| n.to_string()).unwrap_or_default(),
        r.pull_request.skipped_reason.clone().unwrap_or_default(),
        r.pull_request.fork_url.clone().unwrap_or_default(),
        r.pull_request.branch_name.clone().unwrap_or_default(),
        r.overall_status.to_string(),
        r.error_message.clone().unwrap_or_default(),
        format!("{:.2}", r.duration_seconds),
        r.started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        r.completed_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        r.config.as_ref().map(|c| c.source_yaml.clone()).unwrap_or_default(),
        r.translation.yaml.clone().unwrap_or_default(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DetectedConfig, StageStatus};

    fn sample_result(url: &str, kind: CiKind, overall: OverallStatus) -> RepoResult {
        let mut r = RepoResult::new(RepoRef::new(url, "main"));
        r.config = Some(DetectedConfig {
            ci_kind: kind,
            source_path: ".travis.yml".into(),
            source_yaml: "language: python\nscript: pytest".into(),
        });
        r.all_detected = vec![kind];
        r.detection.status = StageStatus::Success;
        r.translation.status = StageStatus::Success;
        r.translation.attempts = 1;
        r.translation.yaml = Some("name: CI\non: [push]\njobs: {}".into());
        r.overall_status = overall;
        r.pull_request.fork_url = Some("https://github.com/ciport-bot/demo".into());
        r.pull_request.branch_name = Some("ciport/migrated-travis-to-gha".into());
        r.finalize();
        r
    }

    #[test]
    fn record_width_matches_header() {
        let r = sample_result("https://github.com/a/b", CiKind::Travis, OverallStatus::Success);
        assert_eq!(to_record(&r).len(), COLUMNS.len());
    }

    #[test]
    fn write_assigns_monotonic_indices() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = CsvReporter::new(dir.path().join("out.csv"));
        for i in 0..5 {
            let r = sample_result(
                &format!("https://github.com/a/r{i}"),
                CiKind::Travis,
                OverallStatus::Success,
            );
            assert_eq!(reporter.write_result(&r).unwrap(), i);
        }
        let mut reader = csv::Reader::from_path(reporter.path()).unwrap();
        assert_eq!(reader.records().count(), 5);
    }

    #[test]
    fn yaml_with_newlines_and_commas_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = CsvReporter::new(dir.path().join("out.csv"));
        let mut r = sample_result("https://github.com/a/b", CiKind::Travis, OverallStatus::Success);
        r.translation.yaml = Some("name: \"CI, fast\"\non:\n  push: {}\n".into());
        reporter.write_result(&r).unwrap();

        let mut reader = csv::Reader::from_path(reporter.path()).unwrap();
        let headers = reader.headers().unwrap().clone();
        let idx = headers.iter().position(|h| h == "migrated_yaml").unwrap();
        let record = reader.records().next().unwrap().unwrap();
        assert_eq!(record.get(idx).unwrap(), "name: \"CI, fast\"\non:\n  push: {}\n");
    }

    #[test]
    fn update_rewrites_only_the_target_row() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = CsvReporter::new(dir.path().join("out.csv"));
        let first = sample_result("https://github.com/a/one", CiKind::Travis, OverallStatus::Success);
        let mut second =
            sample_result("https://github.com/a/two", CiKind::CircleCi, OverallStatus::RuntimePending);
        second.runtime.status = StageStatus::Running;
        reporter.write_result(&first).unwrap();
        let idx = reporter.write_result(&second).unwrap();

        let update = RowUpdate {
            runtime: RuntimeOutcome {
                status: StageStatus::Success,
                conclusion: Some("success".into()),
                run_id: Some(77),
                fix_attempts: 1,
                ..RuntimeOutcome::default()
            },
            pull_request: PullRequestOutcome {
                status: StageStatus::Success,
                pr_url: Some("https://github.com/a/two/pull/9".into()),
                pr_number: Some(9),
                ..PullRequestOutcome::default()
            },
            overall_status: OverallStatus::Success,
            error_message: None,
            completed_at: Utc::now(),
        };
        reporter.update_result(idx, &update).unwrap();

        let mut reader = csv::Reader::from_path(reporter.path()).unwrap();
        let headers = reader.headers().unwrap().clone();
        let col = |name: &str| headers.iter().position(|h| h == name).unwrap();
        let records: Vec<_> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        // Untouched row is byte-identical in the fields we care about.
        assert_eq!(records[0].get(col("repo_url")).unwrap(), "https://github.com/a/one");
        assert_eq!(records[0].get(col("overall_status")).unwrap(), "success");
        // Updated row moved out of runtime_pending with its new fields.
        assert_eq!(records[1].get(col("overall_status")).unwrap(), "success");
        assert_eq!(records[1].get(col("gha_run_conclusion")).unwrap(), "success");
        assert_eq!(records[1].get(col("gha_fix_attempts")).unwrap(), "1");
        assert_eq!(records[1].get(col("pr_number")).unwrap(), "9");
    }

    #[test]
    fn resume_separates_terminal_and_pending_rows() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = CsvReporter::new(dir.path().join("out.csv"));
        let done = sample_result("https://github.com/a/done", CiKind::Travis, OverallStatus::Success);
        let failed = sample_result("https://github.com/a/failed", CiKind::Travis, OverallStatus::Failed);
        let mut pending =
            sample_result("https://github.com/a/pending", CiKind::CircleCi, OverallStatus::RuntimePending);
        pending.validation.lint_valid = true;
        pending.double_check.passed = true;
        pending.runtime.fix_attempts = 1;
        reporter.write_result(&done).unwrap();
        reporter.write_result(&failed).unwrap();
        reporter.write_result(&pending).unwrap();

        let state = reporter.load_for_resume().unwrap();
        assert!(state.processed.contains("https://github.com/a/done"));
        assert!(state.processed.contains("https://github.com/a/failed"));
        assert!(!state.processed.contains("https://github.com/a/pending"));
        assert_eq!(state.pending.len(), 1);

        let row = &state.pending[0];
        assert_eq!(row.row_index, 2);
        assert_eq!(row.ci_kind, Some(CiKind::CircleCi));
        assert_eq!(row.fork_owner.as_deref(), Some("ciport-bot"));
        assert_eq!(row.branch.as_deref(), Some("ciport/migrated-travis-to-gha"));
        assert_eq!(row.fix_attempts, 1);
        assert!(row.lint_passed);
        assert!(row.double_check_passed);
    }

    #[test]
    fn resume_on_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = CsvReporter::new(dir.path().join("nope.csv"));
        let state = reporter.load_for_resume().unwrap();
        assert!(state.processed.is_empty());
        assert!(state.pending.is_empty());
    }

    #[test]
    fn initialize_on_existing_file_continues_indices() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        {
            let reporter = CsvReporter::new(&path);
            reporter
                .write_result(&sample_result("https://github.com/a/b", CiKind::Travis, OverallStatus::Success))
                .unwrap();
        }
        let reporter = CsvReporter::new(&path);
        let idx = reporter
            .write_result(&sample_result("https://github.com/a/c", CiKind::Travis, OverallStatus::Success))
            .unwrap();
        assert_eq!(idx, 1);
    }
}
