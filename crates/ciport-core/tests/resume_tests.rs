//! Cross-run reporter behaviour backing `--resume`: terminal rows survive
//! a later run untouched, `runtime_pending` rows are found, re-queued, and
//! updated in place exactly once, and fresh appends keep indexing correctly.

use chrono::Utc;
use ciport_core::report::{CsvReporter, RowUpdate};
use ciport_core::types::{
    CiKind, DetectedConfig, OverallStatus, PullRequestOutcome, RepoRef, RepoResult,
    RuntimeOutcome, StageStatus,
};

fn make_row(url: &str, kind: CiKind, overall: OverallStatus) -> RepoResult {
    let mut r = RepoResult::new(RepoRef::new(url, "main"));
    r.detection.status = StageStatus::Success;
    r.config = Some(DetectedConfig {
        ci_kind: kind,
        source_path: ".travis.yml".into(),
        source_yaml: "language: python\nscript: pytest".into(),
    });
    r.all_detected = vec![kind];
    r.translation.status = StageStatus::Success;
    r.translation.attempts = 1;
    r.translation.yaml = Some("name: CI\non: [push]\njobs: {}".into());
    r.validation.yaml_valid = true;
    r.validation.lint_valid = true;
    r.validation.status = StageStatus::Success;
    r.double_check.passed = true;
    r.double_check.status = StageStatus::Success;
    r.pull_request.fork_url = Some("https://github.com/ciport-bot/demo".into());
    r.pull_request.branch_name = Some(format!("ciport/migrated-{kind}-to-gha"));
    r.overall_status = overall;
    if overall == OverallStatus::RuntimePending {
        r.runtime.status = StageStatus::Running;
    } else {
        r.finalize();
    }
    r
}

fn read_rows(path: &std::path::Path) -> Vec<Vec<String>> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    reader
        .records()
        .map(|r| r.unwrap().iter().map(str::to_string).collect())
        .collect()
}

fn success_update() -> RowUpdate {
    RowUpdate {
        runtime: RuntimeOutcome {
            status: StageStatus::Success,
            conclusion: Some("success".into()),
            run_id: Some(1),
            ..RuntimeOutcome::default()
        },
        pull_request: PullRequestOutcome {
            status: StageStatus::Success,
            pr_url: Some("https://github.com/x/y/pull/1".into()),
            pr_number: Some(1),
            ..PullRequestOutcome::default()
        },
        overall_status: OverallStatus::Success,
        error_message: None,
        completed_at: Utc::now(),
    }
}

#[test]
fn terminal_rows_survive_resume_and_pending_rows_terminalise_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.csv");

    // Run 1: six terminal rows, two runtime_pending, then the process dies.
    let mut pending_indices = Vec::new();
    {
        let reporter = CsvReporter::new(&path);
        for i in 0..6 {
            let overall = if i % 2 == 0 {
                OverallStatus::Success
            } else {
                OverallStatus::Failed
            };
            let row = make_row(&format!("https://github.com/org/done{i}"), CiKind::Travis, overall);
            reporter.write_result(&row).unwrap();
        }
        for i in 0..2 {
            let row = make_row(
                &format!("https://github.com/org/pending{i}"),
                CiKind::CircleCi,
                OverallStatus::RuntimePending,
            );
            pending_indices.push(reporter.write_result(&row).unwrap());
        }
    }
    let before = read_rows(&path);
    assert_eq!(before.len(), 8);

    // Run 2: a fresh reporter over the same file.
    let reporter = CsvReporter::new(&path);
    let state = reporter.load_for_resume().unwrap();
    assert_eq!(state.processed.len(), 6);
    assert_eq!(state.pending.len(), 2);
    for (pending, expected_index) in state.pending.iter().zip(&pending_indices) {
        assert_eq!(pending.row_index, *expected_index);
        assert_eq!(pending.ci_kind, Some(CiKind::CircleCi));
        assert_eq!(pending.fork_owner.as_deref(), Some("ciport-bot"));
        assert!(pending.branch.is_some());
        assert!(!pending.migrated_yaml.is_empty());
    }

    for pending in &state.pending {
        reporter.update_result(pending.row_index, &success_update()).unwrap();
    }

    let after = read_rows(&path);
    assert_eq!(after.len(), 8);
    // Terminal rows are untouched, field for field.
    for i in 0..6 {
        assert_eq!(before[i], after[i], "terminal row {i} changed across resume");
    }
    // Pending rows moved out of runtime_pending exactly once.
    let mut reader = csv::Reader::from_path(&path).unwrap();
    let headers = reader.headers().unwrap().clone();
    let status_col = headers.iter().position(|h| h == "overall_status").unwrap();
    for idx in &pending_indices {
        assert_eq!(after[*idx][status_col], "success");
    }

    // A third scan finds nothing left to resume.
    let state = reporter.load_for_resume().unwrap();
    assert!(state.pending.is_empty());
    assert_eq!(state.processed.len(), 8);
}

#[test]
fn appends_after_resume_continue_the_row_index() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.csv");
    {
        let reporter = CsvReporter::new(&path);
        for i in 0..3 {
            let row = make_row(&format!("https://github.com/org/r{i}"), CiKind::Travis, OverallStatus::Success);
            reporter.write_result(&row).unwrap();
        }
    }

    let reporter = CsvReporter::new(&path);
    let row = make_row("https://github.com/org/fresh", CiKind::Gitlab, OverallStatus::RuntimePending);
    let idx = reporter.write_result(&row).unwrap();
    assert_eq!(idx, 3);

    // The new pending row is addressable by its index.
    reporter.update_result(idx, &success_update()).unwrap();
    let rows = read_rows(&path);
    assert_eq!(rows.len(), 4);
    let mut reader = csv::Reader::from_path(&path).unwrap();
    let headers = reader.headers().unwrap().clone();
    let url_col = headers.iter().position(|h| h == "repo_url").unwrap();
    assert_eq!(rows[3][url_col], "https://github.com/org/fresh");
}
