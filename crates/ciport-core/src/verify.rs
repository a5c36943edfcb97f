use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use crate::github::GithubClient;
use crate::types::ErrorKind;

/// How long to wait for the push-triggered run to show up at all.
const RUN_APPEAR_WAIT: Duration = Duration::from_secs(60);
const RUN_APPEAR_INTERVAL: Duration = Duration::from_secs(5);
const RUN_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Log patterns that mean missing credentials. Not LLM-fixable (the user
/// must configure secrets), so these are checked first and short-circuit
/// the fixable list. Kept in lock-step with the repair agent's abilities.
static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"secret.*not.*found",
        r"token.*not.*set",
        r"authentication.*failed",
        r"unauthorized",
        r"403.*forbidden",
        r"GITHUB_TOKEN.*invalid",
        r"npm.*ERR!.*401",
        r"npm.*ERR!.*403",
        r"docker.*login.*failed",
        r"AWS_ACCESS_KEY_ID.*not.*set",
        r"AZURE_.*not.*configured",
        r"GCP_.*credentials",
        r"secrets\..*is empty",
        r"environment variable.*not set",
        r"\$\{\{.*secrets\.",
    ])
});

/// Log patterns the repair agent has a real shot at: YAML/config mistakes,
/// action references, path and build-layout errors, non-zero exits.
static FIXABLE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"yaml.*syntax.*error",
        r"invalid.*workflow.*file",
        r"unexpected.*key",
        r"mapping values are not allowed",
        r"could not find.*action",
        r"invalid.*input",
        r"required.*input.*not.*provided",
        r"job.*not found",
        r"permission.*denied.*actions",
        r"uses.*invalid",
        r"run.*command.*failed",
        r"no POM",
        r"Could not find.*pom\.xml",
        r"BUILD FAILURE",
        r"no such file or directory",
        r"command not found",
        r"working-directory",
        r"Process completed with exit code [1-9]",
    ])
});

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| Regex::new(&format!("(?i){p}")).ok())
        .collect()
}

/// Classify a failed run's logs into an [`ErrorKind`] plus a representative
/// snippet around the first match (tail of the log when nothing matched).
pub fn classify_error(log: &str) -> (ErrorKind, String) {
    if log.trim().is_empty() {
        return (ErrorKind::Unknown, "No log content available".into());
    }
    for re in SECRET_PATTERNS.iter() {
        if let Some(m) = re.find(log) {
            return (ErrorKind::Secret, snippet_around(log, m.start(), m.end(), 200));
        }
    }
    for re in FIXABLE_PATTERNS.iter() {
        if let Some(m) = re.find(log) {
            return (ErrorKind::Fixable, snippet_around(log, m.start(), m.end(), 500));
        }
    }
    // The tail usually carries the actual error.
    (ErrorKind::Unknown, tail(log, 1000))
}

fn snippet_around(log: &str, start: usize, end: usize, window: usize) -> String {
    let from = floor_boundary(log, start.saturating_sub(window));
    let to = ceil_boundary(log, (end + window).min(log.len()));
    log[from..to].to_string()
}

fn tail(log: &str, max: usize) -> String {
    if log.len() <= max {
        return log.to_string();
    }
    let from = floor_boundary(log, log.len() - max);
    log[from..].to_string()
}

fn floor_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// Outcome of watching one workflow run to completion.
#[derive(Debug, Clone, Default)]
pub struct RunObservation {
    pub run_id: Option<u64>,
    pub run_url: Option<String>,
    pub conclusion: Option<String>,
    pub kind: ErrorKind,
    pub log_snippet: Option<String>,
    pub error: Option<String>,
}

/// Locate the workflow run triggered by the push to `branch`, poll it to a
/// terminal state within `timeout`, and classify any failure. Every wait in
/// here is bounded, so a queue worker holding this future always returns.
pub async fn watch_run(
    github: &GithubClient,
    token: &str,
    fork_owner: &str,
    repo_name: &str,
    branch: &str,
    timeout: Duration,
) -> RunObservation {
    let full_name = format!("{fork_owner}/{repo_name}");
    let mut obs = RunObservation::default();

    let run = match wait_for_run(github, token, &full_name, branch).await {
        Some(run) => run,
        None => {
            obs.kind = ErrorKind::Unknown;
            obs.error = Some(format!(
                "no workflow run appeared on {full_name}@{branch} within {}s",
                RUN_APPEAR_WAIT.as_secs()
            ));
            return obs;
        }
    };
    info!(run_id = run.id, branch, "found workflow run, polling to completion");
    obs.run_id = Some(run.id);
    obs.run_url = Some(run.html_url.clone());

    let started = Instant::now();
    let conclusion = loop {
        if started.elapsed() >= timeout {
            obs.conclusion = Some("timed_out".into());
            obs.kind = ErrorKind::Timeout;
            obs.error = Some(format!("workflow did not finish within {}s", timeout.as_secs()));
            return obs;
        }
        match github.workflow_run(token, &full_name, run.id).await {
            Ok(r) if r.status == "completed" => {
                break r.conclusion.unwrap_or_else(|| "unknown".into());
            }
            Ok(_) => tokio::time::sleep(RUN_POLL_INTERVAL).await,
            Err(e) => {
                obs.kind = ErrorKind::Unknown;
                obs.error = Some(format!("polling run {}: {e}", run.id));
                return obs;
            }
        }
    };
    obs.conclusion = Some(conclusion.clone());

    if conclusion == "success" {
        obs.kind = ErrorKind::None;
        return obs;
    }

    match fetch_failed_logs(github, token, &full_name, run.id).await {
        Some(logs) => {
            let (kind, snippet) = classify_error(&logs);
            obs.kind = kind;
            obs.log_snippet = Some(snippet);
        }
        None => {
            obs.kind = ErrorKind::Unknown;
            obs.log_snippet = None;
            obs.error = Some("could not fetch logs for failed jobs".into());
        }
    }
    obs.error
        .get_or_insert_with(|| format!("workflow failed with conclusion: {conclusion}"));
    obs
}

/// Runs take a few seconds to materialise after a push; poll the branch's
/// run list until one shows up or the bounded wait expires.
async fn wait_for_run(
    github: &GithubClient,
    token: &str,
    full_name: &str,
    branch: &str,
) -> Option<crate::github::WorkflowRun> {
    let started = Instant::now();
    while started.elapsed() < RUN_APPEAR_WAIT {
        match github.list_runs(token, full_name, branch).await {
            Ok(runs) => {
                if let Some(run) = runs.into_iter().next() {
                    return Some(run);
                }
            }
            Err(e) => warn!(branch, "listing workflow runs: {e}"),
        }
        tokio::time::sleep(RUN_APPEAR_INTERVAL).await;
    }
    None
}

/// Concatenated logs of every failed job, labelled per job.
async fn fetch_failed_logs(
    github: &GithubClient,
    token: &str,
    full_name: &str,
    run_id: u64,
) -> Option<String> {
    let jobs = match github.run_jobs(token, full_name, run_id).await {
        Ok(jobs) => jobs,
        Err(e) => {
            warn!(run_id, "fetching jobs: {e}");
            return None;
        }
    };
    let mut sections = Vec::new();
    for job in jobs.iter().filter(|j| j.conclusion.as_deref() == Some("failure")) {
        match github.job_logs(token, full_name, job.id).await {
            Ok(text) => sections.push(format!("\n=== Job: {} ===\n{text}", job.name)),
            Err(e) => sections.push(format!("\n=== Job: {} ===\n(could not fetch logs: {e})", job.name)),
        }
    }
    if sections.is_empty() {
        None
    } else {
        Some(sections.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_logs_are_unknown() {
        let (kind, snippet) = classify_error("");
        assert_eq!(kind, ErrorKind::Unknown);
        assert_eq!(snippet, "No log content available");
    }

    #[test]
    fn http_401_in_npm_logs_is_a_secret_error() {
        let log = "npm ERR! code E401\nnpm ERR! 401 Unauthorized - GET https://registry.npmjs.org/private-pkg";
        let (kind, _) = classify_error(log);
        assert_eq!(kind, ErrorKind::Secret);
    }

    #[test]
    fn missing_secret_reference_is_a_secret_error() {
        let log = "Error: value of ${{ secrets.NPM_TOKEN }} is empty";
        let (kind, snippet) = classify_error(log);
        assert_eq!(kind, ErrorKind::Secret);
        assert!(snippet.contains("secrets.NPM_TOKEN"));
    }

    #[test]
    fn nonzero_exit_is_fixable() {
        let log = "##[error]Process completed with exit code 1.";
        let (kind, _) = classify_error(log);
        assert_eq!(kind, ErrorKind::Fixable);
    }

    #[test]
    fn missing_action_is_fixable() {
        let log = "Error: Could not find action 'actions/setup-node@v99'";
        let (kind, _) = classify_error(log);
        assert_eq!(kind, ErrorKind::Fixable);
    }

    #[test]
    fn maven_pom_errors_are_fixable() {
        let log = "[ERROR] The goal you specified requires a project to execute but there is no POM in this directory";
        let (kind, _) = classify_error(log);
        assert_eq!(kind, ErrorKind::Fixable);
    }

    #[test]
    fn secret_classification_wins_over_fixable() {
        // "exit code 1" (fixable) plus a 403 (secret): secret is checked
        // first because the repair agent must not touch credential issues.
        let log = "docker push failed: 403 Forbidden\nProcess completed with exit code 1.";
        let (kind, _) = classify_error(log);
        assert_eq!(kind, ErrorKind::Secret);
    }

    #[test]
    fn unmatched_logs_fall_back_to_tail() {
        let log = format!("{}the-final-error", "x".repeat(2000));
        let (kind, snippet) = classify_error(&log);
        assert_eq!(kind, ErrorKind::Unknown);
        assert!(snippet.len() <= 1000);
        assert!(snippet.ends_with("the-final-error"));
    }

    #[test]
    fn snippets_respect_char_boundaries() {
        let log = format!("{}command not found{}", "é".repeat(600), "ü".repeat(600));
        let (kind, snippet) = classify_error(&log);
        assert_eq!(kind, ErrorKind::Fixable);
        assert!(snippet.contains("command not found"));
    }
}
