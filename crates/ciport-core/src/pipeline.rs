use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::{PipelineConfig, Strictness};
use crate::detect;
use crate::github::{GithubClient, GithubError};
use crate::lint;
use crate::llm::LlmBackend;
use crate::pool::TokenPool;
use crate::progress::{Progress, Stats};
use crate::publish::{self, VerificationState, WORKFLOW_PATH};
use crate::report::{CsvReporter, PendingRow, RowUpdate};
use crate::retry::{with_retries, Backoff};
use crate::semantic;
use crate::shutdown::Shutdown;
use crate::types::{
    CiKind, DetectedConfig, DoubleCheckOutcome, ErrorKind, OverallStatus, PullRequestOutcome,
    RepoRef, RepoResult, RuntimeOutcome, RuntimeTask, StageStatus,
};
use crate::verify::{self, RunObservation};

/// Cadence at which the feeder drains the staging list into the queue.
const FEEDER_INTERVAL: Duration = Duration::from_millis(100);
/// Queue receive slice so workers notice the stop flag promptly.
const QUEUE_POLL: Duration = Duration::from_millis(500);
/// Main-thread wait slice while the pending counter drains.
const DRAIN_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub rows: u64,
    pub success: u64,
    pub partial: u64,
    pub failed: u64,
    pub prs_created: u64,
    pub repairs: u64,
    pub interrupted: bool,
}

/// Everything both tiers share. The token pool and reporter serialise their
/// own access; the staging list is the one bridge between the synchronous
/// worker threads and the cooperative verification scheduler.
struct Shared {
    config: PipelineConfig,
    github: GithubClient,
    llm: Arc<dyn LlmBackend>,
    pool: TokenPool,
    reporter: CsvReporter,
    progress: Progress,
    shutdown: Arc<Shutdown>,
    staging: StdMutex<Vec<RuntimeTask>>,
    pending: AtomicUsize,
    secondary_stop: AtomicBool,
}

impl Shared {
    /// Stage a row for the secondary tier. The pending counter is bumped
    /// here and decremented exactly once, when the row's update lands.
    fn stage_runtime_task(&self, task: RuntimeTask) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut staging) = self.staging.lock() {
            staging.push(task);
        }
    }

    /// Evict the current credential when an operation reported throttling.
    fn note_github_error(&self, e: &GithubError) {
        if matches!(e, GithubError::RateLimited(_)) {
            self.pool.report_throttled();
        }
    }
}

pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig, llm: Arc<dyn LlmBackend>) -> Result<Self> {
        let github = GithubClient::new()?;
        let pool = TokenPool::new(config.github_tokens.clone());
        let reporter = CsvReporter::new(config.output_file.as_str());
        let shutdown = Shutdown::new(config.shutdown_grace);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                github,
                llm,
                pool,
                reporter,
                progress: Progress::new(),
                shutdown,
                staging: StdMutex::new(Vec::new()),
                pending: AtomicUsize::new(0),
                secondary_stop: AtomicBool::new(false),
            }),
        })
    }

    /// Drive the full batch: resume bookkeeping, the main worker pool, the
    /// verification queue, and the final drain. Failures never escape;
    /// they become row fields, and Err here means a setup problem.
    pub fn run(&self, mut repos: Vec<RepoRef>) -> Result<RunSummary> {
        let shared = &self.shared;
        let cfg = &shared.config;

        if cfg.resume {
            let state = shared.reporter.load_for_resume()?;
            info!(
                terminal = state.processed.len(),
                pending = state.pending.len(),
                "resuming from existing output"
            );
            let pending_urls: HashSet<String> =
                state.pending.iter().map(|p| p.repo.url.clone()).collect();
            repos.retain(|r| !state.processed.contains(&r.url) && !pending_urls.contains(&r.url));
            for row in state.pending {
                requeue_pending(shared, row);
            }
            shared.reporter.initialize()?;
        } else {
            shared.reporter.reset()?;
        }

        shared.shutdown.install()?;
        shared.progress.set_total(repos.len() as u64);
        info!(
            repos = repos.len(),
            concurrent = cfg.max_concurrent,
            strictness = %cfg.strictness,
            cloud_verify = cfg.cloud_verify,
            "starting pipeline"
        );

        let need_secondary = (cfg.cloud_verify && cfg.strictness != Strictness::DryRun)
            || shared.pending.load(Ordering::SeqCst) > 0;
        let secondary = need_secondary.then(|| {
            let shared = Arc::clone(shared);
            std::thread::spawn(move || secondary_tier(shared))
        });

        // Main tier: a bounded pool of synchronous workers, each owning a
        // repository end-to-end.
        let (tx, rx) = crossbeam_channel::unbounded::<RepoRef>();
        for repo in repos {
            let _ = tx.send(repo);
        }
        drop(tx);

        let workers: Vec<_> = (0..cfg.max_concurrent.max(1))
            .map(|i| {
                let shared = Arc::clone(shared);
                let rx = rx.clone();
                std::thread::spawn(move || main_worker(i, shared, rx))
            })
            .collect();
        for worker in workers {
            let _ = worker.join();
        }

        // Backpressure & completion: wait for the verification queue to
        // empty before shutting its workers down. Every queued task is
        // internally time-bounded, so this terminates; an interrupt caps
        // the wait at the grace deadline.
        if let Some(handle) = secondary {
            let outstanding = shared.pending.load(Ordering::SeqCst);
            if outstanding > 0 {
                info!(pending = outstanding, "input exhausted; draining verification queue");
            }
            loop {
                if shared.pending.load(Ordering::SeqCst) == 0 {
                    break;
                }
                if shared.shutdown.drain_expired() {
                    warn!(
                        pending = shared.pending.load(Ordering::SeqCst),
                        "grace period expired; leaving remaining rows runtime_pending for --resume"
                    );
                    break;
                }
                std::thread::sleep(DRAIN_POLL);
            }
            shared.secondary_stop.store(true, Ordering::SeqCst);
            let _ = handle.join();
        }

        shared.progress.finish();
        let s = &shared.progress.stats;
        let get = |c: &std::sync::atomic::AtomicU64| c.load(Ordering::Relaxed);
        Ok(RunSummary {
            rows: get(&s.rows),
            success: get(&s.success),
            partial: get(&s.partial),
            failed: get(&s.failed),
            prs_created: get(&s.prs_created),
            repairs: get(&s.repairs),
            interrupted: shared.shutdown.requested(),
        })
    }
}

/// Rebuild a `RuntimeTask` from a `runtime_pending` row found on disk. A
/// row missing its task fields cannot be resumed and is terminalised.
fn requeue_pending(shared: &Arc<Shared>, row: PendingRow) {
    match (row.ci_kind, row.fork_owner.clone(), row.branch.clone()) {
        (Some(ci_kind), Some(fork_owner), Some(branch)) if !row.migrated_yaml.is_empty() => {
            info!(
                repo = %row.repo.full_name(),
                ci = %ci_kind,
                row = row.row_index,
                "re-queueing runtime verification"
            );
            shared.stage_runtime_task(RuntimeTask {
                row_index: row.row_index,
                repo: row.repo,
                ci_kind,
                fork_owner,
                branch,
                workflow_yaml: row.migrated_yaml,
                fix_attempt: row.fix_attempts,
                lint_passed: row.lint_passed,
                double_check_passed: row.double_check_passed,
            });
        }
        _ => {
            warn!(row = row.row_index, "runtime_pending row is incomplete; marking failed");
            let update = RowUpdate {
                runtime: RuntimeOutcome {
                    status: StageStatus::Failed,
                    error: Some("resume: runtime_pending row is missing task fields".into()),
                    fix_attempts: row.fix_attempts,
                    ..RuntimeOutcome::default()
                },
                pull_request: PullRequestOutcome {
                    status: StageStatus::Skipped,
                    skipped_reason: Some("runtime verification could not be resumed".into()),
                    ..PullRequestOutcome::default()
                },
                overall_status: OverallStatus::Failed,
                error_message: Some("resume: runtime_pending row is missing task fields".into()),
                completed_at: Utc::now(),
            };
            if let Err(e) = shared.reporter.update_result(row.row_index, &update) {
                error!(row = row.row_index, "updating unresumable row: {e}");
            }
        }
    }
}

// ── Main tier ────────────────────────────────────────────────────────────

/// One synchronous worker: owns a current-thread runtime and pulls
/// repositories off the channel until it is empty or shutdown begins.
fn main_worker(id: usize, shared: Arc<Shared>, rx: crossbeam_channel::Receiver<RepoRef>) {
    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(worker = id, "building worker runtime: {e}");
            return;
        }
    };
    while let Ok(repo) = rx.recv() {
        if shared.shutdown.requested() {
            break;
        }
        rt.block_on(process_repo(&shared, repo));
        shared.progress.repo_done();
    }
}

/// Detector plus the per-config pipeline; one row written per detected CI.
async fn process_repo(shared: &Arc<Shared>, repo: RepoRef) {
    let cfg = &shared.config;
    let full_name = repo.full_name();
    info!(repo = %full_name, "processing repository");

    shared.pool.preflight(&shared.github).await;
    let Some(token) = shared.pool.acquire() else {
        let mut row = RepoResult::new(repo);
        row.overall_status = OverallStatus::Failed;
        row.error_message = Some("no GitHub credential available".into());
        write_row(shared, row);
        return;
    };

    shared.progress.set_current(&full_name, "detecting");
    let configs = match detect::detect_ci(&shared.github, &token, &repo, cfg.max_retries, cfg.retry_delay).await
    {
        Ok(configs) => configs,
        Err(e) => {
            shared.note_github_error(&e);
            Stats::bump(&shared.progress.stats.detection_failed);
            let mut row = RepoResult::new(repo);
            row.detection.status = StageStatus::Failed;
            row.detection.error = Some(e.to_string());
            row.overall_status = OverallStatus::Failed;
            row.error_message = Some(format!("detection failed: {e}"));
            write_row(shared, row);
            return;
        }
    };

    if configs.is_empty() {
        Stats::bump(&shared.progress.stats.no_ci_found);
        let mut row = RepoResult::new(repo);
        row.detection.status = StageStatus::Success;
        row.overall_status = OverallStatus::Failed;
        row.error_message = Some("No CI configuration found".into());
        write_row(shared, row);
        return;
    }

    Stats::add(&shared.progress.stats.detected, configs.len() as u64);
    let all_kinds: Vec<CiKind> = configs.iter().map(|c| c.ci_kind).collect();
    for config in configs {
        process_single_ci(shared, &repo, config, &all_kinds, &token).await;
    }
}

/// Translate → validate → double-check → gates → push/PR for one detected
/// CI. Either writes a terminal row or hands a `runtime_pending` row to the
/// verification queue.
async fn process_single_ci(
    shared: &Arc<Shared>,
    repo: &RepoRef,
    config: DetectedConfig,
    all_kinds: &[CiKind],
    token: &str,
) {
    let cfg = &shared.config;
    let stats = &shared.progress.stats;
    let kind = config.ci_kind;
    let label = format!("{} ({kind})", repo.full_name());

    let mut row = RepoResult::new(repo.clone());
    row.detection.status = StageStatus::Success;
    row.all_detected = all_kinds.to_vec();
    row.config = Some(config.clone());

    let llm = &shared.llm;
    let source_yaml = config.source_yaml.as_str();

    // Convert → validate → double-check, feeding validator output back to
    // the translator on failed rounds, up to `max_retries` rounds.
    let mut feedback: Option<String> = None;
    let mut rounds = 0u32;
    let outcome = loop {
        rounds += 1;
        shared.progress.set_current(&label, "translating");
        let fb = feedback.as_deref();
        let (translated, attempts) = with_retries(
            "translate",
            cfg.max_retries,
            Backoff::Exponential(cfg.retry_delay),
            move |_| llm.translate(kind, source_yaml, fb),
        )
        .await;
        row.translation.attempts += attempts;
        let yaml = match translated {
            Ok(yaml) => yaml,
            Err(e) => break Err(e),
        };

        shared.progress.set_current(&label, "validating");
        let validation = lint::validate_workflow(&yaml).await;
        let lint_passed = validation.lint_valid;

        let double_check = if cfg.should_run_double_check(lint_passed) {
            shared.progress.set_current(&label, "double-check");
            let translated_yaml = yaml.as_str();
            let (verdict, _) = with_retries(
                "double_check",
                cfg.max_retries,
                Backoff::Fixed(cfg.retry_delay),
                move |_| llm.semantic_verify(kind, source_yaml, translated_yaml),
            )
            .await;
            match verdict {
                Ok(raw) => semantic::refine_verdict(raw),
                Err(e) => DoubleCheckOutcome {
                    status: StageStatus::Failed,
                    error: Some(e.to_string()),
                    ..Default::default()
                },
            }
        } else {
            DoubleCheckOutcome {
                status: StageStatus::Skipped,
                ..Default::default()
            }
        };

        let clean = lint_passed && double_check.passed_or_skipped();
        if clean || rounds >= cfg.max_retries {
            break Ok((yaml, validation, double_check));
        }

        // Feedback for the next conversion round.
        let mut parts = Vec::new();
        if !validation.yaml_valid {
            parts.push(format!("YAML parse error:\n{}", validation.messages.join("\n")));
        } else if !validation.lint_valid {
            parts.push(format!("actionlint output:\n{}", validation.messages.join("\n")));
        }
        if double_check.status == StageStatus::Failed && !double_check.passed {
            let reasons: Vec<String> =
                double_check.reasons.iter().map(|r| format!("- {r}")).collect();
            parts.push(format!("SEMANTIC VERIFICATION FAILED:\n{}", reasons.join("\n")));
        }
        feedback = Some(parts.join("\n\n"));
        info!(repo = %label, round = rounds, "validation failed; retrying translation with feedback");
    };

    let (yaml, validation, double_check) = match outcome {
        Ok(parts) => parts,
        Err(e) => {
            Stats::bump(&stats.migration_failed);
            row.translation.status = StageStatus::Failed;
            row.translation.error = Some(e.to_string());
            row.overall_status = OverallStatus::Failed;
            row.error_message = Some(e.to_string());
            write_row(shared, row);
            return;
        }
    };
    Stats::bump(&stats.migrated);
    row.translation.status = StageStatus::Success;
    row.translation.yaml = Some(yaml.clone());
    row.validation = validation;
    let lint_passed = row.validation.lint_valid;
    Stats::bump(if lint_passed { &stats.lint_passed } else { &stats.lint_failed });
    row.double_check = double_check;
    if row.double_check.status == StageStatus::Skipped {
        Stats::bump(&stats.double_check_skipped);
    } else {
        Stats::bump(if row.double_check.passed {
            &stats.double_check_passed
        } else {
            &stats.double_check_failed
        });
    }
    let double_check_passed = row.double_check.passed_or_skipped();

    // Static gate.
    if !cfg.should_create_pr(lint_passed, double_check_passed) {
        let mut reasons: Vec<&str> = Vec::new();
        if !lint_passed {
            reasons.push("lint failed");
        }
        if !double_check_passed {
            reasons.push("double-check failed");
        }
        if cfg.strictness == Strictness::DryRun {
            reasons.push("dry run mode");
            row.pull_request.branch_name = Some(publish::branch_name(&cfg.branch_prefix, kind));
        }
        row.pull_request.status = StageStatus::Skipped;
        row.pull_request.skipped_reason = Some(if reasons.is_empty() {
            "config".into()
        } else {
            reasons.join(", ")
        });
        row.overall_status = OverallStatus::Partial;
        Stats::bump(&stats.prs_skipped);
        write_row(shared, row);
        return;
    }

    let mut caveats: Vec<String> = Vec::new();
    if !lint_passed {
        caveats.push("opened despite failing lint validation".into());
    }
    if !double_check_passed {
        caveats.push("opened despite failing semantic double-check".into());
    }

    // Fork-and-push writer.
    shared.progress.set_current(&label, "pushing to fork");
    let branch = publish::branch_name(&cfg.branch_prefix, kind);
    row.pull_request.branch_name = Some(branch.clone());
    let github = &shared.github;
    let branch_ref = branch.as_str();
    let yaml_ref = yaml.as_str();
    let (pushed, _) = with_retries(
        "publish",
        cfg.max_retries,
        Backoff::Fixed(cfg.retry_delay),
        move |_| async move {
            let fork_owner = publish::ensure_fork(github, token, repo).await?;
            publish::prepare_branch(github, token, &fork_owner, repo, branch_ref).await?;
            publish::push_workflow(github, token, &fork_owner, &repo.name(), branch_ref, yaml_ref)
                .await?;
            Ok::<String, GithubError>(fork_owner)
        },
    )
    .await;
    let fork_owner = match pushed {
        Ok(owner) => {
            row.pull_request.fork_url = Some(format!("https://github.com/{owner}/{}", repo.name()));
            owner
        }
        Err(e) => {
            shared.note_github_error(&e);
            Stats::bump(&stats.prs_failed);
            row.pull_request.status = StageStatus::Failed;
            row.pull_request.error = Some(e.to_string());
            row.overall_status = OverallStatus::Failed;
            row.error_message = Some(format!("fork/push failed: {e}"));
            write_row(shared, row);
            return;
        }
    };

    if cfg.cloud_verify {
        // Hand off to the verification queue; the row goes to disk as
        // runtime_pending and is updated in place when the queue finishes.
        row.runtime.status = StageStatus::Running;
        row.overall_status = OverallStatus::RuntimePending;
        match shared.reporter.write_result(&row) {
            Ok(row_index) => {
                info!(repo = %label, row = row_index, branch = %branch, "queued for runtime verification");
                shared.stage_runtime_task(RuntimeTask {
                    row_index,
                    repo: repo.clone(),
                    ci_kind: kind,
                    fork_owner,
                    branch,
                    workflow_yaml: yaml,
                    fix_attempt: 0,
                    lint_passed,
                    double_check_passed,
                });
            }
            Err(e) => error!(repo = %label, "writing runtime_pending row: {e}"),
        }
        return;
    }

    // Runtime verification disabled: publish directly.
    shared.progress.set_current(&label, "creating PR");
    let verification = VerificationState::Unverified {
        reason: "runtime verification was not enabled".into(),
    };
    let verification_ref = &verification;
    let caveats_ref = caveats.as_slice();
    let fork_owner_ref = fork_owner.as_str();
    let (pr, _) = with_retries(
        "pull_request",
        cfg.max_retries,
        Backoff::Fixed(cfg.retry_delay),
        move |_| {
            publish::open_migration_pr(
                github,
                token,
                repo,
                fork_owner_ref,
                branch_ref,
                kind,
                verification_ref,
                caveats_ref,
            )
        },
    )
    .await;
    match pr {
        Ok(pr) => {
            Stats::bump(&stats.prs_created);
            row.pull_request.status = StageStatus::Success;
            row.pull_request.pr_url = Some(pr.html_url);
            row.pull_request.pr_number = Some(pr.number);
            row.overall_status = OverallStatus::Success;
        }
        Err(e) => {
            shared.note_github_error(&e);
            Stats::bump(&stats.prs_failed);
            row.pull_request.status = StageStatus::Failed;
            row.pull_request.error = Some(e.to_string());
            row.overall_status = OverallStatus::Partial;
        }
    }
    write_row(shared, row);
}

fn write_row(shared: &Arc<Shared>, mut row: RepoResult) {
    row.finalize();
    match shared.reporter.write_result(&row) {
        Ok(_) => shared.progress.record_row(row.overall_status),
        Err(e) => error!(repo = %row.input.full_name(), "writing result row: {e}"),
    }
}

// ── Secondary tier ───────────────────────────────────────────────────────

/// The cooperative scheduler: a feeder draining the staging list into an
/// async queue, and `max_concurrent` workers consuming it, all on one
/// current-thread runtime.
fn secondary_tier(shared: Arc<Shared>) {
    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("building verification runtime: {e}");
            return;
        }
    };
    rt.block_on(async move {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<RuntimeTask>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let feeder = tokio::spawn(feeder_loop(Arc::clone(&shared), tx.clone()));
        let workers: Vec<_> = (0..shared.config.max_concurrent.max(1))
            .map(|i| {
                tokio::spawn(verify_worker(
                    i,
                    Arc::clone(&shared),
                    Arc::clone(&rx),
                    tx.clone(),
                ))
            })
            .collect();
        drop(tx);

        let _ = feeder.await;
        for worker in workers {
            let _ = worker.await;
        }
    });
}

/// Bridge between the tiers: every ~100 ms move whatever the main workers
/// staged into the async queue. One final drain happens on stop so nothing
/// staged before the flag flipped is lost.
async fn feeder_loop(
    shared: Arc<Shared>,
    tx: tokio::sync::mpsc::UnboundedSender<RuntimeTask>,
) {
    loop {
        let drained: Vec<RuntimeTask> = match shared.staging.lock() {
            Ok(mut staging) => staging.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in drained {
            let _ = tx.send(task);
        }
        if shared.secondary_stop.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(FEEDER_INTERVAL).await;
    }
}

async fn verify_worker(
    id: usize,
    shared: Arc<Shared>,
    rx: Arc<tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<RuntimeTask>>>,
    tx: tokio::sync::mpsc::UnboundedSender<RuntimeTask>,
) {
    debug!(worker = id, "verification worker started");
    loop {
        let task = {
            let mut guard = rx.lock().await;
            match tokio::time::timeout(QUEUE_POLL, guard.recv()).await {
                Ok(Some(task)) => Some(task),
                Ok(None) => return,
                Err(_) => None,
            }
        };
        match task {
            Some(task) => handle_runtime_task(&shared, task, &tx).await,
            None => {
                if shared.secondary_stop.load(Ordering::SeqCst) {
                    return;
                }
            }
        }
    }
}

/// One queue item: watch the run, then dispatch on the observed error kind.
/// Success and secret outcomes publish; fixable ones under the attempt cap
/// go through the repair agent and re-enter the queue; everything else
/// falls to the strictness policy.
async fn handle_runtime_task(
    shared: &Arc<Shared>,
    task: RuntimeTask,
    tx: &tokio::sync::mpsc::UnboundedSender<RuntimeTask>,
) {
    let cfg = &shared.config;
    info!(
        repo = %task.repo.full_name(),
        branch = %task.branch,
        fix_attempt = task.fix_attempt,
        "watching workflow run"
    );

    let Some(token) = shared.pool.acquire() else {
        let obs = RunObservation {
            kind: ErrorKind::Unknown,
            error: Some("no GitHub credential available".into()),
            ..RunObservation::default()
        };
        finalize_runtime_row(shared, &task, obs).await;
        return;
    };

    let obs = verify::watch_run(
        &shared.github,
        &token,
        &task.fork_owner,
        &task.repo.name(),
        &task.branch,
        cfg.cloud_verify_timeout,
    )
    .await;

    if obs.kind == ErrorKind::Fixable && task.fix_attempt < cfg.cloud_verify_retries {
        match attempt_repair(shared, &task, &obs, &token).await {
            Ok(fixed_yaml) => {
                Stats::bump(&shared.progress.stats.repairs);
                info!(
                    repo = %task.repo.full_name(),
                    branch = %task.branch,
                    attempt = task.fix_attempt + 1,
                    "repair pushed, re-queueing verification"
                );
                let mut next = task;
                next.workflow_yaml = fixed_yaml;
                next.fix_attempt += 1;
                // Re-entering itself: the pending counter stays put.
                let _ = tx.send(next);
                return;
            }
            Err(e) => {
                warn!(repo = %task.repo.full_name(), "repair failed: {e}");
            }
        }
    }

    finalize_runtime_row(shared, &task, obs).await;
}

/// LLM repair plus re-commit to the same fork branch.
async fn attempt_repair(
    shared: &Arc<Shared>,
    task: &RuntimeTask,
    obs: &RunObservation,
    token: &str,
) -> Result<String> {
    let logs = obs
        .log_snippet
        .clone()
        .or_else(|| obs.error.clone())
        .unwrap_or_default();
    let llm = &shared.llm;
    let workflow_yaml = task.workflow_yaml.as_str();
    let logs_ref = logs.as_str();
    let (fixed, _) = with_retries(
        "repair",
        shared.config.max_retries,
        Backoff::Fixed(shared.config.retry_delay),
        move |_| llm.repair(workflow_yaml, logs_ref),
    )
    .await;
    let fixed = fixed?;
    if fixed.trim() == task.workflow_yaml.trim() {
        anyhow::bail!("repair produced no changes");
    }
    shared
        .github
        .put_file(
            token,
            &format!("{}/{}", task.fork_owner, task.repo.name()),
            &task.branch,
            WORKFLOW_PATH,
            &fixed,
            publish::REPAIR_COMMIT_MESSAGE,
        )
        .await
        .map_err(|e| {
            shared.note_github_error(&e);
            anyhow::anyhow!("pushing repaired workflow: {e}")
        })?;
    Ok(fixed)
}

/// Terminalise a queue row: decide the PR via the strictness policy, update
/// the CSV row in place, and release the pending slot.
async fn finalize_runtime_row(shared: &Arc<Shared>, task: &RuntimeTask, obs: RunObservation) {
    let cfg = &shared.config;
    let stats = &shared.progress.stats;

    // Secret outcomes are successful verification with an advisory, not a
    // stage failure.
    let runtime = RuntimeOutcome {
        status: match obs.kind {
            ErrorKind::None | ErrorKind::Secret => StageStatus::Success,
            _ => StageStatus::Failed,
        },
        error_kind: obs.kind,
        run_id: obs.run_id,
        run_url: obs.run_url.clone(),
        conclusion: obs.conclusion.clone(),
        log_snippet: obs.log_snippet.clone(),
        fix_attempts: task.fix_attempt,
        error: obs.error.clone(),
    };

    let mut pull_request = PullRequestOutcome {
        branch_name: Some(task.branch.clone()),
        fork_url: Some(format!(
            "https://github.com/{}/{}",
            task.fork_owner,
            task.repo.name()
        )),
        ..PullRequestOutcome::default()
    };

    let overall;
    if cfg.should_open_pr_after_runtime(obs.kind) {
        let verification = match obs.kind {
            ErrorKind::None => VerificationState::Verified {
                run_url: obs.run_url.clone(),
            },
            ErrorKind::Secret => VerificationState::SecretCaveat {
                run_url: obs.run_url.clone(),
            },
            ErrorKind::Fixable => VerificationState::Unverified {
                reason: format!(
                    "automatic repair was exhausted after {} attempt(s)",
                    task.fix_attempt
                ),
            },
            ErrorKind::Timeout => VerificationState::Unverified {
                reason: "the workflow run did not finish within the verification budget".into(),
            },
            ErrorKind::Unknown => VerificationState::Unverified {
                reason: obs
                    .error
                    .clone()
                    .unwrap_or_else(|| "the run failed for an unrecognised reason".into()),
            },
        };
        let mut caveats: Vec<String> = Vec::new();
        if !task.lint_passed {
            caveats.push("opened despite failing lint validation".into());
        }
        if !task.double_check_passed {
            caveats.push("opened despite failing semantic double-check".into());
        }
        if obs.kind == ErrorKind::Secret {
            caveats.push(
                "the workflow references repository secrets that must be configured by a maintainer"
                    .into(),
            );
        }

        let pr_result = match shared.pool.acquire() {
            Some(token) => {
                let github = &shared.github;
                let token_ref = token.as_str();
                let repo_ref = &task.repo;
                let fork_owner_ref = task.fork_owner.as_str();
                let branch_ref = task.branch.as_str();
                let kind = task.ci_kind;
                let verification_ref = &verification;
                let caveats_ref = caveats.as_slice();
                let (pr, _) = with_retries(
                    "pull_request",
                    cfg.max_retries,
                    Backoff::Fixed(cfg.retry_delay),
                    move |_| {
                        publish::open_migration_pr(
                            github,
                            token_ref,
                            repo_ref,
                            fork_owner_ref,
                            branch_ref,
                            kind,
                            verification_ref,
                            caveats_ref,
                        )
                    },
                )
                .await;
                pr.map_err(|e| {
                    shared.note_github_error(&e);
                    e.to_string()
                })
            }
            None => Err("no GitHub credential available".into()),
        };

        match pr_result {
            Ok(pr) => {
                Stats::bump(&stats.prs_created);
                pull_request.status = StageStatus::Success;
                pull_request.pr_url = Some(pr.html_url);
                pull_request.pr_number = Some(pr.number);
                overall = OverallStatus::Success;
            }
            Err(e) => {
                Stats::bump(&stats.prs_failed);
                pull_request.status = StageStatus::Failed;
                pull_request.error = Some(e);
                overall = OverallStatus::Partial;
            }
        }
    } else {
        Stats::bump(&stats.prs_skipped);
        pull_request.status = StageStatus::Skipped;
        pull_request.skipped_reason = Some(match obs.kind {
            ErrorKind::Fixable => "runtime verification failed after exhausting repairs".into(),
            ErrorKind::Timeout => "runtime verification timed out".into(),
            _ => "runtime verification failed".into(),
        });
        overall = OverallStatus::Partial;
    }

    let error_message = match obs.kind {
        ErrorKind::None | ErrorKind::Secret => None,
        _ => obs.error.clone(),
    };
    let update = RowUpdate {
        runtime,
        pull_request,
        overall_status: overall,
        error_message,
        completed_at: Utc::now(),
    };
    if let Err(e) = shared.reporter.update_result(task.row_index, &update) {
        error!(row = task.row_index, "updating runtime row: {e}");
    }
    shared.progress.record_row(overall);
    shared.pending.fetch_sub(1, Ordering::SeqCst);
}
