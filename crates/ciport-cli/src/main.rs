use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;

use ciport_core::config::{self, PipelineConfig, Strictness};
use ciport_core::input;
use ciport_core::pipeline::Orchestrator;
use ciport_llm::{LiveBackend, LlmClient};

fn parse_strictness(s: &str) -> Result<Strictness, String> {
    s.parse()
}

/// Batch migration of legacy CI configurations to GitHub Actions.
#[derive(Parser, Debug)]
#[command(name = "ciport", version, about)]
struct Args {
    /// Input CSV or JSON file with repository URLs.
    #[arg(short, long)]
    input: String,

    /// Output CSV file for results.
    #[arg(short, long, default_value = "results.csv")]
    output: String,

    /// Gate policy: strict | lint_only | permissive | dry_run.
    #[arg(short, long, default_value = "strict", value_parser = parse_strictness)]
    strictness: Strictness,

    /// Create a PR even if linting fails.
    #[arg(long)]
    pr_on_lint_fail: bool,

    /// Create a PR even if the semantic double-check fails.
    #[arg(long)]
    pr_on_double_check_fail: bool,

    /// Don't create PRs, just report what would happen.
    #[arg(long)]
    dry_run: bool,

    /// Number of repositories processed concurrently.
    #[arg(short = 'c', long = "concurrent", default_value_t = 2)]
    concurrent: usize,

    /// Retries for transient stage failures.
    #[arg(short = 'r', long = "retries", default_value_t = 3)]
    retries: u32,

    /// Resume from a previous run: skip processed repositories and pick up
    /// rows left in runtime_pending.
    #[arg(long)]
    resume: bool,

    /// Execute migrated workflows in GitHub Actions on the fork and watch
    /// the outcome before opening PRs.
    #[arg(long = "cloud-gha-verify")]
    cloud_gha_verify: bool,

    /// Seconds to wait for one workflow run to reach a terminal state.
    #[arg(long = "cloud-gha-timeout", default_value_t = 600)]
    cloud_gha_timeout: u64,

    /// Repair attempts per workflow before the strictness policy decides.
    #[arg(long = "cloud-gha-retries", default_value_t = 2)]
    cloud_gha_retries: u32,

    /// LLM provider: openai | xai | groq | generic | anthropic | google | ollama.
    #[arg(long, env = "LLM_PROVIDER", default_value = "xai")]
    provider: String,

    /// LLM model name.
    #[arg(long, env = "LLM_MODEL", default_value = "grok-4-1-fast-reasoning")]
    model: String,

    /// LLM API key.
    #[arg(long = "api-key", env = "LLM_API_KEY", default_value = "", hide_env_values = true)]
    api_key: String,

    /// LLM base URL override.
    #[arg(long = "base-url", env = "LLM_BASE_URL")]
    base_url: Option<String>,

    /// Comma-separated GitHub PATs, rotated on rate limiting.
    #[arg(long = "github-pats", env = "GITHUB_PATS", default_value = "", hide_env_values = true)]
    github_pats: String,

    /// Prefix for migration branches on the fork.
    #[arg(long = "branch-prefix", default_value = "ciport/migrated")]
    branch_prefix: String,

    /// Grace period in seconds for draining in-flight work after Ctrl-C.
    #[arg(long = "shutdown-grace", default_value_t = 45)]
    shutdown_grace: u64,
}

fn main() -> ExitCode {
    // .env first, so env-backed flags see the merged view.
    config::load_dotenv();
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ciport=info,ciport_core=info,ciport_llm=info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn run(args: Args) -> Result<ExitCode> {
    // Configuration problems are fatal at startup; everything later becomes
    // a row in the output file instead.
    let mut pats = config::split_tokens(&args.github_pats);
    if pats.is_empty() {
        if let Ok(single) = std::env::var("GITHUB_PAT") {
            pats = config::split_tokens(&single);
        }
    }
    if pats.is_empty() {
        bail!("at least one GitHub PAT is required (--github-pats or GITHUB_PATS)");
    }
    if args.api_key.is_empty() && args.provider != "ollama" {
        bail!(
            "an LLM API key is required for provider '{}' (--api-key or LLM_API_KEY)",
            args.provider
        );
    }

    let strictness = if args.dry_run {
        Strictness::DryRun
    } else {
        args.strictness
    };

    let cfg = PipelineConfig {
        input_file: args.input.clone(),
        output_file: args.output.clone(),
        strictness,
        pr_on_lint_fail: args.pr_on_lint_fail,
        pr_on_double_check_fail: args.pr_on_double_check_fail,
        max_concurrent: args.concurrent.max(1),
        max_retries: args.retries.max(1),
        llm_provider: args.provider.clone(),
        llm_model: args.model.clone(),
        llm_api_key: args.api_key.clone(),
        llm_base_url: args.base_url.clone(),
        github_tokens: pats.clone(),
        branch_prefix: args.branch_prefix.clone(),
        resume: args.resume,
        cloud_verify: args.cloud_gha_verify,
        cloud_verify_timeout: Duration::from_secs(args.cloud_gha_timeout),
        cloud_verify_retries: args.cloud_gha_retries,
        shutdown_grace: Duration::from_secs(args.shutdown_grace),
        ..PipelineConfig::default()
    };

    info!(
        input = %cfg.input_file,
        output = %cfg.output_file,
        strictness = %cfg.strictness,
        concurrent = cfg.max_concurrent,
        retries = cfg.max_retries,
        llm = %format!("{}/{}", cfg.llm_provider, cfg.llm_model),
        github_pats = pats.len(),
        resume = cfg.resume,
        cloud_verify = cfg.cloud_verify,
        "ciport batch pipeline"
    );

    let repos = input::load_repos(&cfg.input_file, &cfg.target_branch)?;
    if repos.is_empty() {
        info!("no repositories to process");
        return Ok(ExitCode::SUCCESS);
    }
    info!(repos = repos.len(), "loaded repositories");

    let client = LlmClient::new(
        &cfg.llm_provider,
        cfg.llm_model.clone(),
        cfg.llm_api_key.clone(),
        cfg.llm_base_url.as_deref(),
    )?;
    let backend = Arc::new(LiveBackend::new(client));

    let orchestrator = Orchestrator::new(cfg, backend)?;
    let summary = orchestrator.run(repos)?;

    info!(
        rows = summary.rows,
        success = summary.success,
        partial = summary.partial,
        failed = summary.failed,
        prs_created = summary.prs_created,
        repairs = summary.repairs,
        output = %args.output,
        "run complete"
    );

    if summary.interrupted {
        return Ok(ExitCode::from(130));
    }
    Ok(ExitCode::SUCCESS)
}
