use std::time::Duration;

use tracing::info;

use crate::github::{GithubClient, GithubError, PullRequest};
use crate::types::{CiKind, RepoRef};

/// Conventional location of the migrated workflow in the fork.
pub const WORKFLOW_PATH: &str = ".github/workflows/ci.yml";

const COMMIT_MESSAGE: &str =
    "Migrate CI/CD to GitHub Actions\n\nMigrated by the CIPort batch pipeline";
pub const REPAIR_COMMIT_MESSAGE: &str = "fix: auto-repair workflow after failed run";

const FORK_POLL_INTERVAL: Duration = Duration::from_secs(3);
const FORK_POLL_ATTEMPTS: u32 = 10;

/// Branch for a migration. Deterministic per (prefix, kind), so two
/// migrations in the same repository never collide and reruns overwrite.
pub fn branch_name(prefix: &str, kind: CiKind) -> String {
    format!("{prefix}-{kind}-to-gha")
}

/// What the PR body says about runtime verification.
#[derive(Debug, Clone)]
pub enum VerificationState {
    /// The workflow ran on the fork and succeeded.
    Verified { run_url: Option<String> },
    /// The run failed only on missing repository secrets; verified as far
    /// as possible; the user must configure secrets after merging.
    SecretCaveat { run_url: Option<String> },
    /// The workflow was never observed completing successfully.
    Unverified { reason: String },
}

// ── Fork-and-push writer ─────────────────────────────────────────────────

/// Make sure a fork of `repo` exists under the bot account; returns the
/// fork owner login. Fork creation is asynchronous on the host side, so a
/// fresh fork is polled until readable.
pub async fn ensure_fork(
    github: &GithubClient,
    token: &str,
    repo: &RepoRef,
) -> Result<String, GithubError> {
    let login = github.authenticated_user(token).await?;
    let fork_full = format!("{login}/{}", repo.name());

    if let Some(info) = github.repo_info(token, &fork_full).await? {
        if info.fork && info.parent_full_name.as_deref() == Some(repo.full_name().as_str()) {
            return Ok(login);
        }
    }

    github.create_fork(token, &repo.full_name()).await?;
    for _ in 0..FORK_POLL_ATTEMPTS {
        tokio::time::sleep(FORK_POLL_INTERVAL).await;
        if github.repo_info(token, &fork_full).await?.is_some() {
            info!(fork = %fork_full, "fork ready");
            return Ok(login);
        }
    }
    Err(GithubError::Status {
        status: 202,
        body: format!("fork {fork_full} not readable after creation"),
    })
}

/// Create (or recreate) the migration branch at the current tip. The tip
/// SHA comes from the fork's target branch, falling back to the source's
/// (the fork may be stale) and finally to the fork's default branch.
pub async fn prepare_branch(
    github: &GithubClient,
    token: &str,
    fork_owner: &str,
    repo: &RepoRef,
    branch: &str,
) -> Result<(), GithubError> {
    let fork_full = format!("{fork_owner}/{}", repo.name());

    let mut sha = github.ref_sha(token, &fork_full, &repo.target_branch).await?;
    if sha.is_none() {
        sha = github
            .ref_sha(token, &repo.full_name(), &repo.target_branch)
            .await?;
    }
    if sha.is_none() {
        if let Some(fork_info) = github.repo_info(token, &fork_full).await? {
            sha = github
                .ref_sha(token, &fork_full, &fork_info.default_branch)
                .await?;
        }
    }
    let Some(sha) = sha else {
        return Err(GithubError::Status {
            status: 404,
            body: format!("branch '{}' not found on fork or source", repo.target_branch),
        });
    };

    // Delete-then-create so repeated runs always overwrite.
    github.delete_ref(token, &fork_full, branch).await?;
    github.create_ref(token, &fork_full, branch, &sha).await?;
    Ok(())
}

/// Commit the translated workflow onto the branch.
pub async fn push_workflow(
    github: &GithubClient,
    token: &str,
    fork_owner: &str,
    repo_name: &str,
    branch: &str,
    yaml: &str,
) -> Result<(), GithubError> {
    github
        .put_file(
            token,
            &format!("{fork_owner}/{repo_name}"),
            branch,
            WORKFLOW_PATH,
            yaml,
            COMMIT_MESSAGE,
        )
        .await
}

// ── PR publisher ─────────────────────────────────────────────────────────

pub async fn open_migration_pr(
    github: &GithubClient,
    token: &str,
    repo: &RepoRef,
    fork_owner: &str,
    branch: &str,
    kind: CiKind,
    verification: &VerificationState,
    caveats: &[String],
) -> Result<PullRequest, GithubError> {
    let title = format!("[CIPort] Migrate {} to GitHub Actions", kind.display_name());
    let body = pr_body(kind, verification, caveats);
    github
        .open_pull_request(
            token,
            &repo.full_name(),
            &format!("{fork_owner}:{branch}"),
            &repo.target_branch,
            &title,
            &body,
        )
        .await
}

/// Structured PR body. Reviewers can tell at a glance whether the workflow
/// was actually observed running, and which gates (if any) were overridden.
pub fn pr_body(kind: CiKind, verification: &VerificationState, caveats: &[String]) -> String {
    let ci_name = kind.display_name();

    let verification_section = match verification {
        VerificationState::Verified { run_url } => {
            let mut s = String::from(
                "**Verified**: this workflow was executed on a fork and completed successfully.",
            );
            if let Some(url) = run_url {
                s.push_str(&format!("\nRun: {url}"));
            }
            s
        }
        VerificationState::SecretCaveat { run_url } => {
            let mut s = String::from(
                "**Verified with secret caveat**: the workflow ran on a fork and failed only \
                 because repository secrets are not configured there. Verified as far as \
                 possible; configure the referenced secrets after merging.",
            );
            if let Some(url) = run_url {
                s.push_str(&format!("\nRun: {url}"));
            }
            s
        }
        VerificationState::Unverified { reason } => {
            format!("**Unverified**: the workflow has not been observed running ({reason}).")
        }
    };

    let caveat_section = if caveats.is_empty() {
        String::new()
    } else {
        let lines: Vec<String> = caveats.iter().map(|c| format!("- {c}")).collect();
        format!("\n### Caveats\n{}\n", lines.join("\n"))
    };

    format!(
        "## CI/CD Migration\n\
         \n\
         This PR migrates the existing **{ci_name}** configuration to **GitHub Actions**.\n\
         \n\
         ### Generated by the CIPort batch pipeline\n\
         \n\
         - Source CI: {ci_name}\n\
         - Target CI: GitHub Actions\n\
         \n\
         ### What's changed\n\
         - Added `{WORKFLOW_PATH}` with an equivalent GitHub Actions workflow\n\
         \n\
         ### Runtime verification\n\
         {verification_section}\n\
         {caveat_section}\
         \n\
         ### Please review\n\
         - [ ] Workflow triggers are correct\n\
         - [ ] Environment variables are properly configured\n\
         - [ ] Secrets are referenced correctly\n\
         - [ ] Build/test commands are accurate\n\
         \n\
         ---\n\
         *This PR was generated automatically. Please review carefully before merging.*\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_names_are_deterministic_and_distinct_per_kind() {
        let a = branch_name("ciport/migrated", CiKind::Travis);
        let b = branch_name("ciport/migrated", CiKind::CircleCi);
        assert_eq!(a, "ciport/migrated-travis-to-gha");
        assert_eq!(b, "ciport/migrated-circleci-to-gha");
        assert_ne!(a, b);
        // Re-derivation yields the same branch: reruns overwrite.
        assert_eq!(a, branch_name("ciport/migrated", CiKind::Travis));
    }

    #[test]
    fn pr_body_distinguishes_verification_states() {
        let verified = pr_body(
            CiKind::Travis,
            &VerificationState::Verified {
                run_url: Some("https://github.com/x/y/actions/runs/1".into()),
            },
            &[],
        );
        assert!(verified.contains("**Verified**"));
        assert!(verified.contains("actions/runs/1"));

        let secret = pr_body(CiKind::Travis, &VerificationState::SecretCaveat { run_url: None }, &[]);
        assert!(secret.contains("secret caveat"));
        assert!(secret.contains("Verified as far as possible"));

        let unverified = pr_body(
            CiKind::Travis,
            &VerificationState::Unverified {
                reason: "runtime verification was not enabled".into(),
            },
            &[],
        );
        assert!(unverified.contains("**Unverified**"));
        assert!(unverified.contains("not enabled"));
    }

    #[test]
    fn pr_body_lists_gate_caveats() {
        let body = pr_body(
            CiKind::Gitlab,
            &VerificationState::Unverified { reason: "x".into() },
            &["opened despite failing lint".into()],
        );
        assert!(body.contains("### Caveats"));
        assert!(body.contains("- opened despite failing lint"));
    }

    #[test]
    fn pr_body_names_the_source_ci() {
        let body = pr_body(
            CiKind::AzurePipelines,
            &VerificationState::Unverified { reason: "x".into() },
            &[],
        );
        assert!(body.contains("**Azure Pipelines**"));
    }
}
