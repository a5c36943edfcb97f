use std::time::Duration;

use tracing::debug;

use crate::github::{GithubClient, GithubError};
use crate::retry::{with_retries, Backoff};
use crate::types::{CiKind, DetectedConfig, RepoRef};

/// Probe patterns per CI kind, in detection priority order. A trailing `/`
/// marks a directory whose `.yml`/`.yaml` entries are candidates; anything
/// else is an exact path. GitHub Actions is the migration target and is
/// never probed.
pub const CI_PATTERNS: &[(CiKind, &[&str])] = &[
    (CiKind::CircleCi, &[".circleci/config.yml", ".circleci/config.yaml"]),
    (CiKind::Travis, &[".travis.yml", ".travis.yaml"]),
    (CiKind::Gitlab, &[".gitlab-ci.yml", ".gitlab-ci.yaml"]),
    (CiKind::Jenkins, &["Jenkinsfile", "jenkins/Jenkinsfile"]),
    (
        CiKind::AzurePipelines,
        &["azure-pipelines.yml", "azure-pipelines.yaml", ".azure-pipelines.yml"],
    ),
    (CiKind::Bitbucket, &["bitbucket-pipelines.yml"]),
    (CiKind::Drone, &[".drone.yml", ".drone.yaml"]),
    (CiKind::Semaphore, &[".semaphore/semaphore.yml"]),
    (CiKind::Buildkite, &[".buildkite/pipeline.yml", ".buildkite/pipeline.yaml"]),
    (CiKind::Appveyor, &["appveyor.yml", ".appveyor.yml"]),
    (CiKind::Codefresh, &["codefresh.yml", ".codefresh.yml"]),
];

/// Probe a repository for every known CI configuration. At most one
/// `DetectedConfig` per kind (the kind's first matching pattern wins). An
/// empty result is success: "no CI found" is a finding, not an error.
/// Fails only when the host API keeps erroring after `retries` attempts.
pub async fn detect_ci(
    github: &GithubClient,
    token: &str,
    repo: &RepoRef,
    retries: u32,
    retry_delay: Duration,
) -> Result<Vec<DetectedConfig>, GithubError> {
    let (result, _attempts) = with_retries(
        "detect",
        retries,
        Backoff::Fixed(retry_delay),
        move |_| scan(github, token, repo),
    )
    .await;
    result
}

async fn scan(
    github: &GithubClient,
    token: &str,
    repo: &RepoRef,
) -> Result<Vec<DetectedConfig>, GithubError> {
    let full_name = repo.full_name();
    let mut found = Vec::new();

    for (kind, patterns) in CI_PATTERNS {
        for pattern in *patterns {
            let candidate = match pattern.strip_suffix('/') {
                Some(dir) => probe_directory(github, token, &full_name, *kind, dir).await?,
                None => github
                    .file_contents(token, &full_name, pattern)
                    .await?
                    .map(|f| DetectedConfig {
                        ci_kind: *kind,
                        source_path: f.path,
                        source_yaml: f.content,
                    }),
            };
            if let Some(config) = candidate {
                debug!(repo = %full_name, ci = %config.ci_kind, path = %config.source_path, "detected CI config");
                found.push(config);
                break; // one config per kind
            }
        }
    }

    Ok(found)
}

/// Directory pattern: the first YAML entry becomes the kind's config.
async fn probe_directory(
    github: &GithubClient,
    token: &str,
    full_name: &str,
    kind: CiKind,
    dir: &str,
) -> Result<Option<DetectedConfig>, GithubError> {
    let Some(entries) = github.list_dir(token, full_name, dir).await? else {
        return Ok(None);
    };
    for entry in entries {
        if !entry.name.ends_with(".yml") && !entry.name.ends_with(".yaml") {
            continue;
        }
        let Some(url) = entry.download_url else {
            continue;
        };
        let content = github.download_text(token, &url).await?;
        return Ok(Some(DetectedConfig {
            ci_kind: kind,
            source_path: entry.path,
            source_yaml: content,
        }));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_table_covers_every_kind_once() {
        let mut seen = std::collections::HashSet::new();
        for (kind, patterns) in CI_PATTERNS {
            assert!(seen.insert(*kind), "{kind} listed twice");
            assert!(!patterns.is_empty());
        }
        assert_eq!(seen.len(), 11);
    }

    #[test]
    fn target_format_is_not_probed() {
        for (_, patterns) in CI_PATTERNS {
            for p in *patterns {
                assert!(!p.contains(".github/workflows"), "target CI must not be detected: {p}");
            }
        }
    }
}
