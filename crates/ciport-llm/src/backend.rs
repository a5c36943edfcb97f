use std::time::Duration;

use async_trait::async_trait;
use ciport_core::llm::{LlmBackend, LlmError};
use ciport_core::types::{CiKind, RawVerdict};
use tracing::{info, warn};

use crate::prompts;
use crate::provider::{ChatRequest, LlmClient};

const TRANSLATE_TIMEOUT: Duration = Duration::from_secs(240);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(240);
/// Reasoning models take longer on repair than on straight translation.
const REPAIR_TIMEOUT: Duration = Duration::from_secs(300);

const MAX_TOKENS: u32 = 4096;

/// The production `LlmBackend`: one provider client serving the translate,
/// verify, and repair roles with their distinct prompts and budgets.
pub struct LiveBackend {
    client: LlmClient,
}

impl LiveBackend {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LlmBackend for LiveBackend {
    async fn translate(
        &self,
        source_ci: CiKind,
        source_yaml: &str,
        feedback: Option<&str>,
    ) -> Result<String, LlmError> {
        let user = prompts::translate_prompt(source_ci, source_yaml, feedback);
        let result = self
            .client
            .chat(&ChatRequest {
                system: prompts::TRANSLATE_SYSTEM,
                user: &user,
                temperature: 0.2,
                max_tokens: MAX_TOKENS,
                timeout: TRANSLATE_TIMEOUT,
            })
            .await?;

        if echoed_source_format(source_ci, &result) {
            return Err(LlmError::WrongFormat(source_ci.to_string()));
        }
        info!(source = %source_ci, output_len = result.len(), "translation received");
        Ok(result)
    }

    async fn semantic_verify(
        &self,
        source_ci: CiKind,
        source_yaml: &str,
        translated_yaml: &str,
    ) -> Result<RawVerdict, LlmError> {
        let user = prompts::verify_prompt(source_ci, source_yaml, translated_yaml);
        let reply = self
            .client
            .chat(&ChatRequest {
                system: prompts::VERIFY_SYSTEM,
                user: &user,
                temperature: 0.1,
                max_tokens: MAX_TOKENS,
                timeout: VERIFY_TIMEOUT,
            })
            .await;

        match reply {
            Ok(text) => Ok(parse_verdict(&text).unwrap_or_else(|| {
                warn!("verifier reply was not parseable JSON; downgrading to lenient pass");
                RawVerdict::lenient_pass()
            })),
            // An empty verdict must not block an otherwise good
            // translation; transient and fatal errors still propagate.
            Err(LlmError::Empty) => Ok(RawVerdict::lenient_pass()),
            Err(e) => Err(e),
        }
    }

    async fn repair(&self, workflow_yaml: &str, error_logs: &str) -> Result<String, LlmError> {
        let user = prompts::repair_prompt(workflow_yaml, error_logs);
        let fixed = self
            .client
            .chat(&ChatRequest {
                system: prompts::REPAIR_SYSTEM,
                user: &user,
                temperature: 0.1,
                max_tokens: MAX_TOKENS,
                timeout: REPAIR_TIMEOUT,
            })
            .await?;

        if !looks_like_workflow(&fixed) {
            return Err(LlmError::WrongFormat("non-workflow".into()));
        }
        info!(output_len = fixed.len(), "repair candidate received");
        Ok(fixed)
    }
}

/// Structural check that the model produced a workflow rather than echoing
/// the source. A Travis echo is recognised by its own keywords; any target
/// output must carry the three mandatory workflow keys.
fn echoed_source_format(source_ci: CiKind, output: &str) -> bool {
    let lower = output.to_lowercase();

    if source_ci == CiKind::Travis {
        const TRAVIS_KEYWORDS: &[&str] =
            &["language:", "dist:", "before_script:", "after_failure:", "skip_cleanup:"];
        if TRAVIS_KEYWORDS.iter().any(|k| lower.contains(k)) {
            return true;
        }
    }

    const REQUIRED: &[&str] = &["name:", "on:", "jobs:"];
    REQUIRED.iter().any(|k| !lower.contains(k))
}

/// Superficial shape check on a repair candidate before it is committed to
/// the fork branch: non-trivial length, at least one key-value line, and at
/// least one top-level workflow key.
fn looks_like_workflow(yaml: &str) -> bool {
    let trimmed = yaml.trim();
    if trimmed.len() < 10 {
        return false;
    }
    let has_key_value = trimmed.lines().any(|line| {
        let line = line.trim_start();
        match line.find(':') {
            Some(idx) if idx > 0 => line[..idx]
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'),
            _ => false,
        }
    });
    let has_workflow_key = trimmed.lines().any(|line| {
        let line = line.trim_start();
        line.starts_with("on:") || line.starts_with("name:") || line.starts_with("jobs:")
    });
    has_key_value && has_workflow_key
}

/// Lenient JSON extraction: the model sometimes wraps the verdict in prose
/// despite instructions, so everything between the outermost braces counts.
fn parse_verdict(text: &str) -> Option<RawVerdict> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn travis_echo_is_detected() {
        let echoed = "language: python\ndist: focal\nscript: pytest";
        assert!(echoed_source_format(CiKind::Travis, echoed));
    }

    #[test]
    fn proper_workflow_passes_the_echo_check() {
        let workflow = "name: CI\non: [push]\njobs:\n  test:\n    runs-on: ubuntu-latest";
        assert!(!echoed_source_format(CiKind::Travis, workflow));
        assert!(!echoed_source_format(CiKind::Gitlab, workflow));
    }

    #[test]
    fn output_missing_workflow_keys_is_an_echo() {
        // A GitLab-style echo: has key-value shape but none of the
        // mandatory workflow keys.
        let echoed = "stages:\n  - build\nbuild-job:\n  stage: build";
        assert!(echoed_source_format(CiKind::Gitlab, echoed));
    }

    #[test]
    fn workflow_shape_check_rejects_prose() {
        assert!(!looks_like_workflow("I'm sorry, I cannot fix this workflow."));
        assert!(!looks_like_workflow("ok"));
        assert!(looks_like_workflow("name: CI\non: [push]\njobs: {}"));
    }

    #[test]
    fn verdict_parses_from_clean_json() {
        let v = parse_verdict(
            r#"{"passed": true, "reasons": ["ok"], "missing_features": [], "hallucinated_steps": [], "confidence": 0.9}"#,
        )
        .unwrap();
        assert!(v.passed);
        assert!((v.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn verdict_parses_out_of_surrounding_prose() {
        let v = parse_verdict("Here is my verdict:\n{\"passed\": false, \"reasons\": [\"missing deploy\"]}\nThanks!").unwrap();
        assert!(!v.passed);
        assert_eq!(v.reasons, vec!["missing deploy".to_string()]);
    }

    #[test]
    fn sparse_envelope_defaults_missing_fields() {
        let v = parse_verdict(r#"{"passed": true}"#).unwrap();
        assert!(v.passed);
        assert!(v.missing_features.is_empty());
        assert_eq!(v.confidence, 0.0);
    }

    #[test]
    fn garbage_is_none() {
        assert!(parse_verdict("no json here").is_none());
        assert!(parse_verdict("}{").is_none());
    }
}
