use async_trait::async_trait;
use thiserror::Error;

use crate::retry::Retryable;
use crate::types::{CiKind, RawVerdict};

/// Failure modes of an LLM call, by kind rather than mechanism, so callers
/// can decide on retry without inspecting provider envelopes.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Provider-side trouble worth another attempt (timeouts, 429s, 5xx).
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("provider returned an empty completion")]
    Empty,
    /// The model echoed the source format back instead of a workflow.
    #[error("model returned {0} syntax instead of a GitHub Actions workflow")]
    WrongFormat(String),
    #[error("{0}")]
    Fatal(String),
}

impl Retryable for LlmError {
    fn is_retryable(&self) -> bool {
        // Empty and wrong-format replies are resampled; only Fatal (bad
        // key, unsupported provider) stops the loop.
        !matches!(self, LlmError::Fatal(_))
    }
}

/// The three LLM roles the pipeline consumes. Implementations live in
/// `ciport-llm` and are injected by the binary crate.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Translate one legacy CI configuration into a GitHub Actions
    /// workflow. `feedback` carries validation output on retry rounds.
    async fn translate(
        &self,
        source_ci: CiKind,
        source_yaml: &str,
        feedback: Option<&str>,
    ) -> Result<String, LlmError>;

    /// Compare source and translation; returns the model's verdict parsed
    /// leniently (an unparseable reply becomes a low-confidence pass).
    async fn semantic_verify(
        &self,
        source_ci: CiKind,
        source_yaml: &str,
        translated_yaml: &str,
    ) -> Result<RawVerdict, LlmError>;

    /// Propose a corrected workflow given the failing YAML and a log
    /// snippet from the failed run.
    async fn repair(&self, workflow_yaml: &str, error_logs: &str) -> Result<String, LlmError>;
}
