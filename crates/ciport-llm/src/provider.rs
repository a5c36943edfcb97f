use std::time::Duration;

use ciport_core::llm::LlmError;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com";
const DEFAULT_XAI_BASE: &str = "https://api.x.ai";
const DEFAULT_GROQ_BASE: &str = "https://api.groq.com/openai";
const DEFAULT_ANTHROPIC_BASE: &str = "https://api.anthropic.com";
const DEFAULT_GOOGLE_BASE: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_OLLAMA_BASE: &str = "http://localhost:11434";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProviderKind {
    /// OpenAI wire format; also serves xai, groq, and any `generic` base URL.
    OpenAiCompatible,
    Anthropic,
    Google,
    Ollama,
}

/// One chat call. Timeouts are per-request; reasoning models are slow, so
/// the repair role passes a larger budget than the translator.
pub struct ChatRequest<'a> {
    pub system: &'a str,
    pub user: &'a str,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// Provider-agnostic chat client. Responses come back with Markdown fences
/// already stripped; an all-whitespace completion is `LlmError::Empty`.
pub struct LlmClient {
    http: reqwest::Client,
    kind: ProviderKind,
    base_url: String,
    model: String,
    api_key: String,
}

impl LlmClient {
    pub fn new(
        provider: &str,
        model: impl Into<String>,
        api_key: impl Into<String>,
        base_url: Option<&str>,
    ) -> Result<Self, LlmError> {
        let provider_norm = provider.trim().to_lowercase();
        let api_key = api_key.into();

        let (kind, default_base) = match provider_norm.as_str() {
            "openai" => (ProviderKind::OpenAiCompatible, DEFAULT_OPENAI_BASE.to_string()),
            "xai" => (ProviderKind::OpenAiCompatible, DEFAULT_XAI_BASE.to_string()),
            "groq" => (ProviderKind::OpenAiCompatible, DEFAULT_GROQ_BASE.to_string()),
            "generic" => {
                if base_url.map(str::trim).filter(|u| !u.is_empty()).is_none() {
                    return Err(LlmError::Fatal(
                        "base_url is required for the generic provider".into(),
                    ));
                }
                (ProviderKind::OpenAiCompatible, String::new())
            }
            "anthropic" => (ProviderKind::Anthropic, DEFAULT_ANTHROPIC_BASE.to_string()),
            "google" => (ProviderKind::Google, DEFAULT_GOOGLE_BASE.to_string()),
            "ollama" => (
                ProviderKind::Ollama,
                std::env::var("OLLAMA_HOST").unwrap_or_else(|_| DEFAULT_OLLAMA_BASE.to_string()),
            ),
            other => {
                return Err(LlmError::Fatal(format!("unsupported provider: {other}")));
            }
        };

        if api_key.is_empty() && kind != ProviderKind::Ollama {
            return Err(LlmError::Fatal(format!(
                "api_key is required for provider '{provider_norm}'"
            )));
        }

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| LlmError::Fatal(format!("building HTTP client: {e}")))?;

        Ok(Self {
            http,
            kind,
            base_url: normalize_base(base_url, &default_base),
            model: model.into(),
            api_key,
        })
    }

    pub async fn chat(&self, req: &ChatRequest<'_>) -> Result<String, LlmError> {
        let raw = match self.kind {
            ProviderKind::OpenAiCompatible => self.openai_chat(req).await?,
            ProviderKind::Anthropic => self.anthropic_chat(req).await?,
            ProviderKind::Google => self.google_chat(req).await?,
            ProviderKind::Ollama => self.ollama_chat(req).await?,
        };
        let cleaned = strip_code_fences(&raw);
        if cleaned.is_empty() {
            return Err(LlmError::Empty);
        }
        Ok(cleaned)
    }

    async fn openai_chat(&self, req: &ChatRequest<'_>) -> Result<String, LlmError> {
        // Tolerate base URLs given with or without the /v1 suffix.
        let url = if self.base_url.ends_with("/v1") {
            format!("{}/chat/completions", self.base_url)
        } else {
            format!("{}/v1/chat/completions", self.base_url)
        };
        info!(url = %url, model = %self.model, "calling chat completions API");

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(req.timeout)
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": req.system},
                    {"role": "user", "content": req.user},
                ],
                "temperature": req.temperature,
            }))
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp).await?;

        #[derive(Deserialize)]
        struct ChatResponse {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMessage,
        }
        #[derive(Deserialize)]
        struct ChoiceMessage {
            content: Option<String>,
        }

        let parsed: ChatResponse = resp.json().await.map_err(transport_error)?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    async fn anthropic_chat(&self, req: &ChatRequest<'_>) -> Result<String, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        info!(url = %url, model = %self.model, "calling Anthropic messages API");

        let resp = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .timeout(req.timeout)
            .json(&json!({
                "model": self.model,
                "max_tokens": req.max_tokens,
                "system": req.system,
                "messages": [{"role": "user", "content": req.user}],
                "temperature": req.temperature,
            }))
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp).await?;

        #[derive(Deserialize)]
        struct MessagesResponse {
            content: Vec<ContentBlock>,
        }
        #[derive(Deserialize)]
        struct ContentBlock {
            text: Option<String>,
        }

        let parsed: MessagesResponse = resp.json().await.map_err(transport_error)?;
        Ok(parsed
            .content
            .into_iter()
            .next()
            .and_then(|b| b.text)
            .unwrap_or_default())
    }

    async fn google_chat(&self, req: &ChatRequest<'_>) -> Result<String, LlmError> {
        let url = format!("{}/v1/models/{}:generateContent", self.base_url, self.model);
        info!(url = %url, "calling Gemini generateContent API");

        // Gemini takes one combined prompt.
        let combined = format!("{}\n\n{}", req.system, req.user);
        let resp = self
            .http
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .timeout(req.timeout)
            .json(&json!({
                "contents": [{"parts": [{"text": combined}]}],
                "generationConfig": {
                    "temperature": req.temperature,
                    "maxOutputTokens": req.max_tokens,
                },
            }))
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp).await?;

        #[derive(Deserialize)]
        struct GenerateResponse {
            candidates: Vec<Candidate>,
        }
        #[derive(Deserialize)]
        struct Candidate {
            content: CandidateContent,
        }
        #[derive(Deserialize)]
        struct CandidateContent {
            parts: Vec<Part>,
        }
        #[derive(Deserialize)]
        struct Part {
            text: Option<String>,
        }

        let parsed: GenerateResponse = resp.json().await.map_err(transport_error)?;
        Ok(parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .and_then(|p| p.text)
            .unwrap_or_default())
    }

    async fn ollama_chat(&self, req: &ChatRequest<'_>) -> Result<String, LlmError> {
        let url = format!("{}/api/chat", self.base_url);
        info!(url = %url, model = %self.model, "calling ollama chat API");

        let resp = self
            .http
            .post(&url)
            .timeout(req.timeout)
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": req.system},
                    {"role": "user", "content": req.user},
                ],
                "stream": false,
            }))
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp).await?;

        #[derive(Deserialize)]
        struct OllamaResponse {
            message: OllamaMessage,
        }
        #[derive(Deserialize)]
        struct OllamaMessage {
            content: String,
        }

        let parsed: OllamaResponse = resp.json().await.map_err(transport_error)?;
        Ok(parsed.message.content)
    }
}

fn normalize_base(base_url: Option<&str>, default_base: &str) -> String {
    let url = base_url.map(str::trim).filter(|u| !u.is_empty()).unwrap_or(default_base);
    url.trim_end_matches('/').to_string()
}

/// Network-level failures are always worth another attempt.
fn transport_error(e: reqwest::Error) -> LlmError {
    LlmError::Transient(e.to_string())
}

/// Non-200s: 429 and 5xx are transient, everything else (bad key, bad
/// request) is fatal. The provider's own error message is surfaced when the
/// body carries one.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or(body);
    let message = format!("API error ({status}): {message}");
    warn!("{message}");
    if status.as_u16() == 429 || status.is_server_error() {
        Err(LlmError::Transient(message))
    } else {
        Err(LlmError::Fatal(message))
    }
}

/// Peel a Markdown code fence off a completion, if present.
pub fn strip_code_fences(s: &str) -> String {
    let s = s.trim();
    if !s.starts_with("```") {
        return s.to_string();
    }
    let mut lines: Vec<&str> = s.lines().collect();
    lines.remove(0);
    if let Some(last) = lines.last() {
        if last.trim_start().starts_with("```") {
            lines.pop();
        }
    }
    lines.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_with_language_tag_are_stripped() {
        let s = "```yaml\nname: CI\non: [push]\n```";
        assert_eq!(strip_code_fences(s), "name: CI\non: [push]");
    }

    #[test]
    fn bare_fences_are_stripped() {
        let s = "```\njobs: {}\n```";
        assert_eq!(strip_code_fences(s), "jobs: {}");
    }

    #[test]
    fn unfenced_text_is_untouched() {
        assert_eq!(strip_code_fences("  name: CI  "), "name: CI");
    }

    #[test]
    fn unterminated_fence_drops_only_the_opener() {
        assert_eq!(strip_code_fences("```yaml\nname: CI"), "name: CI");
    }

    #[test]
    fn unknown_provider_is_fatal() {
        assert!(matches!(
            LlmClient::new("cohere", "m", "key", None),
            Err(LlmError::Fatal(_))
        ));
    }

    #[test]
    fn missing_key_is_fatal_except_for_ollama() {
        assert!(matches!(
            LlmClient::new("openai", "m", "", None),
            Err(LlmError::Fatal(_))
        ));
        assert!(LlmClient::new("ollama", "m", "", None).is_ok());
    }

    #[test]
    fn generic_provider_requires_a_base_url() {
        assert!(matches!(
            LlmClient::new("generic", "m", "key", None),
            Err(LlmError::Fatal(_))
        ));
        assert!(LlmClient::new("generic", "m", "key", Some("https://llm.internal/v1")).is_ok());
    }
}
