//! Completion provider abstraction and implementations.
//!
//! Defines the [`CompletionProvider`] trait — prompt in, text out,
//! fallible — and the concrete HTTP implementations:
//! - **[`OpenAiCompatProvider`]** — chat-completions protocol; serves
//!   OpenAI, DeepSeek, and Zhipu via the base URL.
//! - **[`GeminiProvider`]** — the `generateContent` protocol.
//! - **[`MockProvider`]** — deterministic offline provider for tests
//!   and dry runs; never touches the network.
//!
//! # Error classification
//!
//! Callers branch on [`ProviderError`], never on message substrings.
//! The mapping is contractual with the transport:
//! - HTTP 429 → `Quota`
//! - HTTP 413, or a structured error `code` of
//!   `context_length_exceeded` → `InputTooLarge`
//! - HTTP 5xx, network errors, timeouts → `Transient`
//! - remaining client errors → `Other`

use std::time::Duration;

use anyhow::{bail, Result};

use crate::credentials::Credential;

/// Typed provider failure; drives retry/rotation policy in the
/// distiller.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("quota or rate limit exhausted: {0}")]
    Quota(String),
    #[error("input too large: {0}")]
    InputTooLarge(String),
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("provider error: {0}")]
    Other(String),
}

/// A black-box completion service: prompt → text, fallible.
pub trait CompletionProvider: Send + Sync {
    /// Provider name as used in configuration (`openai`, `gemini`, ...).
    fn name(&self) -> &str;

    /// Nominal upper bound on prompt characters this provider accepts.
    /// The distiller pre-checks against this before spending a call.
    fn max_input_chars(&self) -> usize;

    /// One completion call with a system and user prompt.
    fn complete(&self, system: &str, user: &str) -> Result<String, ProviderError>;
}

/// Builds a provider for a credential. The pipeline passes this seam
/// down so tests can substitute scripted providers.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, credential: &Credential) -> Result<Box<dyn CompletionProvider>>;
}

/// Production factory: dispatches on the credential's provider name.
pub struct HttpProviderFactory {
    pub timeout_secs: u64,
}

impl ProviderFactory for HttpProviderFactory {
    fn create(&self, credential: &Credential) -> Result<Box<dyn CompletionProvider>> {
        match credential.provider.as_str() {
            "openai" => Ok(Box::new(OpenAiCompatProvider::new(
                "openai",
                "https://api.openai.com/v1",
                credential,
                self.timeout_secs,
                500_000,
            )?)),
            "deepseek" => Ok(Box::new(OpenAiCompatProvider::new(
                "deepseek",
                "https://api.deepseek.com",
                credential,
                self.timeout_secs,
                250_000,
            )?)),
            "zhipu" => Ok(Box::new(OpenAiCompatProvider::new(
                "zhipu",
                "https://open.bigmodel.cn/api/paas/v4",
                credential,
                self.timeout_secs,
                250_000,
            )?)),
            "gemini" => Ok(Box::new(GeminiProvider::new(credential, self.timeout_secs)?)),
            "mock" => Ok(Box::new(MockProvider)),
            other => bail!(
                "unknown provider '{}': expected openai, deepseek, zhipu, gemini, or mock",
                other
            ),
        }
    }
}

// ============ OpenAI-compatible chat completions ============

/// Chat-completions provider (OpenAI, DeepSeek, and compatible
/// gateways).
pub struct OpenAiCompatProvider {
    name: &'static str,
    base_url: String,
    api_key: String,
    model: String,
    max_input_chars: usize,
    client: reqwest::blocking::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: &'static str,
        base_url: &str,
        credential: &Credential,
        timeout_secs: u64,
        max_input_chars: usize,
    ) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            name,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: credential.api_key.clone(),
            model: credential.model.clone(),
            max_input_chars,
            client,
        })
    }
}

impl CompletionProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn max_input_chars(&self) -> usize {
        self.max_input_chars
    }

    fn complete(&self, system: &str, user: &str) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": 0.7,
            "max_tokens": 8192,
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .map_err(transport_error)?;

        let status = resp.status();
        let text = resp.text().map_err(transport_error)?;
        if !status.is_success() {
            return Err(classify_http_error(status.as_u16(), &text));
        }

        parse_chat_content(&text)
    }
}

/// Extract `choices[0].message.content` from a chat-completions
/// response body.
fn parse_chat_content(body: &str) -> Result<String, ProviderError> {
    let json: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| ProviderError::Other(format!("unparsable response body: {e}")))?;
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| ProviderError::Other("response missing choices[0].message.content".into()))
}

// ============ Gemini ============

/// Gemini `generateContent` provider.
pub struct GeminiProvider {
    api_key: String,
    model: String,
    client: reqwest::blocking::Client,
}

impl GeminiProvider {
    pub fn new(credential: &Credential, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            api_key: credential.api_key.clone(),
            model: credential.model.clone(),
            client,
        })
    }
}

impl CompletionProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn max_input_chars(&self) -> usize {
        // Long-context family; effectively never the input bottleneck.
        2_000_000
    }

    fn complete(&self, system: &str, user: &str) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "contents": [{
                "parts": [{"text": format!("{system}\n\n{user}")}]
            }],
            "generationConfig": {
                "temperature": 0.7,
                "maxOutputTokens": 8192,
            }
        });

        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );
        let resp = self
            .client
            .post(url)
            .json(&body)
            .send()
            .map_err(transport_error)?;

        let status = resp.status();
        let text = resp.text().map_err(transport_error)?;
        if !status.is_success() {
            return Err(classify_http_error(status.as_u16(), &text));
        }

        parse_gemini_content(&text)
    }
}

/// Join `candidates[0].content.parts[].text` from a generateContent
/// response body.
fn parse_gemini_content(body: &str) -> Result<String, ProviderError> {
    let json: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| ProviderError::Other(format!("unparsable response body: {e}")))?;
    let parts = json
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .ok_or_else(|| {
            ProviderError::Other("response missing candidates[0].content.parts".into())
        })?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();
    if text.is_empty() {
        return Err(ProviderError::Other("empty candidate content".into()));
    }
    Ok(text)
}

// ============ Mock ============

/// Deterministic offline provider: returns a fixed two-element QA
/// array derived from the prompt, so pipelines can be exercised
/// end-to-end without network access or spend.
pub struct MockProvider;

impl CompletionProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn max_input_chars(&self) -> usize {
        usize::MAX
    }

    fn complete(&self, _system: &str, user: &str) -> Result<String, ProviderError> {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(user.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        let tag = &digest[..12];
        Ok(serde_json::json!([
            {"question": format!("What does section {tag} cover?"),
             "answer": format!("It covers the content fingerprinted as {tag}.")},
            {"question": format!("Summarize fragment {tag}."),
             "answer": format!("Fragment {tag} summarized.")},
        ])
        .to_string())
    }
}

// ============ Classification ============

fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Transient(format!("timeout: {e}"))
    } else {
        ProviderError::Transient(e.to_string())
    }
}

/// Map an HTTP error status plus body to a typed provider error.
///
/// The input-too-large case is detected from HTTP 413 or from an
/// OpenAI-style structured error object whose `code` field equals
/// `context_length_exceeded` — never from scanning message text.
pub fn classify_http_error(status: u16, body: &str) -> ProviderError {
    match status {
        429 => ProviderError::Quota(format!("HTTP 429: {}", truncate(body))),
        413 => ProviderError::InputTooLarge(format!("HTTP 413: {}", truncate(body))),
        500..=599 => ProviderError::Transient(format!("HTTP {status}: {}", truncate(body))),
        _ => {
            if error_code(body).as_deref() == Some("context_length_exceeded") {
                ProviderError::InputTooLarge(format!("HTTP {status}: context length exceeded"))
            } else {
                ProviderError::Other(format!("HTTP {status}: {}", truncate(body)))
            }
        }
    }
}

/// `error.code` from an OpenAI-style error body, if present.
fn error_code(body: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(body).ok()?;
    json.get("error")?
        .get("code")?
        .as_str()
        .map(str::to_string)
}

fn truncate(body: &str) -> String {
    const MAX: usize = 200;
    if body.chars().count() <= MAX {
        body.to_string()
    } else {
        let cut: String = body.chars().take(MAX).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_quota() {
        assert!(matches!(
            classify_http_error(429, "slow down"),
            ProviderError::Quota(_)
        ));
    }

    #[test]
    fn classify_payload_too_large() {
        assert!(matches!(
            classify_http_error(413, ""),
            ProviderError::InputTooLarge(_)
        ));
    }

    #[test]
    fn classify_context_length_code() {
        let body = r#"{"error": {"message": "whatever", "code": "context_length_exceeded"}}"#;
        assert!(matches!(
            classify_http_error(400, body),
            ProviderError::InputTooLarge(_)
        ));
    }

    #[test]
    fn classify_plain_client_error() {
        let body = r#"{"error": {"message": "bad key", "code": "invalid_api_key"}}"#;
        assert!(matches!(
            classify_http_error(401, body),
            ProviderError::Other(_)
        ));
    }

    #[test]
    fn classify_server_error_is_transient() {
        assert!(matches!(
            classify_http_error(503, "overloaded"),
            ProviderError::Transient(_)
        ));
    }

    #[test]
    fn chat_content_extraction() {
        let body = r#"{"choices": [{"message": {"role": "assistant", "content": "hello"}}]}"#;
        assert_eq!(parse_chat_content(body).unwrap(), "hello");
        assert!(parse_chat_content(r#"{"choices": []}"#).is_err());
    }

    #[test]
    fn gemini_content_extraction() {
        let body = r#"{"candidates": [{"content": {"parts": [{"text": "a"}, {"text": "b"}]}}]}"#;
        assert_eq!(parse_gemini_content(body).unwrap(), "ab");
        assert!(parse_gemini_content(r#"{"candidates": []}"#).is_err());
    }

    #[test]
    fn mock_provider_is_deterministic_json() {
        let a = MockProvider.complete("sys", "user prompt").unwrap();
        let b = MockProvider.complete("sys", "user prompt").unwrap();
        assert_eq!(a, b);
        let parsed: Vec<crate::models::QaPair> = serde_json::from_str(&a).unwrap();
        assert_eq!(parsed.len(), 2);
        // Different prompts produce different pairs.
        let c = MockProvider.complete("sys", "other prompt").unwrap();
        assert_ne!(a, c);
    }
}
