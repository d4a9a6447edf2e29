//! Chunk distillation: one chunk of document text in, a validated list
//! of question/answer pairs out.
//!
//! Builds a fixed instructional prompt around the chunk, acquires a
//! credential from the pool, calls the completion provider, and parses
//! the response as a JSON array. Failures are classified by the typed
//! [`ProviderError`] and handled per policy: quota rotates to another
//! credential, oversized input escalates to the orchestrator for an
//! alternate provider, malformed output gets one best-effort repair,
//! and everything else retries with exponential backoff. Every attempt
//! reports its outcome to the pool so cooldown state reflects reality
//! even when the distiller ultimately gives up.

use std::time::Duration;

use crate::credentials::CredentialPool;
use crate::models::QaPair;
use crate::provider::{ProviderError, ProviderFactory};

const SYSTEM_PROMPT: &str = "\
You are a senior domain expert building a training dataset from source \
documents. You produce precise, self-contained question/answer pairs \
strictly grounded in the material you are given: never invent facts, \
keep concrete figures, limits, and procedural steps, and say so plainly \
when the material does not settle a point.";

/// User prompt template embedding the chunk text and target pair count.
fn user_prompt(chunk_text: &str, pair_count: usize) -> String {
    format!(
        "Generate {pair_count} high-quality question/answer pairs from the \
document excerpt below.\n\
\n\
Requirements:\n\
1. Vary the question types: procedures, required materials, limits, \
approval flows, deadlines.\n\
2. Cover the key information points of the excerpt.\n\
3. Phrase questions naturally, the way a real reader would ask them.\n\
4. Answers must be accurate, complete, and self-contained.\n\
\n\
Document excerpt:\n\
```\n\
{chunk_text}\n\
```\n\
\n\
Return ONLY a JSON array in this exact shape, with no surrounding text:\n\
[\n  {{\"question\": \"...\", \"answer\": \"...\"}}\n]"
    )
}

/// Distillation failure, after local retry policy is exhausted.
#[derive(Debug, thiserror::Error)]
pub enum DistillError {
    /// Every credential for the provider is cooling down or disabled.
    #[error("no credential available for provider '{0}'")]
    NoCredential(String),
    /// The chunk exceeds this provider's input tolerance; the
    /// orchestrator should retry against an alternate provider rather
    /// than the same one.
    #[error("input too large for provider '{0}'")]
    InputTooLarge(String),
    /// Retries exhausted.
    #[error("distillation failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// Turns chunks into QA pairs through a [`ProviderFactory`] and a
/// shared [`CredentialPool`].
pub struct Distiller<'a> {
    factory: &'a dyn ProviderFactory,
    max_retries: u32,
    backoff_base_ms: u64,
}

impl<'a> Distiller<'a> {
    pub fn new(factory: &'a dyn ProviderFactory, max_retries: u32) -> Self {
        Self {
            factory,
            max_retries,
            backoff_base_ms: 1000,
        }
    }

    /// Override the backoff base (milliseconds). Tests use 0.
    pub fn with_backoff_base_ms(mut self, ms: u64) -> Self {
        self.backoff_base_ms = ms;
        self
    }

    /// Distill one chunk into `pair_count` QA pairs using credentials
    /// for `provider` from `pool`.
    pub fn distill(
        &self,
        chunk_text: &str,
        pair_count: usize,
        provider: &str,
        pool: &CredentialPool,
    ) -> Result<Vec<QaPair>, DistillError> {
        let user = user_prompt(chunk_text, pair_count);
        let mut last_error = String::new();

        for attempt in 0..self.max_retries {
            if attempt > 0 && self.backoff_base_ms > 0 {
                // 1s, 2s, 4s, ... capped shift, the usual shape.
                let delay = self.backoff_base_ms << (attempt - 1).min(5);
                std::thread::sleep(Duration::from_millis(delay));
            }

            let credential = pool
                .acquire(provider)
                .ok_or_else(|| DistillError::NoCredential(provider.to_string()))?;

            let client = match self.factory.create(&credential) {
                Ok(c) => c,
                Err(e) => {
                    // Misconfigured provider name; retrying cannot help.
                    return Err(DistillError::Exhausted {
                        attempts: attempt,
                        last: e.to_string(),
                    });
                }
            };

            // Pre-check the prompt against the provider's tolerance so
            // a hopeless call is never spent.
            if user.chars().count() + SYSTEM_PROMPT.chars().count() > client.max_input_chars() {
                return Err(DistillError::InputTooLarge(provider.to_string()));
            }

            match client.complete(SYSTEM_PROMPT, &user) {
                Ok(response) => match parse_pairs(&response) {
                    Some(pairs) => {
                        pool.report_success(&credential.id);
                        return Ok(pairs);
                    }
                    None => {
                        pool.report_failure(&credential.id, "malformed response");
                        last_error = "malformed response".to_string();
                    }
                },
                Err(ProviderError::Quota(msg)) => {
                    pool.mark_exhausted(&credential.id);
                    last_error = msg;
                }
                Err(ProviderError::InputTooLarge(_)) => {
                    // Not a credential-health signal; escalate for an
                    // alternate provider without penalizing the key.
                    return Err(DistillError::InputTooLarge(provider.to_string()));
                }
                Err(ProviderError::Transient(msg)) | Err(ProviderError::Other(msg)) => {
                    pool.report_failure(&credential.id, &msg);
                    last_error = msg;
                }
            }
        }

        Err(DistillError::Exhausted {
            attempts: self.max_retries,
            last: last_error,
        })
    }
}

/// Parse a model response into validated QA pairs.
///
/// Locates the outermost JSON array (models routinely wrap output in
/// code fences or prose), parses it, and keeps only elements with
/// non-empty trimmed `question` and `answer` strings. If the array
/// fails to parse, one repair is attempted: trim to the last
/// well-formed element and close the array. `None` means nothing
/// usable was recovered.
pub fn parse_pairs(response: &str) -> Option<Vec<QaPair>> {
    let array = locate_array(response)?;
    let values = match serde_json::from_str::<Vec<serde_json::Value>>(array) {
        Ok(v) => v,
        Err(_) => {
            let repaired = repair_array(array)?;
            serde_json::from_str::<Vec<serde_json::Value>>(&repaired).ok()?
        }
    };

    let pairs: Vec<QaPair> = values
        .iter()
        .filter_map(|v| {
            let question = v.get("question")?.as_str()?.trim();
            let answer = v.get("answer")?.as_str()?.trim();
            if question.is_empty() || answer.is_empty() {
                return None;
            }
            Some(QaPair {
                question: question.to_string(),
                answer: answer.to_string(),
            })
        })
        .collect();

    if pairs.is_empty() {
        None
    } else {
        Some(pairs)
    }
}

/// Slice from the first `[` through the last `]`, or to end-of-text
/// when the closing bracket was truncated away.
fn locate_array(response: &str) -> Option<&str> {
    let start = response.find('[')?;
    match response.rfind(']') {
        Some(end) if end > start => Some(&response[start..=end]),
        _ => Some(&response[start..]),
    }
}

/// Best-effort repair of a truncated array: cut back to the last
/// complete `}` and close the bracket.
fn repair_array(array: &str) -> Option<String> {
    let last_obj_end = array.rfind('}')?;
    Some(format!("{}]", &array[..=last_obj_end]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Credential, CredentialPool, PoolPolicy};
    use crate::provider::CompletionProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    // ---- parsing ----

    #[test]
    fn parse_clean_array() {
        let pairs = parse_pairs(r#"[{"question": " Q1 ", "answer": "A1"}]"#).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].question, "Q1");
    }

    #[test]
    fn parse_fenced_array() {
        let response = "Here you go:\n```json\n[{\"question\": \"Q\", \"answer\": \"A\"}]\n```";
        assert_eq!(parse_pairs(response).unwrap().len(), 1);
    }

    #[test]
    fn parse_drops_malformed_elements() {
        let response = r#"[
            {"question": "Q1", "answer": "A1"},
            {"question": "", "answer": "A2"},
            {"question": "Q3"},
            {"question": "Q4", "answer": "A4"}
        ]"#;
        let pairs = parse_pairs(response).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1].question, "Q4");
    }

    #[test]
    fn parse_repairs_truncated_array() {
        let response = r#"[{"question": "Q1", "answer": "A1"}, {"question": "Q2", "ans"#;
        let pairs = parse_pairs(response).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].question, "Q1");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_pairs("no array here").is_none());
        assert!(parse_pairs(r#"[{"question": "", "answer": ""}]"#).is_none());
    }

    // ---- distill flow ----

    /// Factory whose providers pop scripted outcomes per call.
    struct Scripted {
        outcomes: Arc<Mutex<Vec<Result<String, ProviderErrorKind>>>>,
        calls: Arc<AtomicUsize>,
    }

    #[derive(Clone)]
    enum ProviderErrorKind {
        Quota,
        TooLarge,
        Transient,
    }

    struct ScriptedProvider {
        outcomes: Arc<Mutex<Vec<Result<String, ProviderErrorKind>>>>,
        calls: Arc<AtomicUsize>,
    }

    impl CompletionProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }
        fn max_input_chars(&self) -> usize {
            usize::MAX
        }
        fn complete(&self, _system: &str, _user: &str) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().unwrap();
            match outcomes.remove(0) {
                Ok(s) => Ok(s),
                Err(ProviderErrorKind::Quota) => Err(ProviderError::Quota("429".into())),
                Err(ProviderErrorKind::TooLarge) => {
                    Err(ProviderError::InputTooLarge("413".into()))
                }
                Err(ProviderErrorKind::Transient) => {
                    Err(ProviderError::Transient("503".into()))
                }
            }
        }
    }

    impl ProviderFactory for Scripted {
        fn create(&self, _c: &Credential) -> anyhow::Result<Box<dyn CompletionProvider>> {
            Ok(Box::new(ScriptedProvider {
                outcomes: Arc::clone(&self.outcomes),
                calls: Arc::clone(&self.calls),
            }))
        }
    }

    fn scripted(outcomes: Vec<Result<String, ProviderErrorKind>>) -> Scripted {
        Scripted {
            outcomes: Arc::new(Mutex::new(outcomes)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn test_pool(k: usize) -> CredentialPool {
        let creds = (0..k)
            .map(|i| Credential {
                id: format!("p-{i}"),
                provider: "p".to_string(),
                api_key: "k".to_string(),
                model: "m".to_string(),
                name: format!("p-{i}"),
                priority: 1,
            })
            .collect();
        CredentialPool::new(creds, PoolPolicy::default())
    }

    fn good_response() -> String {
        r#"[{"question": "Q", "answer": "A"}]"#.to_string()
    }

    #[test]
    fn first_try_success_reports_to_pool() {
        let factory = scripted(vec![Ok(good_response())]);
        let pool = test_pool(1);
        let distiller = Distiller::new(&factory, 3).with_backoff_base_ms(0);
        let pairs = distiller.distill("text", 5, "p", &pool).unwrap();
        assert_eq!(pairs.len(), 1);
        let stats = pool.stats();
        assert_eq!(stats.total_success, 1);
        assert_eq!(stats.total_failed, 0);
    }

    #[test]
    fn quota_rotates_to_next_credential() {
        let factory = scripted(vec![Err(ProviderErrorKind::Quota), Ok(good_response())]);
        let pool = test_pool(2);
        let distiller = Distiller::new(&factory, 3).with_backoff_base_ms(0);
        let pairs = distiller.distill("text", 5, "p", &pool).unwrap();
        assert_eq!(pairs.len(), 1);
        let stats = pool.stats();
        let first = stats.credentials.iter().find(|c| c.id == "p-0").unwrap();
        assert!(first.in_cooldown);
        assert_eq!(stats.total_success, 1);
    }

    #[test]
    fn input_too_large_escalates_without_penalty() {
        let factory = scripted(vec![Err(ProviderErrorKind::TooLarge)]);
        let pool = test_pool(1);
        let distiller = Distiller::new(&factory, 3).with_backoff_base_ms(0);
        let err = distiller.distill("text", 5, "p", &pool).unwrap_err();
        assert!(matches!(err, DistillError::InputTooLarge(_)));
        assert_eq!(pool.stats().total_failed, 0);
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transient_errors_exhaust_retries() {
        let factory = scripted(vec![
            Err(ProviderErrorKind::Transient),
            Err(ProviderErrorKind::Transient),
            Err(ProviderErrorKind::Transient),
        ]);
        let pool = test_pool(2);
        let distiller = Distiller::new(&factory, 3).with_backoff_base_ms(0);
        let err = distiller.distill("text", 5, "p", &pool).unwrap_err();
        match err {
            DistillError::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert_eq!(pool.stats().total_failed, 3);
    }

    #[test]
    fn malformed_response_counts_as_failed_attempt() {
        let factory = scripted(vec![Ok("not json at all".to_string()), Ok(good_response())]);
        let pool = test_pool(1);
        let distiller = Distiller::new(&factory, 3).with_backoff_base_ms(0);
        let pairs = distiller.distill("text", 5, "p", &pool).unwrap();
        assert_eq!(pairs.len(), 1);
        let stats = pool.stats();
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.total_success, 1);
    }

    #[test]
    fn no_credential_when_pool_has_no_provider() {
        let factory = scripted(vec![]);
        let pool = test_pool(1);
        let distiller = Distiller::new(&factory, 3).with_backoff_base_ms(0);
        let err = distiller.distill("text", 5, "other", &pool).unwrap_err();
        assert!(matches!(err, DistillError::NoCredential(_)));
    }
}
