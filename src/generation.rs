//! Completion client with a bounded retry policy.
//!
//! A [`CompletionBackend`] performs exactly one attempt against the completion
//! service and classifies its failure as transient or fatal. The
//! [`GenerationClient`] owns the retry loop: per-attempt timeout, backoff with
//! optional jitter, `Retry-After` support, and an optional fallback model once
//! the requested model has spent its budget.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use reqwest::StatusCode;
use reqwest::header::{HeaderValue, RETRY_AFTER};
use serde::{Deserialize, Serialize};

pub type BackendFuture<'a> =
    Pin<Box<dyn Future<Output = Result<String, AttemptError>> + Send + 'a>>;
pub type SleepFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Fatal,
}

/// Outcome of a single failed attempt.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct AttemptError {
    pub kind: FailureKind,
    pub status: Option<u16>,
    pub message: String,
    pub retry_after: Option<Duration>,
    pub timed_out: bool,
}

impl AttemptError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            status: None,
            message: message.into(),
            retry_after: None,
            timed_out: false,
        }
    }

    pub fn fatal(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Fatal,
            status,
            message: message.into(),
            retry_after: None,
            timed_out: false,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            timed_out: true,
            ..Self::transient(format!("attempt timed out after {:.1}s", after.as_secs_f64()))
        }
    }
}

/// One completion attempt. Implementations must not retry.
pub trait CompletionBackend: Send + Sync {
    fn complete<'a>(&'a self, request: &'a CompletionRequest) -> BackendFuture<'a>;
}

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> SleepFuture;
}

pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> SleepFuture {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// Fatal failure: bad model, auth, malformed request, quota.
    #[error("completion service rejected the request for model {model}: {message}")]
    Rejected {
        model: String,
        status: Option<u16>,
        message: String,
    },

    #[error("completion service unavailable for model {model} after {attempts} attempts: {message}")]
    Unavailable {
        model: String,
        attempts: u32,
        message: String,
    },

    #[error("completion for model {model} timed out after {attempts} attempts")]
    TimedOut { model: String, attempts: u32 },

    #[error("completion service returned empty text for model {model}")]
    EmptyCompletion { model: String },
}

impl GenerationError {
    fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            GenerationError::Unavailable { .. } | GenerationError::TimedOut { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Draw each delay uniformly between `base_delay` and the exponential ceiling.
    pub jitter: bool,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
            attempt_timeout: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Exponential ceiling for the wait after failed attempt `attempt` (1-based).
    pub fn ceiling_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1).min(64) as i32);
        let max = self.max_delay.as_secs_f64();
        let secs = (self.base_delay.as_secs_f64() * exp).min(max);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = self.ceiling_for(attempt);
        let floor = self.base_delay.min(ceiling);
        if !self.jitter || ceiling <= floor {
            return ceiling;
        }
        Duration::from_secs_f64(rng.gen_range(floor.as_secs_f64()..=ceiling.as_secs_f64()))
    }

    /// Upper bound on time spent in one model's retry loop. Saturates at
    /// `Duration::MAX`.
    pub fn worst_case_latency(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let waits = (1..attempts)
            .map(|a| self.ceiling_for(a))
            .fold(Duration::ZERO, Duration::saturating_add);
        self.attempt_timeout
            .checked_mul(attempts)
            .unwrap_or(Duration::MAX)
            .saturating_add(waits)
    }
}

#[derive(Clone)]
pub struct GenerationClient {
    backend: Arc<dyn CompletionBackend>,
    sleeper: Arc<dyn Sleeper>,
    policy: RetryPolicy,
    fallback_model: Option<String>,
}

impl GenerationClient {
    pub fn new(backend: Arc<dyn CompletionBackend>, policy: RetryPolicy) -> Self {
        Self {
            backend,
            sleeper: Arc::new(TokioSleeper),
            policy,
            fallback_model: None,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_fallback_model(mut self, model: Option<String>) -> Self {
        self.fallback_model = model.filter(|m| !m.trim().is_empty());
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn generate(&self, model: &str, prompt: &str) -> Result<String, GenerationError> {
        let err = match self.generate_with_model(model, prompt).await {
            Ok(text) => return Ok(text),
            Err(err) => err,
        };

        match self.fallback_model.as_deref() {
            Some(fallback) if err.is_exhaustion() && fallback != model => {
                tracing::warn!(
                    model,
                    fallback,
                    error = %err,
                    "retry budget exhausted; retrying with fallback model"
                );
                self.generate_with_model(fallback, prompt).await
            }
            _ => Err(err),
        }
    }

    async fn generate_with_model(
        &self,
        model: &str,
        prompt: &str,
    ) -> Result<String, GenerationError> {
        let request = CompletionRequest {
            model: model.to_string(),
            prompt: prompt.to_string(),
        };
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(
                self.policy.attempt_timeout,
                self.backend.complete(&request),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(AttemptError::timeout(self.policy.attempt_timeout)),
            };

            let err = match outcome {
                Ok(text) if text.trim().is_empty() => {
                    return Err(GenerationError::EmptyCompletion {
                        model: request.model,
                    });
                }
                Ok(text) => {
                    tracing::debug!(model, attempt, chars = text.len(), "completion received");
                    return Ok(text);
                }
                Err(err) => err,
            };

            if err.kind == FailureKind::Fatal {
                return Err(GenerationError::Rejected {
                    model: request.model,
                    status: err.status,
                    message: err.message,
                });
            }

            if attempt >= attempts {
                return Err(if err.timed_out {
                    GenerationError::TimedOut {
                        model: request.model,
                        attempts,
                    }
                } else {
                    GenerationError::Unavailable {
                        model: request.model,
                        attempts,
                        message: err.message,
                    }
                });
            }

            let delay = match err.retry_after {
                Some(d) => d.min(self.policy.max_delay),
                None => self.policy.delay_for(attempt, &mut rand::thread_rng()),
            };
            tracing::warn!(
                model,
                attempt,
                max_attempts = attempts,
                status = ?err.status,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient completion failure; backing off"
            );
            self.sleeper.sleep(delay).await;
        }
    }
}

/// OpenAI-compatible chat completions backend.
pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
    code: Option<String>,
}

impl OpenAiBackend {
    pub fn new(base_url: &str, api_key: &str) -> anyhow::Result<Self> {
        if api_key.trim().is_empty() {
            anyhow::bail!("completion service API key is empty");
        }
        let client = reqwest::Client::builder()
            .user_agent("record-generator/0.1")
            .build()
            .context("Failed creating HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.trim().to_string(),
        })
    }
}

impl CompletionBackend for OpenAiBackend {
    fn complete<'a>(&'a self, request: &'a CompletionRequest) -> BackendFuture<'a> {
        Box::pin(async move {
            let url = format!("{}/chat/completions", self.base_url);
            let body = ChatRequest {
                model: &request.model,
                messages: [ChatMessage {
                    role: "user",
                    content: &request.prompt,
                }],
            };

            let resp = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| classify_transport(&e))?;

            let status = resp.status();
            if status.is_success() {
                let parsed: ChatResponse = resp.json().await.map_err(|e| {
                    AttemptError::transient(format!("invalid completion payload: {e}"))
                })?;
                return Ok(first_completion(parsed));
            }

            let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
            let body = resp.text().await.unwrap_or_default();
            Err(classify_failure(status, &body, retry_after))
        })
    }
}

fn first_completion(resp: ChatResponse) -> String {
    resp.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default()
}

fn classify_transport(err: &reqwest::Error) -> AttemptError {
    if err.is_timeout() {
        AttemptError {
            timed_out: true,
            ..AttemptError::transient(format!("completion request timed out: {err}"))
        }
    } else if err.is_builder() {
        AttemptError::fatal(None, format!("invalid completion request: {err}"))
    } else {
        AttemptError::transient(format!("completion request failed: {err}"))
    }
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn classify_failure(status: StatusCode, body: &str, retry_after: Option<Duration>) -> AttemptError {
    let detail = serde_json::from_str::<ApiErrorBody>(body).ok().map(|b| b.error);
    let message = match &detail {
        Some(d) => format!("{status}: {}", d.message),
        None => format!("{status}: {}", truncate_for_log(body)),
    };

    // An exhausted quota also arrives as 429 but will not clear by waiting.
    let quota_exhausted = detail
        .as_ref()
        .and_then(|d| d.code.as_deref())
        .is_some_and(|c| c == "insufficient_quota");

    if is_retryable_status(status) && !quota_exhausted {
        AttemptError {
            status: Some(status.as_u16()),
            retry_after,
            ..AttemptError::transient(message)
        }
    } else {
        AttemptError::fatal(Some(status.as_u16()), message)
    }
}

pub fn parse_retry_after(value: Option<&HeaderValue>) -> Option<Duration> {
    let value = value?.to_str().ok()?.trim();
    let secs = value.parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

pub fn truncate_for_log(text: &str) -> String {
    let trimmed = text.trim();
    let max_len = 300usize;
    if trimmed.len() <= max_len {
        return trimmed.to_string();
    }
    let mut cut = max_len;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &trimmed[..cut])
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Replays a fixed script of attempt outcomes; repeats the last one when exhausted.
    pub struct ScriptedBackend {
        script: Mutex<VecDeque<Result<String, AttemptError>>>,
        last: Mutex<Option<Result<String, AttemptError>>>,
        calls: AtomicUsize,
        pub requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedBackend {
        pub fn new(script: Vec<Result<String, AttemptError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn always(outcome: Result<String, AttemptError>) -> Self {
            Self::new(vec![outcome])
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn models(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.model.clone())
                .collect()
        }
    }

    impl CompletionBackend for ScriptedBackend {
        fn complete<'a>(&'a self, request: &'a CompletionRequest) -> BackendFuture<'a> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            let next = self.script.lock().unwrap().pop_front();
            let outcome = match next {
                Some(o) => {
                    *self.last.lock().unwrap() = Some(o.clone());
                    o
                }
                None => self
                    .last
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or_else(|| Err(AttemptError::fatal(None, "empty script"))),
            };
            Box::pin(async move { outcome })
        }
    }

    #[derive(Default)]
    pub struct RecordingSleeper {
        pub delays: Mutex<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) -> SleepFuture {
            self.delays.lock().unwrap().push(duration);
            Box::pin(async {})
        }
    }
}
