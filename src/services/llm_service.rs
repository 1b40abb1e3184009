use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::AppError;
use crate::services::settings_service::LlmSettings;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(75);
const SSE_DATA_PREFIX: &str = "data:";
const SSE_DONE: &str = "[DONE]";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionOptions {
    pub stream: bool,
}

/// How a completion call ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    Complete(String),
    /// The caller's cancel flag was raised; no text is delivered.
    Aborted,
}

pub type ChunkSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// A chat-completion backend. Each call ends in the full text, an error, or
/// an abort. `on_chunk` sees every streamed delta at most once: a stream that
/// fails after its first delta is not retried.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Pre-flight check so callers can fail before doing any work.
    fn ensure_configured(&self) -> Result<(), AppError>;

    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: CompletionOptions,
        cancel: Arc<AtomicBool>,
        on_chunk: ChunkSink<'_>,
    ) -> Result<CompletionOutcome, AppError>;
}

// ---------------------------------------------------------------------------
// Cancellation and retry
// ---------------------------------------------------------------------------

/// Races `request` against the cancel flag (polled every 75 ms) and a timeout.
/// Dropping the request future on abort tears down the connection.
pub async fn send_with_cancellation<F>(
    request: F,
    cancel: &AtomicBool,
    timeout: Duration,
) -> Result<CompletionOutcome, AppError>
where
    F: Future<Output = Result<String, AppError>>,
{
    let started = tokio::time::Instant::now();
    tokio::pin!(request);

    loop {
        tokio::select! {
            result = &mut request => {
                return result.map(CompletionOutcome::Complete);
            }
            _ = tokio::time::sleep(CANCEL_POLL_INTERVAL) => {
                if cancel.load(Ordering::Relaxed) {
                    return Ok(CompletionOutcome::Aborted);
                }
                if started.elapsed() >= timeout {
                    return Err(AppError::Llm(format!(
                        "completion request timed out after {}s",
                        timeout.as_secs()
                    )));
                }
            }
        }
    }
}

fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();

    if lower.contains("cancelled") {
        return false;
    }

    if lower.contains("unauthorized")
        || lower.contains("bad request")
        || lower.contains("no api key")
        || lower.contains("invalid api key")
        || lower.contains("permission")
    {
        return false;
    }

    if let Some(status) = extract_http_status_code(&lower) {
        if (400..500).contains(&status) && !matches!(status, 408 | 409 | 429) {
            return false;
        }
    }

    true
}

pub fn is_retryable_error(error: &AppError) -> bool {
    match error {
        AppError::Cancelled | AppError::Config(_) | AppError::Decode(_) => false,
        AppError::Http(e) => match e.status() {
            Some(status) => {
                status.is_server_error() || matches!(status.as_u16(), 408 | 409 | 429)
            }
            None => !e.is_builder() && !e.is_decode(),
        },
        other => is_retryable_message(&other.to_string()),
    }
}

fn extract_http_status_code(message: &str) -> Option<u16> {
    for token in message.split(|c: char| !c.is_ascii_digit()) {
        if token.len() != 3 {
            continue;
        }
        let Ok(status) = token.parse::<u16>() else {
            continue;
        };
        if (100..600).contains(&status) {
            return Some(status);
        }
    }
    None
}

fn retry_backoff_duration(attempt: usize) -> Duration {
    let exponent = (attempt.saturating_sub(1)).min(5) as u32;
    let base = 250u64
        .saturating_mul(2u64.saturating_pow(exponent))
        .min(5_000u64);
    let jitter_seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    let jitter = jitter_seed % 250;
    Duration::from_millis(base + jitter)
}

/// Sleeps for `delay`, returning `false` early if the flag is raised.
async fn sleep_unless_cancelled(cancel: &AtomicBool, delay: Duration) -> bool {
    let started = tokio::time::Instant::now();
    while started.elapsed() < delay {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        let remaining = delay.saturating_sub(started.elapsed());
        tokio::time::sleep(remaining.min(Duration::from_millis(100))).await;
    }
    !cancel.load(Ordering::Relaxed)
}

/// Runs `attempt` up to `max_attempts` times, backing off between transient
/// failures. Aborts are returned as-is and never retried, and so is any
/// failure after `emitted` was raised, since the caller has already seen
/// partial output.
pub async fn send_with_retry<F, Fut>(
    mut attempt: F,
    cancel: &AtomicBool,
    emitted: &AtomicBool,
    max_attempts: usize,
) -> Result<CompletionOutcome, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<CompletionOutcome, AppError>>,
{
    let attempts = max_attempts.max(1);

    for current in 1..=attempts {
        if cancel.load(Ordering::Relaxed) {
            return Ok(CompletionOutcome::Aborted);
        }

        match attempt().await {
            Ok(outcome) => return Ok(outcome),
            Err(err) => {
                if emitted.load(Ordering::Relaxed) {
                    tracing::warn!(attempt = current, error = %err, "stream failed after partial output, not retrying");
                    return Err(err);
                }
                if current >= attempts || !is_retryable_error(&err) {
                    if current > 1 {
                        return Err(AppError::Llm(format!(
                            "completion failed after {current} attempts: {err}"
                        )));
                    }
                    return Err(err);
                }

                let delay = retry_backoff_duration(current);
                tracing::warn!(attempt = current, delay_ms = delay.as_millis() as u64, error = %err, "retrying completion request");
                if !sleep_unless_cancelled(cancel, delay).await {
                    return Ok(CompletionOutcome::Aborted);
                }
            }
        }
    }

    Err(AppError::Llm("completion failed with unknown error".to_string()))
}

// ---------------------------------------------------------------------------
// OpenAI-compatible HTTP backend
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    Delta(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.trim().strip_prefix(SSE_DATA_PREFIX) else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == SSE_DONE {
        return SseLine::Done;
    }
    match serde_json::from_str::<Value>(data) {
        Ok(value) => value
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
            .filter(|content| !content.is_empty())
            .map(|content| SseLine::Delta(content.to_string()))
            .unwrap_or(SseLine::Skip),
        Err(e) => {
            tracing::debug!(error = %e, chunk = data, "unparseable stream chunk");
            SseLine::Skip
        }
    }
}

fn message_content(body: &Value) -> Result<String, AppError> {
    body.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AppError::Llm("completion response has no message content".to_string()))
}

pub struct HttpCompletionService {
    client: reqwest::Client,
    settings: LlmSettings,
}

impl HttpCompletionService {
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &LlmSettings {
        &self.settings
    }

    async fn request(
        &self,
        messages: &[ChatMessage],
        stream: bool,
        on_chunk: ChunkSink<'_>,
    ) -> Result<String, AppError> {
        let body = json!({
            "model": self.settings.effective_model(),
            "messages": messages,
            "stream": stream,
        });
        tracing::debug!(
            provider = %self.settings.provider,
            model = %self.settings.effective_model(),
            messages = messages.len(),
            stream,
            "sending completion request"
        );

        let response = self
            .client
            .post(&self.settings.base_url)
            .bearer_auth(&self.settings.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::Llm(format!("HTTP error {}: {text}", status.as_u16())));
        }

        if !stream {
            let value: Value = response.json().await?;
            return message_content(&value);
        }

        let mut accumulated = String::new();
        let mut pending: Vec<u8> = Vec::new();
        let mut bytes = response.bytes_stream();

        while let Some(chunk) = bytes.next().await {
            pending.extend_from_slice(&chunk?);
            while let Some(newline) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=newline).collect();
                match parse_sse_line(&String::from_utf8_lossy(&line)) {
                    SseLine::Delta(delta) => {
                        on_chunk(&delta);
                        accumulated.push_str(&delta);
                    }
                    SseLine::Done => return Ok(accumulated),
                    SseLine::Skip => {}
                }
            }
        }

        if let SseLine::Delta(delta) = parse_sse_line(&String::from_utf8_lossy(&pending)) {
            on_chunk(&delta);
            accumulated.push_str(&delta);
        }
        Ok(accumulated)
    }
}

#[async_trait]
impl CompletionService for HttpCompletionService {
    fn ensure_configured(&self) -> Result<(), AppError> {
        self.settings.validate()
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: CompletionOptions,
        cancel: Arc<AtomicBool>,
        on_chunk: ChunkSink<'_>,
    ) -> Result<CompletionOutcome, AppError> {
        self.ensure_configured()?;

        let stream = options.stream && self.settings.stream;
        let timeout = Duration::from_secs(self.settings.request_timeout_secs.max(1));
        let flag: &AtomicBool = &cancel;
        let emitted = AtomicBool::new(false);
        let tracked = |delta: &str| {
            emitted.store(true, Ordering::Relaxed);
            on_chunk(delta);
        };
        let sink: ChunkSink<'_> = &tracked;

        let outcome = send_with_retry(
            move || send_with_cancellation(self.request(messages, stream, sink), flag, timeout),
            flag,
            &emitted,
            self.settings.max_attempts,
        )
        .await;

        match &outcome {
            Ok(CompletionOutcome::Complete(text)) => {
                tracing::debug!(chars = text.len(), "completion finished");
            }
            Ok(CompletionOutcome::Aborted) => tracing::info!("completion aborted"),
            Err(e) => tracing::warn!(error = %e, "completion failed"),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tracing_test::traced_test;

    #[test]
    fn sse_lines_yield_deltas_and_done() {
        assert_eq!(
            parse_sse_line("data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n"),
            SseLine::Delta("Hel".to_string())
        );
        assert_eq!(parse_sse_line("data: [DONE]"), SseLine::Done);
        assert_eq!(parse_sse_line("data:{\"choices\":[{\"delta\":{}}]}"), SseLine::Skip);
        assert_eq!(parse_sse_line(": keep-alive"), SseLine::Skip);
        assert_eq!(parse_sse_line("data: {broken"), SseLine::Skip);
    }

    #[test]
    fn message_content_reads_first_choice() {
        let body = json!({"choices": [{"message": {"role": "assistant", "content": "[]"}}]});
        assert_eq!(message_content(&body).unwrap(), "[]");
        assert!(message_content(&json!({"choices": []})).is_err());
    }

    #[test]
    fn retry_classification_follows_status() {
        assert!(!is_retryable_error(&AppError::Llm("HTTP error 401: unauthorized".to_string())));
        assert!(!is_retryable_error(&AppError::Llm("HTTP error 400: nope".to_string())));
        assert!(is_retryable_error(&AppError::Llm("HTTP error 429: slow down".to_string())));
        assert!(is_retryable_error(&AppError::Llm("HTTP error 503: busy".to_string())));
        assert!(is_retryable_error(&AppError::Llm("completion request timed out after 90s".to_string())));
        assert!(!is_retryable_error(&AppError::Config("no model".to_string())));
        assert!(!is_retryable_error(&AppError::Cancelled));
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        assert!(retry_backoff_duration(1) >= Duration::from_millis(250));
        assert!(retry_backoff_duration(1) < Duration::from_millis(500));
        assert!(retry_backoff_duration(3) >= Duration::from_millis(1_000));
        assert!(retry_backoff_duration(20) < Duration::from_millis(5_250));
    }

    #[tokio::test]
    async fn cancellation_aborts_pending_request() {
        let cancel = AtomicBool::new(true);
        let outcome = send_with_cancellation(
            std::future::pending::<Result<String, AppError>>(),
            &cancel,
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        assert_eq!(outcome, CompletionOutcome::Aborted);
    }

    #[tokio::test]
    async fn pending_request_times_out() {
        let cancel = AtomicBool::new(false);
        let result = send_with_cancellation(
            std::future::pending::<Result<String, AppError>>(),
            &cancel,
            Duration::from_millis(100),
        )
        .await;
        assert!(matches!(result, Err(AppError::Llm(msg)) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn finished_request_is_delivered() {
        let cancel = AtomicBool::new(false);
        let outcome = send_with_cancellation(
            async { Ok("done".to_string()) },
            &cancel,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(outcome, CompletionOutcome::Complete("done".to_string()));
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failure() {
        let cancel = AtomicBool::new(false);
        let calls = AtomicUsize::new(0);

        let outcome = send_with_retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(AppError::Llm("HTTP error 503: busy".to_string()))
                    } else {
                        Ok(CompletionOutcome::Complete("ok".to_string()))
                    }
                }
            },
            &cancel,
            &AtomicBool::new(false),
            3,
        )
        .await
        .unwrap();

        assert_eq!(outcome, CompletionOutcome::Complete("ok".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn single_attempt_and_permanent_errors_are_not_retried() {
        let cancel = AtomicBool::new(false);
        let calls = AtomicUsize::new(0);

        let result = send_with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AppError::Llm("HTTP error 503: busy".to_string())) }
            },
            &cancel,
            &AtomicBool::new(false),
            1,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let result = send_with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AppError::Llm("HTTP error 401: unauthorized".to_string())) }
            },
            &cancel,
            &AtomicBool::new(false),
            5,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn failure_after_partial_output_is_not_retried() {
        let cancel = AtomicBool::new(false);
        let emitted = AtomicBool::new(false);
        let calls = AtomicUsize::new(0);

        let result = send_with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                emitted.store(true, Ordering::Relaxed);
                async { Err(AppError::Llm("HTTP error 503: busy".to_string())) }
            },
            &cancel,
            &emitted,
            3,
        )
        .await;

        assert!(matches!(result, Err(AppError::Llm(msg)) if msg == "HTTP error 503: busy"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(logs_contain("not retrying"));
    }

    #[tokio::test]
    async fn unconfigured_service_fails_before_sending() {
        let service = HttpCompletionService::new(LlmSettings::default());
        let result = service
            .complete(
                &[ChatMessage::user("hi")],
                CompletionOptions::default(),
                Arc::new(AtomicBool::new(false)),
                &|_: &str| {},
            )
            .await;
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
