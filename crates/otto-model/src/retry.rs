// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::{CompletionRequest, LlmProvider, ResponseStream};

/// Exponential-backoff retry wrapper for transient provider failures.
///
/// The executor treats the provider boundary as the place where wire-level
/// flakiness dies: request timeouts, 429s, and 5xx responses are retried
/// here with jittered exponential backoff; anything else (auth errors,
/// malformed requests, context overflows) propagates immediately.
///
/// The retry covers only the initial `complete` call.  A stream that fails
/// mid-flight is the caller's problem — replaying half a response would
/// duplicate text into the conversation.
pub struct RetryingProvider {
    inner: Arc<dyn LlmProvider>,
    max_attempts: u32,
    base_delay: Duration,
    /// Invoked before each retry sleep with (attempt, error text).
    on_retry: Option<Box<dyn Fn(u32, &str) + Send + Sync>>,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn LlmProvider>) -> Self {
        Self {
            inner,
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            on_retry: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Register a callback fired before each retry (used by the executor to
    /// emit `llm_retry` events).
    pub fn with_retry_callback(mut self, cb: impl Fn(u32, &str) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Box::new(cb));
        self
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // 500ms, 1s, 2s, 4s, ... capped at 30s.
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(6));
        exp.min(Duration::from_secs(30))
    }
}

/// Whether an error string looks like a transient wire failure.
///
/// String matching is deliberate: the capability trait erases concrete error
/// types, and every HTTP driver in the wild puts the status or condition in
/// the message.
pub(crate) fn is_transient(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("timeout")
        || msg.contains("timed out")
        || msg.contains("connection")
        || msg.contains("temporarily")
        || msg.contains("rate limit")
        || msg.contains("overloaded")
        || msg.contains("429")
        || msg.contains("500")
        || msg.contains("502")
        || msg.contains("503")
        || msg.contains("529")
}

#[async_trait]
impl LlmProvider for RetryingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn context_window(&self) -> usize {
        self.inner.context_window()
    }

    fn max_output_tokens(&self) -> usize {
        self.inner.max_output_tokens()
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let mut attempt = 0u32;
        loop {
            match self.inner.complete(req.clone()).await {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt + 1 < self.max_attempts && is_transient(&e) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient provider error, retrying: {e}"
                    );
                    if let Some(cb) = &self.on_retry {
                        cb(attempt + 1, &e.to_string());
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
