//! Response producer abstraction
//!
//! The model call itself lives outside this crate. A producer takes the
//! role-tagged context plus a cancellation token and yields an ordered stream
//! of [`ProducerEvent`]s.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use folio_core::{Message, ProducerEventStream, Result};
use tokio_util::sync::CancellationToken;

/// Per-run options handed to the producer
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    /// System prompt, supplied fresh on every run
    pub system_prompt: Option<String>,
    /// Maximum tokens per response
    pub max_tokens: Option<u32>,
    /// Temperature
    pub temperature: Option<f32>,
}

/// Produces an assistant response as an ordered event stream
#[async_trait]
pub trait Producer: Send + Sync {
    /// Start producing a response to `messages`.
    ///
    /// The producer is expected to stop emitting promptly once `cancel` fires.
    async fn run(
        &self,
        messages: Vec<Message>,
        config: &RunConfig,
        cancel: CancellationToken,
    ) -> Result<ProducerEventStream>;
}

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Wraps a producer and retries stream start-up on transient failures.
///
/// Context overflow is never retried; the caller handles it by compacting.
pub struct RetryingProducer {
    inner: Arc<dyn Producer>,
    retry_config: RetryConfig,
}

impl RetryingProducer {
    pub fn new(inner: Arc<dyn Producer>) -> Self {
        Self {
            inner,
            retry_config: RetryConfig::default(),
        }
    }

    /// Set retry configuration
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }
}

#[async_trait]
impl Producer for RetryingProducer {
    async fn run(
        &self,
        messages: Vec<Message>,
        config: &RunConfig,
        cancel: CancellationToken,
    ) -> Result<ProducerEventStream> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(folio_core::Error::Aborted);
            }

            match self
                .inner
                .run(messages.clone(), config, cancel.clone())
                .await
            {
                Ok(stream) => return Ok(stream),
                Err(e) if e.is_context_overflow() => return Err(e),
                Err(e) if e.is_retryable() && attempt < self.retry_config.max_retries => {
                    let delay = self.retry_config.delay_for_attempt(attempt);
                    tracing::warn!(
                        "Producer failed to start (attempt {}/{}): {}. Retrying in {:?}...",
                        attempt + 1,
                        self.retry_config.max_retries + 1,
                        e,
                        delay
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(folio_core::Error::Aborted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
