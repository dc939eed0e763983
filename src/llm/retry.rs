//! Bounded retry for transient provider failures

use super::{LlmError, LlmRequest, LlmResponse, LlmService, SearchResults};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Retries retryable errors with exponential backoff (base, 2x base, 4x base, ...)
pub struct RetryingService {
    inner: Arc<dyn LlmService>,
    max_retries: u32,
    base_delay: Duration,
}

impl RetryingService {
    pub fn new(inner: Arc<dyn LlmService>, max_retries: u32) -> Self {
        Self {
            inner,
            max_retries,
            base_delay: Duration::from_secs(1),
        }
    }

    fn delay(&self, attempt: u32, error: &LlmError) -> Duration {
        error
            .retry_after
            .unwrap_or_else(|| self.base_delay * (1u32 << (attempt - 1).min(6)))
    }

    async fn run<T, F, Fut>(&self, mut call: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, LlmError>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Err(e) if e.kind.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.delay(attempt, &e);
                    tracing::warn!(
                        model = %self.inner.model_id(),
                        attempt,
                        delay_ms = %delay.as_millis(),
                        error = %e.message,
                        "Retrying LLM request"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl LlmService for RetryingService {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.run(|| self.inner.complete(request)).await
    }

    async fn search(&self, query: &str) -> Result<SearchResults, LlmError> {
        self.run(|| self.inner.search(query)).await
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }
}
