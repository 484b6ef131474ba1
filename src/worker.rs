//! Per-provider worker pools.
//!
//! Each provider gets an isolated bounded FIFO queue drained by a fixed
//! set of workers. Pools share nothing mutable: saturation or slowness in
//! one provider never touches another. Backpressure is signalled to the
//! submitter through the submission deadline; a full queue that stays
//! full until the deadline fails the attempt with `provider_unavailable`.
//!
//! Worker lifetime is tied to the provider, not to any request. A worker
//! processes one job at a time: cancellation check, `prepare`, `execute`
//! with bounded exponential backoff on transient errors, `parse`, then
//! exactly one outcome into the job's result sink.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::adapter::ProviderAdapter;
use crate::cancel::CancelToken;
use crate::error::GatewayError;
use crate::keys::SelectedKey;
use crate::pool::ResultCell;
use crate::types::{ChatRequest, ChatResponse};
use crate::Result;

const BACKOFF_BASE_MS: u64 = 100;
const BACKOFF_CAP_MS: u64 = 5_000;
const BACKOFF_JITTER: f64 = 0.25;

/// Outcome delivered through a job's result sink.
pub type JobResult = Result<ChatResponse>;

/// A single scheduled unit of work targeting one provider and one key.
pub struct Job {
    /// Snapshot of the request at dispatch time.
    pub request: ChatRequest,
    /// Model actually dispatched (the chain entry's model, not the
    /// request's primary).
    pub model: String,
    pub key: SelectedKey,
    /// 0-based index within the fallback chain.
    pub attempt: u32,
    pub deadline: Instant,
    pub cancel: CancelToken,
    pub sink: Arc<ResultCell<JobResult>>,
}

/// In-worker retry policy for transient upstream failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Exponential backoff with jitter: base 100 ms, factor 2, ±25 %,
    /// capped at 5 s.
    fn delay(&self, retry_index: u32) -> Duration {
        let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << retry_index.min(16));
        let capped = exp.min(BACKOFF_CAP_MS);
        let jitter = rand::rng().random_range((1.0 - BACKOFF_JITTER)..=(1.0 + BACKOFF_JITTER));
        Duration::from_millis((capped as f64 * jitter) as u64)
    }
}

/// Isolated bounded queue plus its workers for one provider.
pub struct WorkerPool {
    provider: String,
    tx: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers draining a queue of depth `queue_depth`.
    pub fn spawn(
        provider: impl Into<String>,
        adapter: Arc<dyn ProviderAdapter>,
        concurrency: usize,
        queue_depth: usize,
        retry: RetryPolicy,
    ) -> Self {
        let provider = provider.into();
        let (tx, rx) = mpsc::channel::<Job>(queue_depth.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..concurrency.max(1))
            .map(|worker_id| {
                let provider = provider.clone();
                let adapter = Arc::clone(&adapter);
                let retry = retry.clone();
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    worker_loop(provider, worker_id, rx, adapter, retry).await;
                })
            })
            .collect();

        Self {
            provider,
            tx,
            workers,
        }
    }

    /// Enqueue a job, waiting up to `submit_deadline` for queue space.
    pub async fn submit(&self, job: Job, submit_deadline: Instant) -> Result<()> {
        match tokio::time::timeout_at(submit_deadline, self.tx.send(job)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(GatewayError::provider_unavailable("worker pool stopped")
                .with_provider(self.provider.clone())),
            Err(_) => Err(GatewayError::provider_unavailable(
                "queue_full: submission deadline elapsed while waiting for queue space",
            )
            .with_provider(self.provider.clone())),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Workers currently spawned (fixed at construction).
    pub fn concurrency(&self) -> usize {
        self.workers.len()
    }
}

// No explicit shutdown: dropping the pool drops the sender, the queue
// closes, and workers drain what is already enqueued and exit.

async fn worker_loop(
    provider: String,
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    adapter: Arc<dyn ProviderAdapter>,
    retry: RetryPolicy,
) {
    loop {
        // Hold the lock only while waiting for the next job so sibling
        // workers can dequeue as soon as this one starts processing.
        let job = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(job) = job else { break };

        if job.cancel.is_canceled() {
            let _ = job.sink.send(Err(GatewayError::canceled()
                .with_provider(provider.clone())
                .with_attempt(job.attempt)));
            continue;
        }

        let outcome = run_job(&provider, &adapter, &retry, &job).await;
        if !job.sink.send(outcome) {
            tracing::warn!(
                provider = provider.as_str(),
                worker_id,
                "job sink already held an outcome; duplicate delivery suppressed"
            );
        }
    }
}

async fn run_job(
    provider: &str,
    adapter: &Arc<dyn ProviderAdapter>,
    retry: &RetryPolicy,
    job: &Job,
) -> JobResult {
    let started = Instant::now();
    let wire = adapter
        .prepare(&job.request, &job.model, job.key.secret())
        .map_err(|e| e.with_model(job.model.clone()).with_attempt(job.attempt))?;

    let mut retries: u32 = 0;
    loop {
        job.cancel.check()?;

        let result = match adapter.execute(&wire, job.deadline, &job.cancel).await {
            Ok(resp) => adapter.parse(resp),
            Err(e) => Err(e),
        };

        match result {
            Ok(resp) => {
                tracing::debug!(
                    provider,
                    model = job.model.as_str(),
                    attempt = job.attempt,
                    retries,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "attempt succeeded"
                );
                return Ok(resp);
            }
            Err(err) => {
                if err.is_canceled() || !err.retryable || retries >= retry.max_retries {
                    return Err(err.with_model(job.model.clone()).with_attempt(job.attempt));
                }
                let delay = retry.delay(retries);
                if Instant::now() + delay >= job.deadline {
                    return Err(err.with_model(job.model.clone()).with_attempt(job.attempt));
                }
                retries += 1;
                tracing::debug!(
                    provider,
                    model = job.model.as_str(),
                    retries,
                    delay_ms = delay.as_millis() as u64,
                    kind = err.kind.as_str(),
                    "retrying transient upstream failure"
                );
                tokio::select! {
                    _ = job.cancel.cancelled() => {
                        return Err(GatewayError::canceled().with_attempt(job.attempt));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth_and_cap() {
        let policy = RetryPolicy::new(10);
        // Jitter is ±25 %, so check bands rather than exact values.
        let d0 = policy.delay(0).as_millis() as f64;
        assert!((75.0..=125.0).contains(&d0), "d0 = {}", d0);
        let d3 = policy.delay(3).as_millis() as f64;
        assert!((600.0..=1000.0).contains(&d3), "d3 = {}", d3);
        let d10 = policy.delay(10).as_millis() as f64;
        assert!(d10 <= 5_000.0 * 1.25, "d10 = {}", d10);
    }
}
