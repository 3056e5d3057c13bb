//! Worker pool for concurrent job execution.
//!
//! A fixed number of executors continuously poll the shared queue. Every
//! claim is gated by the process-wide rate limiter; a claimed job is leased
//! through the lock manager before its processor runs, and the outcome is
//! recorded back through ack/nack.

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::job::{JobEvent, JobEventSender};
use super::queue::{JobQueue, NackOutcome};
use crate::campaign::StatusAggregator;
use crate::lock::{LeaseHandle, LockConfig, LockManager};
use crate::processor::{JobContext, ProcessorSet};
use crate::throttle::RateLimiter;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of concurrent executors
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// How long an idle executor waits before polling again
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Grace period for in-flight jobs at shutdown
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
    /// Pool name (for logging/metrics)
    #[serde(default = "default_name")]
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval: default_poll_interval(),
            shutdown_timeout: default_shutdown_timeout(),
            name: default_name(),
        }
    }
}

fn default_concurrency() -> usize {
    5
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_name() -> String {
    "dispatch-worker".to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Statistics for the worker pool.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Total jobs claimed
    pub processed: Arc<AtomicU64>,
    /// Jobs that completed successfully
    pub succeeded: Arc<AtomicU64>,
    /// Jobs that failed terminally
    pub failed: Arc<AtomicU64>,
    /// Failed attempts scheduled for retry
    pub retried: Arc<AtomicU64>,
    /// Claims released because the lease was already held
    pub lock_conflicts: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn lock_conflicts(&self) -> u64 {
        self.lock_conflicts.load(Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Environment
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything an executor needs, injected rather than ambient.
#[derive(Clone)]
pub struct WorkerEnv {
    pub queue: Arc<JobQueue>,
    pub locks: Arc<dyn LockManager>,
    pub limiter: Arc<dyn RateLimiter>,
    pub processors: Arc<ProcessorSet>,
    pub aggregator: Arc<StatusAggregator>,
    pub lock_config: LockConfig,
    pub events: Option<JobEventSender>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Pool
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle for controlling a running worker pool.
pub struct WorkerHandle {
    shutdown: tokio::sync::watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    stats: WorkerStats,
    shutdown_timeout: Duration,
}

impl WorkerHandle {
    /// Signal the pool to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Get pool statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Signal shutdown and wait for in-flight jobs to finish.
    ///
    /// Executors still running after the grace period are aborted.
    pub async fn join(mut self) {
        let _ = self.shutdown.send(true);
        let timeout = self.shutdown_timeout;
        let drain = async {
            for handle in self.handles.iter_mut() {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            tracing::warn!("Worker pool shutdown timed out; aborting executors");
            for handle in &self.handles {
                handle.abort();
            }
        }
    }
}

/// A fixed-size pool of job executors.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    stats: WorkerStats,
}

impl WorkerPool {
    /// Create a new worker pool.
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            stats: WorkerStats::new(),
        }
    }

    /// Start the executors, returning a handle for control.
    pub fn start(self, env: WorkerEnv) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let mut handles = Vec::with_capacity(self.config.concurrency);

        tracing::info!(
            pool = %self.config.name,
            concurrency = self.config.concurrency,
            "Worker pool started"
        );

        for worker_id in 0..self.config.concurrency {
            let env = env.clone();
            let config = self.config.clone();
            let stats = self.stats.clone();
            let mut shutdown_rx = shutdown_rx.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }

                    if !env.limiter.try_claim() {
                        let wait = env
                            .limiter
                            .time_until_available()
                            .max(Duration::from_millis(10));
                        tokio::select! {
                            _ = shutdown_rx.changed() => {}
                            _ = tokio::time::sleep(wait) => {}
                        }
                        continue;
                    }

                    match env.queue.dequeue_next().await {
                        Ok(Some(job)) => {
                            process_job(&env, &stats, job).await;
                        }
                        Ok(None) => {
                            tokio::select! {
                                _ = shutdown_rx.changed() => {}
                                _ = tokio::time::sleep(config.poll_interval) => {}
                            }
                        }
                        Err(e) => {
                            e.log();
                            tokio::select! {
                                _ = shutdown_rx.changed() => {}
                                _ = tokio::time::sleep(config.poll_interval) => {}
                            }
                        }
                    }
                }

                tracing::debug!(pool = %config.name, worker_id, "Executor stopped");
            }));
        }

        WorkerHandle {
            shutdown: shutdown_tx,
            handles,
            stats: self.stats,
            shutdown_timeout: self.config.shutdown_timeout,
        }
    }
}

/// Run one claimed job through lease acquisition, processing, and outcome
/// recording.
async fn process_job(env: &WorkerEnv, stats: &WorkerStats, job: super::job::Job) {
    stats.processed.fetch_add(1, Ordering::Relaxed);
    counter!("dispatch_jobs_claimed_total", "kind" => job.kind.to_string()).increment(1);

    let token = match env.locks.acquire(job.id, env.lock_config.ttl).await {
        Ok(token) => token,
        Err(e) => {
            // Should not occur under correct queue semantics; release the
            // claim without charging an attempt.
            stats.lock_conflicts.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(job_id = %job.id, error = %e, "Lease held elsewhere; releasing claim");
            if let Err(release_err) = env.queue.release(job.id).await {
                release_err.log();
            }
            return;
        }
    };

    let lease = LeaseHandle::new(env.locks.clone(), job.id, token, env.lock_config.ttl);
    let ctx = JobContext::new(
        job.clone(),
        env.queue.clone(),
        lease,
        env.lock_config.clone(),
        env.events.clone(),
    );

    let processor = env.processors.for_kind(job.kind);
    let result = processor.process(&ctx).await;

    match result {
        Ok(()) => {
            if let Err(e) = env.queue.ack(job.id).await {
                e.log();
            } else {
                stats.succeeded.fetch_add(1, Ordering::Relaxed);
                counter!("dispatch_jobs_succeeded_total", "kind" => job.kind.to_string())
                    .increment(1);
                ctx.emit(JobEvent::Completed { job_id: job.id });
            }
        }
        Err(error) => {
            error.log();
            match env.queue.nack(job.id, &error).await {
                Ok(NackOutcome::Retried { attempt, delay }) => {
                    stats.retried.fetch_add(1, Ordering::Relaxed);
                    counter!("dispatch_jobs_retried_total", "kind" => job.kind.to_string())
                        .increment(1);
                    ctx.emit(JobEvent::Retried {
                        job_id: job.id,
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        error: error.to_string(),
                    });
                }
                Ok(NackOutcome::Exhausted) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    counter!("dispatch_jobs_failed_total", "kind" => job.kind.to_string())
                        .increment(1);
                    ctx.emit(JobEvent::Failed {
                        job_id: job.id,
                        error: error.to_string(),
                    });
                    if let Some(ref campaign_id) = job.payload.campaign_id {
                        env.aggregator.mark_failed(campaign_id).await;
                    }
                }
                Err(nack_err) => nack_err.log(),
            }
        }
    }

    ctx.release_lease().await;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
