//! Job processors: the components that perform the actual send work.
//!
//! The worker pool routes each claimed job to the processor matching its
//! kind; processors receive a [`JobContext`] giving them progress reporting
//! and lease renewal without direct access to the queue internals.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::jobs::{Job, JobEvent, JobEventSender, JobKind, JobQueue};
use crate::lock::{LeaseHandle, LockConfig};

pub mod bulk;
pub mod single;

pub use bulk::BulkSendProcessor;
pub use single::SingleSendProcessor;

// ═══════════════════════════════════════════════════════════════════════════════
// Send Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings governing individual and batched sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendConfig {
    /// Per-send timeout; a send that outlives this is a transient failure
    #[serde(with = "humantime_serde", default = "default_send_timeout")]
    pub send_timeout: Duration,
    /// Recipients per bulk batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause between bulk batches, throttling provider-side limits
    /// independent of the global rate limiter
    #[serde(with = "humantime_serde", default = "default_batch_pause")]
    pub batch_pause: Duration,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            send_timeout: default_send_timeout(),
            batch_size: default_batch_size(),
            batch_pause: default_batch_pause(),
        }
    }
}

fn default_send_timeout() -> Duration {
    Duration::from_millis(25_000)
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_pause() -> Duration {
    Duration::from_millis(1000)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context handed to a processor for one job execution.
pub struct JobContext {
    /// The claimed job
    pub job: Job,
    queue: Arc<JobQueue>,
    lease: LeaseHandle,
    lock_config: LockConfig,
    last_renewed: Mutex<Instant>,
    events: Option<JobEventSender>,
}

impl JobContext {
    pub fn new(
        job: Job,
        queue: Arc<JobQueue>,
        lease: LeaseHandle,
        lock_config: LockConfig,
        events: Option<JobEventSender>,
    ) -> Self {
        Self {
            job,
            queue,
            lease,
            lock_config,
            last_renewed: Mutex::new(Instant::now()),
            events,
        }
    }

    /// Record progress on the job and notify observers.
    pub async fn report_progress(&self, percent: u8) -> Result<()> {
        let percent = percent.min(100);
        self.queue.set_progress(self.job.id, percent).await?;
        self.emit(JobEvent::Progress {
            job_id: self.job.id,
            percent,
        });
        Ok(())
    }

    /// Renew the lease when less than the renewal threshold remains.
    ///
    /// Renewal failure means the lease was lost; the caller must stop
    /// assuming exclusive ownership of the job.
    pub async fn renew_lease(&self) -> Result<()> {
        let elapsed = self.last_renewed.lock().elapsed();
        let remaining = self.lock_config.ttl.saturating_sub(elapsed);
        if remaining > self.lock_config.renew_threshold {
            return Ok(());
        }
        self.lease.renew().await?;
        *self.last_renewed.lock() = Instant::now();
        Ok(())
    }

    /// Release the lease; called by the worker once the outcome is recorded.
    pub async fn release_lease(&self) {
        if let Err(e) = self.lease.release().await {
            tracing::warn!(job_id = %self.job.id, error = %e, "Lease release failed");
        }
    }

    /// Emit a job event to the notification channel.
    pub fn emit(&self, event: JobEvent) {
        if let Some(ref sender) = self.events {
            let _ = sender.send(event);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Processor Contract
// ═══════════════════════════════════════════════════════════════════════════════

/// A processor executes one kind of job.
#[async_trait::async_trait]
pub trait JobProcessor: Send + Sync {
    /// The kind of job this processor handles.
    fn kind(&self) -> JobKind;

    /// Execute the job. Returning an error routes the job through the
    /// queue's retry/terminal handling.
    async fn process(&self, ctx: &JobContext) -> Result<()>;
}

/// The routing table from job kind to processor.
pub struct ProcessorSet {
    single: Arc<dyn JobProcessor>,
    bulk: Arc<dyn JobProcessor>,
}

impl ProcessorSet {
    pub fn new(single: Arc<dyn JobProcessor>, bulk: Arc<dyn JobProcessor>) -> Self {
        Self { single, bulk }
    }

    /// Resolve the processor for a job kind.
    pub fn for_kind(&self, kind: JobKind) -> Arc<dyn JobProcessor> {
        match kind {
            JobKind::SingleSend => self.single.clone(),
            JobKind::BulkSend => self.bulk.clone(),
        }
    }
}
