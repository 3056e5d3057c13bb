//! The external queue API consumed by the CRUD layer.
//!
//! Enqueuing callers only ever observe job-creation success or failure;
//! downstream send outcomes are observable through job/campaign status and
//! the job-event channel, never through a blocking response.

use chrono::Utc;
use metrics::counter;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::campaign::{CampaignStore, InMemoryCampaignStore, StatusAggregator};
use crate::config::DispatchConfig;
use crate::error::{DispatchError, Result};
use crate::jobs::queue::QueueBackend;
use crate::jobs::{
    EmailJobPayload, EnqueueOptions, Job, JobEvent, JobEventSender, JobId, JobKind, JobPriority,
    JobQueue, JobState, InMemoryQueueBackend, WorkerEnv, WorkerHandle, WorkerPool,
};
use crate::lock::{InMemoryLockManager, LockManager};
use crate::mailer::{
    AccountStore, InMemoryAccountStore, PassthroughRenderer, SmtpTransportFactory,
    TemplateRenderer, TransportFactory,
};
use crate::processor::{BulkSendProcessor, ProcessorSet, SingleSendProcessor};
use crate::throttle::{FixedWindowLimiter, RateLimiter};

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

/// Builder wiring the engine's collaborators.
///
/// Every seam is injectable; anything not provided falls back to the
/// in-memory/default implementation suitable for development and tests.
pub struct DispatchServiceBuilder {
    config: DispatchConfig,
    queue_backend: Option<Arc<dyn QueueBackend>>,
    lock_manager: Option<Arc<dyn LockManager>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    account_store: Option<Arc<dyn AccountStore>>,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    campaign_store: Option<Arc<dyn CampaignStore>>,
    renderer: Option<Arc<dyn TemplateRenderer>>,
    events: Option<JobEventSender>,
}

impl DispatchServiceBuilder {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            config,
            queue_backend: None,
            lock_manager: None,
            rate_limiter: None,
            account_store: None,
            transport_factory: None,
            campaign_store: None,
            renderer: None,
            events: None,
        }
    }

    pub fn queue_backend(mut self, backend: Arc<dyn QueueBackend>) -> Self {
        self.queue_backend = Some(backend);
        self
    }

    pub fn lock_manager(mut self, manager: Arc<dyn LockManager>) -> Self {
        self.lock_manager = Some(manager);
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn account_store(mut self, store: Arc<dyn AccountStore>) -> Self {
        self.account_store = Some(store);
        self
    }

    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    pub fn campaign_store(mut self, store: Arc<dyn CampaignStore>) -> Self {
        self.campaign_store = Some(store);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Attach a job-event notification channel.
    pub fn events(mut self, sender: JobEventSender) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn build(self) -> DispatchService {
        let queue = Arc::new(JobQueue::new(
            self.queue_backend
                .unwrap_or_else(|| Arc::new(InMemoryQueueBackend::new())),
        ));
        let locks = self
            .lock_manager
            .unwrap_or_else(|| Arc::new(InMemoryLockManager::new()));
        let limiter = self.rate_limiter.unwrap_or_else(|| {
            Arc::new(FixedWindowLimiter::new(self.config.rate_limit.clone()))
        });
        let accounts = self
            .account_store
            .unwrap_or_else(|| Arc::new(InMemoryAccountStore::new()));
        let transports = self
            .transport_factory
            .unwrap_or_else(|| Arc::new(SmtpTransportFactory));
        let campaigns = self
            .campaign_store
            .unwrap_or_else(|| Arc::new(InMemoryCampaignStore::new()));
        let renderer = self
            .renderer
            .unwrap_or_else(|| Arc::new(PassthroughRenderer));

        let aggregator = Arc::new(StatusAggregator::new(campaigns));
        let processors = Arc::new(ProcessorSet::new(
            Arc::new(SingleSendProcessor::new(
                accounts.clone(),
                transports.clone(),
                renderer.clone(),
                aggregator.clone(),
                self.config.sending.clone(),
            )),
            Arc::new(BulkSendProcessor::new(
                accounts,
                transports,
                renderer,
                aggregator.clone(),
                self.config.sending.clone(),
            )),
        ));

        DispatchService {
            config: self.config,
            queue,
            locks,
            limiter,
            aggregator,
            processors,
            events: self.events,
            worker: None,
            sweeper: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Service
// ═══════════════════════════════════════════════════════════════════════════════

/// The dispatch engine facade.
pub struct DispatchService {
    config: DispatchConfig,
    queue: Arc<JobQueue>,
    locks: Arc<dyn LockManager>,
    limiter: Arc<dyn RateLimiter>,
    aggregator: Arc<StatusAggregator>,
    processors: Arc<ProcessorSet>,
    events: Option<JobEventSender>,
    worker: Option<WorkerHandle>,
    sweeper: Option<JoinHandle<()>>,
}

impl DispatchService {
    /// Start building a service from configuration.
    pub fn builder(config: DispatchConfig) -> DispatchServiceBuilder {
        DispatchServiceBuilder::new(config)
    }

    /// Enqueue a single-send email job.
    pub async fn add_email_job(&self, payload: EmailJobPayload) -> Result<JobId> {
        self.enqueue(JobKind::SingleSend, payload, JobPriority::Normal)
            .await
    }

    /// Enqueue a bulk-send email job.
    pub async fn add_bulk_email_job(&self, payload: EmailJobPayload) -> Result<JobId> {
        self.enqueue(JobKind::BulkSend, payload, JobPriority::Normal)
            .await
    }

    /// Enqueue a job with an explicit priority.
    pub async fn enqueue(
        &self,
        kind: JobKind,
        payload: EmailJobPayload,
        priority: JobPriority,
    ) -> Result<JobId> {
        if payload.email_account_id.is_empty() {
            return Err(DispatchError::validation("emailAccountId must not be empty"));
        }
        if payload.recipients.is_empty() {
            return Err(DispatchError::validation("recipients must not be empty"));
        }

        let delay = payload.scheduled_for.map(EnqueueOptions::delay_until);
        let scheduled_at = payload.scheduled_for.unwrap_or_else(Utc::now);
        let campaign_id = payload.campaign_id.clone();

        let job = Job::new(
            kind,
            payload,
            EnqueueOptions {
                delay,
                priority,
                retry: Some(self.config.retry.clone()),
            },
        );
        let id = job.id;
        let job_kind = job.kind;

        self.queue.enqueue(job).await?;
        if let Some(ref campaign_id) = campaign_id {
            self.aggregator.mark_scheduled(campaign_id, scheduled_at).await;
        }

        counter!("dispatch_jobs_enqueued_total", "kind" => job_kind.to_string()).increment(1);
        if let Some(ref sender) = self.events {
            let _ = sender.send(JobEvent::Enqueued {
                job_id: id,
                kind: job_kind,
            });
        }
        tracing::info!(job_id = %id, kind = %job_kind, "Job enqueued");
        Ok(id)
    }

    /// List jobs in any of the given states.
    pub async fn list_jobs(&self, states: &[JobState]) -> Result<Vec<Job>> {
        self.queue.list(states).await
    }

    /// Fetch a job by id.
    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        self.queue.get(id).await
    }

    /// Remove a job; permitted only while it is Waiting or Delayed.
    pub async fn remove_job(&self, id: JobId) -> Result<()> {
        self.queue.remove(id).await
    }

    /// The underlying queue, for callers that poll job status directly.
    pub fn queue(&self) -> Arc<JobQueue> {
        self.queue.clone()
    }

    /// Start the worker pool and the retention sweeper.
    pub fn start(&mut self) {
        if self.worker.is_some() {
            return;
        }

        let pool = WorkerPool::new(self.config.worker.clone());
        let handle = pool.start(WorkerEnv {
            queue: self.queue.clone(),
            locks: self.locks.clone(),
            limiter: self.limiter.clone(),
            processors: self.processors.clone(),
            aggregator: self.aggregator.clone(),
            lock_config: self.config.lock.clone(),
            events: self.events.clone(),
        });
        self.worker = Some(handle);

        let queue = self.queue.clone();
        let retention = self.config.retention.clone();
        self.sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(retention.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match queue.sweep(&retention).await {
                    Ok(0) => {}
                    Ok(removed) => {
                        tracing::debug!(removed, "Retention sweep removed terminal jobs")
                    }
                    Err(e) => e.log(),
                }
            }
        }));
    }

    /// Stop the worker pool gracefully and cancel the sweeper.
    pub async fn shutdown(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        if let Some(worker) = self.worker.take() {
            worker.join().await;
        }
        tracing::info!("Dispatch service stopped");
    }

    /// Statistics of the running worker pool, if started.
    pub fn worker_stats(&self) -> Option<&crate::jobs::WorkerStats> {
        self.worker.as_ref().map(|w| w.stats())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
