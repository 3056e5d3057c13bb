//! Durable job queue with delay, priority, and retry support.
//!
//! The queue is abstracted behind [`QueueBackend`] so it can be backed by the
//! in-memory structure for tests and development or by Redis in production;
//! nothing beyond atomic state transitions is assumed of the backing store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::job::{Job, JobId, JobState};
use crate::error::{DispatchError, Result};

/// Outcome of a negative acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    /// The job was returned to Waiting and will be retried after the delay.
    Retried { attempt: u32, delay: Duration },
    /// The job exhausted its attempts and is terminally Failed.
    Exhausted,
}

/// Retention policy for terminal jobs.
///
/// A configuration concern, not a correctness one: sweeping only ever removes
/// Completed/Failed records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Keep at most this many completed jobs (newest first)
    #[serde(default = "default_keep_completed")]
    pub keep_completed: usize,
    /// Keep failed jobs for this long after they finish
    #[serde(with = "humantime_serde", default = "default_keep_failed_for")]
    pub keep_failed_for: Duration,
    /// How often the sweep task runs
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_completed: default_keep_completed(),
            keep_failed_for: default_keep_failed_for(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

fn default_keep_completed() -> usize {
    100
}

fn default_keep_failed_for() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backend Contract
// ═══════════════════════════════════════════════════════════════════════════════

/// Trait for queue backends.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Store a new job.
    async fn enqueue(&self, job: Job) -> Result<()>;

    /// Claim the next eligible job, transitioning it to Active.
    ///
    /// Delayed jobs whose delay has elapsed are promoted to Waiting first.
    /// Ordering is priority-then-readiness and approximate across concurrent
    /// callers; ties may be broken arbitrarily.
    async fn dequeue_next(&self) -> Result<Option<Job>>;

    /// Mark an Active job as Completed.
    async fn ack(&self, id: JobId) -> Result<()>;

    /// Record a failed attempt: retry with backoff, or fail terminally.
    async fn nack(&self, id: JobId, error: &DispatchError) -> Result<NackOutcome>;

    /// Return an unprocessed claim to Waiting, reverting its attempt count.
    async fn release(&self, id: JobId) -> Result<()>;

    /// Remove a job; permitted only while Waiting or Delayed.
    async fn remove(&self, id: JobId) -> Result<()>;

    /// Fetch a job by id.
    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// List jobs in any of the given states.
    async fn list(&self, states: &[JobState]) -> Result<Vec<Job>>;

    /// Record progress (0-100) for a job.
    async fn set_progress(&self, id: JobId, progress: u8) -> Result<()>;

    /// Apply the retention policy; returns the number of jobs removed.
    async fn sweep(&self, retention: &RetentionPolicy) -> Result<usize>;

    /// Number of jobs awaiting processing (Waiting or Delayed).
    async fn len(&self) -> Result<usize>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// In-memory queue backend for testing and development.
///
/// All transitions happen under one mutex, which is what makes each of them
/// atomic with respect to concurrently polling workers.
#[derive(Default)]
pub struct InMemoryQueueBackend {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl InMemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn enqueue(&self, job: Job) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        tracing::debug!(job_id = %job.id, kind = %job.kind, state = %job.state, "Job enqueued");
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn dequeue_next(&self) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();

        for job in jobs.values_mut() {
            if job.state == JobState::Delayed && job.ready_at <= now {
                job.state = JobState::Waiting;
            }
        }

        let next = jobs
            .values()
            .filter(|j| j.state == JobState::Waiting && j.ready_at <= now)
            .max_by_key(|j| (j.priority, std::cmp::Reverse(j.ready_at), std::cmp::Reverse(j.created_at)))
            .map(|j| j.id);

        match next.and_then(|id| jobs.get_mut(&id)) {
            Some(job) => {
                job.mark_running();
                Ok(Some(job.clone()))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, id: JobId) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or_else(|| DispatchError::job_not_found(id))?;
        job.mark_completed();
        tracing::debug!(job_id = %id, "Job completed");
        Ok(())
    }

    async fn nack(&self, id: JobId, error: &DispatchError) -> Result<NackOutcome> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or_else(|| DispatchError::job_not_found(id))?;

        if job.can_retry() {
            let delay = job.next_backoff();
            job.mark_retrying(&error.to_string(), delay);
            tracing::info!(
                job_id = %id,
                attempt = job.attempts,
                delay_ms = delay.as_millis() as u64,
                "Job scheduled for retry"
            );
            Ok(NackOutcome::Retried {
                attempt: job.attempts,
                delay,
            })
        } else {
            job.mark_failed(&error.to_string());
            tracing::warn!(job_id = %id, attempts = job.attempts, "Job failed terminally");
            Ok(NackOutcome::Exhausted)
        }
    }

    async fn release(&self, id: JobId) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or_else(|| DispatchError::job_not_found(id))?;
        if job.state != JobState::Active {
            return Err(DispatchError::invalid_transition(format!(
                "cannot release job {} in state {}",
                id, job.state
            )));
        }
        job.mark_released();
        Ok(())
    }

    async fn remove(&self, id: JobId) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get(&id).ok_or_else(|| DispatchError::job_not_found(id))?;
        if !job.state.is_removable() {
            return Err(DispatchError::invalid_transition(format!(
                "cannot remove job {} in state {}; it is already claimed",
                id, job.state
            )));
        }
        jobs.remove(&id);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn list(&self, states: &[JobState]) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().await;
        let mut matched: Vec<Job> = jobs
            .values()
            .filter(|j| states.contains(&j.state))
            .cloned()
            .collect();
        matched.sort_by_key(|j| j.created_at);
        Ok(matched)
    }

    async fn set_progress(&self, id: JobId, progress: u8) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or_else(|| DispatchError::job_not_found(id))?;
        job.progress = progress.min(100);
        Ok(())
    }

    async fn sweep(&self, retention: &RetentionPolicy) -> Result<usize> {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();
        let mut removed = 0;

        let mut completed: Vec<(JobId, Option<DateTime<Utc>>)> = jobs
            .values()
            .filter(|j| j.state == JobState::Completed)
            .map(|j| (j.id, j.finished_at))
            .collect();
        completed.sort_by(|a, b| b.1.cmp(&a.1));
        for (id, _) in completed.into_iter().skip(retention.keep_completed) {
            jobs.remove(&id);
            removed += 1;
        }

        let failed_cutoff =
            now - chrono::Duration::from_std(retention.keep_failed_for).unwrap_or_default();
        let expired: Vec<JobId> = jobs
            .values()
            .filter(|j| {
                j.state == JobState::Failed
                    && j.finished_at.map(|at| at < failed_cutoff).unwrap_or(false)
            })
            .map(|j| j.id)
            .collect();
        for id in expired {
            jobs.remove(&id);
            removed += 1;
        }

        Ok(removed)
    }

    async fn len(&self) -> Result<usize> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .values()
            .filter(|j| matches!(j.state, JobState::Waiting | JobState::Delayed))
            .count())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Redis-backed queue backend for production use.
///
/// Jobs are stored as JSON strings under `{prefix}:job:{id}`; eligibility is a
/// sorted set scored by ready time (with a small priority boost), and the
/// claim is a single Lua script so two workers can never pop the same member.
pub struct RedisQueueBackend {
    client: redis::Client,
    prefix: String,
}

impl RedisQueueBackend {
    /// Create a new Redis queue backend.
    ///
    /// # Arguments
    /// * `client` - A connected Redis client
    /// * `prefix` - Key prefix (e.g. `"rooftop:dispatch"`)
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                DispatchError::queue("Failed to get Redis connection for job queue", e.to_string())
            })
    }

    fn job_key(&self, id: JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn ready_key(&self) -> String {
        format!("{}:ready", self.prefix)
    }

    fn state_key(&self, state: JobState) -> String {
        format!("{}:state:{}", self.prefix, state)
    }

    fn ready_score(job: &Job) -> f64 {
        job.ready_at.timestamp_millis() as f64 - job.priority.score() as f64
    }

    async fn load(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        id: JobId,
    ) -> Result<Option<Job>> {
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.job_key(id))
            .query_async(conn)
            .await
            .map_err(|e| DispatchError::queue("Failed to load job from Redis", e.to_string()))?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn store(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        old_state: JobState,
        job: &Job,
    ) -> Result<()> {
        let serialized = serde_json::to_string(job)?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(self.job_key(job.id))
            .arg(&serialized)
            .ignore()
            .cmd("SMOVE")
            .arg(self.state_key(old_state))
            .arg(self.state_key(job.state))
            .arg(job.id.to_string())
            .ignore();
        if matches!(job.state, JobState::Waiting | JobState::Delayed) {
            pipe.cmd("ZADD")
                .arg(self.ready_key())
                .arg(Self::ready_score(job))
                .arg(job.id.to_string())
                .ignore();
        } else {
            pipe.cmd("ZREM")
                .arg(self.ready_key())
                .arg(job.id.to_string())
                .ignore();
        }
        pipe.query_async::<_, ()>(conn)
            .await
            .map_err(|e| DispatchError::queue("Failed to store job in Redis", e.to_string()))
    }

    async fn delete(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        job: &Job,
    ) -> Result<()> {
        redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.job_key(job.id))
            .ignore()
            .cmd("SREM")
            .arg(self.state_key(job.state))
            .arg(job.id.to_string())
            .ignore()
            .cmd("ZREM")
            .arg(self.ready_key())
            .arg(job.id.to_string())
            .ignore()
            .query_async::<_, ()>(conn)
            .await
            .map_err(|e| DispatchError::queue("Failed to delete job from Redis", e.to_string()))
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn enqueue(&self, job: Job) -> Result<()> {
        let _span = tracing::info_span!("redis_queue_enqueue", queue = %self.prefix);
        let _guard = _span.enter();

        let serialized = serde_json::to_string(&job)?;
        let mut conn = self.get_conn().await?;
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.job_key(job.id))
            .arg(&serialized)
            .ignore()
            .cmd("SADD")
            .arg(self.state_key(job.state))
            .arg(job.id.to_string())
            .ignore()
            .cmd("ZADD")
            .arg(self.ready_key())
            .arg(Self::ready_score(&job))
            .arg(job.id.to_string())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| DispatchError::queue("Failed to enqueue job to Redis", e.to_string()))?;

        tracing::debug!(queue = %self.prefix, job_id = %job.id, "Job enqueued");
        Ok(())
    }

    async fn dequeue_next(&self) -> Result<Option<Job>> {
        let _span = tracing::info_span!("redis_queue_dequeue", queue = %self.prefix);
        let _guard = _span.enter();

        let mut conn = self.get_conn().await?;

        // Atomic claim: a member popped here is invisible to every other
        // worker from this point on.
        let script = redis::Script::new(
            r#"
            local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
            if #ids == 0 then
                return nil
            end
            redis.call('ZREM', KEYS[1], ids[1])
            return ids[1]
            "#,
        );

        let claimed: Option<String> = script
            .key(self.ready_key())
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DispatchError::queue("Failed to dequeue job from Redis", e.to_string()))?;

        let id = match claimed {
            Some(raw) => JobId(raw.parse().map_err(|_| {
                DispatchError::queue("Corrupt job id in ready set", raw.clone())
            })?),
            None => return Ok(None),
        };

        let mut job = match self.load(&mut conn, id).await? {
            Some(job) => job,
            None => return Ok(None),
        };
        let old_state = job.state;
        job.mark_running();
        self.store(&mut conn, old_state, &job).await?;

        tracing::debug!(queue = %self.prefix, job_id = %job.id, "Job dequeued");
        Ok(Some(job))
    }

    async fn ack(&self, id: JobId) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let mut job = self
            .load(&mut conn, id)
            .await?
            .ok_or_else(|| DispatchError::job_not_found(id))?;
        let old_state = job.state;
        job.mark_completed();
        self.store(&mut conn, old_state, &job).await
    }

    async fn nack(&self, id: JobId, error: &DispatchError) -> Result<NackOutcome> {
        let mut conn = self.get_conn().await?;
        let mut job = self
            .load(&mut conn, id)
            .await?
            .ok_or_else(|| DispatchError::job_not_found(id))?;
        let old_state = job.state;

        let outcome = if job.can_retry() {
            let delay = job.next_backoff();
            job.mark_retrying(&error.to_string(), delay);
            NackOutcome::Retried {
                attempt: job.attempts,
                delay,
            }
        } else {
            job.mark_failed(&error.to_string());
            NackOutcome::Exhausted
        };
        self.store(&mut conn, old_state, &job).await?;
        Ok(outcome)
    }

    async fn release(&self, id: JobId) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let mut job = self
            .load(&mut conn, id)
            .await?
            .ok_or_else(|| DispatchError::job_not_found(id))?;
        if job.state != JobState::Active {
            return Err(DispatchError::invalid_transition(format!(
                "cannot release job {} in state {}",
                id, job.state
            )));
        }
        let old_state = job.state;
        job.mark_released();
        self.store(&mut conn, old_state, &job).await
    }

    async fn remove(&self, id: JobId) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let job = self
            .load(&mut conn, id)
            .await?
            .ok_or_else(|| DispatchError::job_not_found(id))?;
        if !job.state.is_removable() {
            return Err(DispatchError::invalid_transition(format!(
                "cannot remove job {} in state {}; it is already claimed",
                id, job.state
            )));
        }
        self.delete(&mut conn, &job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let mut conn = self.get_conn().await?;
        self.load(&mut conn, id).await
    }

    async fn list(&self, states: &[JobState]) -> Result<Vec<Job>> {
        let mut conn = self.get_conn().await?;
        let mut jobs = Vec::new();
        for state in states {
            let ids: Vec<String> = redis::cmd("SMEMBERS")
                .arg(self.state_key(*state))
                .query_async(&mut conn)
                .await
                .map_err(|e| DispatchError::queue("Failed to list jobs from Redis", e.to_string()))?;
            for raw in ids {
                if let Ok(uuid) = raw.parse() {
                    if let Some(job) = self.load(&mut conn, JobId(uuid)).await? {
                        // The state set can briefly lag the job record.
                        if job.state == *state {
                            jobs.push(job);
                        }
                    }
                }
            }
        }
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn set_progress(&self, id: JobId, progress: u8) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let mut job = self
            .load(&mut conn, id)
            .await?
            .ok_or_else(|| DispatchError::job_not_found(id))?;
        job.progress = progress.min(100);
        let state = job.state;
        self.store(&mut conn, state, &job).await
    }

    async fn sweep(&self, retention: &RetentionPolicy) -> Result<usize> {
        let mut conn = self.get_conn().await?;
        let now = Utc::now();
        let mut removed = 0;

        let mut completed = Vec::new();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.state_key(JobState::Completed))
            .query_async(&mut conn)
            .await
            .map_err(|e| DispatchError::queue("Failed to sweep Redis queue", e.to_string()))?;
        for raw in ids {
            if let Ok(uuid) = raw.parse() {
                if let Some(job) = self.load(&mut conn, JobId(uuid)).await? {
                    completed.push(job);
                }
            }
        }
        completed.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        for job in completed.into_iter().skip(retention.keep_completed) {
            self.delete(&mut conn, &job).await?;
            removed += 1;
        }

        let failed_cutoff =
            now - chrono::Duration::from_std(retention.keep_failed_for).unwrap_or_default();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.state_key(JobState::Failed))
            .query_async(&mut conn)
            .await
            .map_err(|e| DispatchError::queue("Failed to sweep Redis queue", e.to_string()))?;
        for raw in ids {
            if let Ok(uuid) = raw.parse() {
                if let Some(job) = self.load(&mut conn, JobId(uuid)).await? {
                    if job.finished_at.map(|at| at < failed_cutoff).unwrap_or(false) {
                        self.delete(&mut conn, &job).await?;
                        removed += 1;
                    }
                }
            }
        }

        Ok(removed)
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.get_conn().await?;
        let length: usize = redis::cmd("ZCARD")
            .arg(self.ready_key())
            .query_async(&mut conn)
            .await
            .map_err(|e| DispatchError::queue("Failed to get Redis queue length", e.to_string()))?;
        Ok(length)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue Facade
// ═══════════════════════════════════════════════════════════════════════════════

/// The main job queue.
pub struct JobQueue {
    backend: Arc<dyn QueueBackend>,
}

impl JobQueue {
    /// Create a new job queue with the given backend.
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self { backend }
    }

    /// Create a new in-memory job queue (for testing).
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryQueueBackend::new()))
    }

    pub async fn enqueue(&self, job: Job) -> Result<()> {
        self.backend.enqueue(job).await
    }

    pub async fn dequeue_next(&self) -> Result<Option<Job>> {
        self.backend.dequeue_next().await
    }

    pub async fn ack(&self, id: JobId) -> Result<()> {
        self.backend.ack(id).await
    }

    pub async fn nack(&self, id: JobId, error: &DispatchError) -> Result<NackOutcome> {
        self.backend.nack(id, error).await
    }

    pub async fn release(&self, id: JobId) -> Result<()> {
        self.backend.release(id).await
    }

    pub async fn remove(&self, id: JobId) -> Result<()> {
        self.backend.remove(id).await
    }

    pub async fn get(&self, id: JobId) -> Result<Option<Job>> {
        self.backend.get(id).await
    }

    pub async fn list(&self, states: &[JobState]) -> Result<Vec<Job>> {
        self.backend.list(states).await
    }

    pub async fn set_progress(&self, id: JobId, progress: u8) -> Result<()> {
        self.backend.set_progress(id, progress).await
    }

    pub async fn sweep(&self, retention: &RetentionPolicy) -> Result<usize> {
        self.backend.sweep(retention).await
    }

    pub async fn len(&self) -> Result<usize> {
        self.backend.len().await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::{EmailJobPayload, EnqueueOptions, JobKind, JobPriority, Recipient};

    fn make_job(opts: EnqueueOptions) -> Job {
        Job::new(
            JobKind::SingleSend,
            EmailJobPayload {
                email_account_id: "acct-1".to_string(),
                recipients: vec![Recipient::new("lead@example.com")],
                subject: "Price drop".to_string(),
                content: "<p>Take a look</p>".to_string(),
                scheduled_for: None,
                campaign_id: None,
            },
            opts,
        )
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_roundtrip() {
        let queue = JobQueue::in_memory();
        let job = make_job(EnqueueOptions::default());
        let id = job.id;

        queue.enqueue(job).await.unwrap();
        let claimed = queue.dequeue_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.state, JobState::Active);
        assert_eq!(claimed.attempts, 1);
    }

    #[tokio::test]
    async fn test_delayed_job_not_eligible() {
        let queue = JobQueue::in_memory();
        let job = make_job(EnqueueOptions {
            delay: Some(Duration::from_secs(300)),
            ..Default::default()
        });
        queue.enqueue(job).await.unwrap();

        assert!(queue.dequeue_next().await.unwrap().is_none());
        let delayed = queue.list(&[JobState::Delayed]).await.unwrap();
        assert_eq!(delayed.len(), 1);
    }

    #[tokio::test]
    async fn test_delayed_job_promoted_after_delay() {
        let queue = JobQueue::in_memory();
        let job = make_job(EnqueueOptions {
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        queue.enqueue(job).await.unwrap();

        assert!(queue.dequeue_next().await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(queue.dequeue_next().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let queue = JobQueue::in_memory();
        let low = make_job(EnqueueOptions {
            priority: JobPriority::Low,
            ..Default::default()
        });
        let high = make_job(EnqueueOptions {
            priority: JobPriority::High,
            ..Default::default()
        });
        let high_id = high.id;

        queue.enqueue(low).await.unwrap();
        queue.enqueue(high).await.unwrap();

        let first = queue.dequeue_next().await.unwrap().unwrap();
        assert_eq!(first.id, high_id);
    }

    #[tokio::test]
    async fn test_ack_completes_job() {
        let queue = JobQueue::in_memory();
        let job = make_job(EnqueueOptions::default());
        let id = job.id;
        queue.enqueue(job).await.unwrap();
        queue.dequeue_next().await.unwrap().unwrap();

        queue.ack(id).await.unwrap();
        let done = queue.get(id).await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_nack_retries_then_exhausts() {
        let queue = JobQueue::in_memory();
        let mut opts = EnqueueOptions::default();
        opts.retry = Some(crate::jobs::job::RetryPolicy {
            max_attempts: 2,
            backoff_base: Duration::from_millis(1),
        });
        let job = make_job(opts);
        let id = job.id;
        queue.enqueue(job).await.unwrap();

        queue.dequeue_next().await.unwrap().unwrap();
        let error = DispatchError::transient_send("boom");
        let outcome = queue.nack(id, &error).await.unwrap();
        assert!(matches!(outcome, NackOutcome::Retried { attempt: 1, .. }));

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.dequeue_next().await.unwrap().unwrap();
        let outcome = queue.nack(id, &error).await.unwrap();
        assert_eq!(outcome, NackOutcome::Exhausted);

        let failed = queue.get(id).await.unwrap().unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.attempts, 2);
        assert!(failed.last_error.is_some());

        // Terminal jobs are never claimed again.
        assert!(queue.dequeue_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_backoff_delay_doubles_across_attempts() {
        let queue = JobQueue::in_memory();
        let job = make_job(EnqueueOptions::default());
        let id = job.id;
        queue.enqueue(job).await.unwrap();

        queue.dequeue_next().await.unwrap().unwrap();
        let error = DispatchError::transient_send("flaky");
        match queue.nack(id, &error).await.unwrap() {
            NackOutcome::Retried { delay, .. } => {
                assert_eq!(delay, Duration::from_millis(1000))
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        // Force eligibility for the next claim rather than waiting a second.
        {
            let mut job = queue.get(id).await.unwrap().unwrap();
            job.ready_at = Utc::now();
            queue.enqueue(job).await.unwrap();
        }
        queue.dequeue_next().await.unwrap().unwrap();
        match queue.nack(id, &error).await.unwrap() {
            NackOutcome::Retried { delay, .. } => {
                assert_eq!(delay, Duration::from_millis(2000))
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_release_reverts_attempt_count() {
        let queue = JobQueue::in_memory();
        let job = make_job(EnqueueOptions::default());
        let id = job.id;
        queue.enqueue(job).await.unwrap();

        let claimed = queue.dequeue_next().await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 1);

        queue.release(id).await.unwrap();
        let released = queue.get(id).await.unwrap().unwrap();
        assert_eq!(released.state, JobState::Waiting);
        assert_eq!(released.attempts, 0);
    }

    #[tokio::test]
    async fn test_remove_only_while_unclaimed() {
        let queue = JobQueue::in_memory();
        let waiting = make_job(EnqueueOptions::default());
        let waiting_id = waiting.id;
        queue.enqueue(waiting).await.unwrap();
        queue.remove(waiting_id).await.unwrap();
        assert!(queue.get(waiting_id).await.unwrap().is_none());

        let active = make_job(EnqueueOptions::default());
        let active_id = active.id;
        queue.enqueue(active).await.unwrap();
        queue.dequeue_next().await.unwrap().unwrap();
        assert!(queue.remove(active_id).await.is_err());
    }

    #[tokio::test]
    async fn test_retention_sweep() {
        let queue = JobQueue::in_memory();
        for _ in 0..5 {
            let job = make_job(EnqueueOptions::default());
            let id = job.id;
            queue.enqueue(job).await.unwrap();
            queue.dequeue_next().await.unwrap().unwrap();
            queue.ack(id).await.unwrap();
        }

        let retention = RetentionPolicy {
            keep_completed: 2,
            ..Default::default()
        };
        let removed = queue.sweep(&retention).await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(queue.list(&[JobState::Completed]).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_len_counts_pending_only() {
        let queue = JobQueue::in_memory();
        queue.enqueue(make_job(EnqueueOptions::default())).await.unwrap();
        queue
            .enqueue(make_job(EnqueueOptions {
                delay: Some(Duration::from_secs(60)),
                ..Default::default()
            }))
            .await
            .unwrap();
        assert_eq!(queue.len().await.unwrap(), 2);

        queue.dequeue_next().await.unwrap().unwrap();
        assert_eq!(queue.len().await.unwrap(), 1);
    }
}
