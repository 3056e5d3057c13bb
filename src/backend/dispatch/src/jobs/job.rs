//! Job definitions for the dispatch engine.
//!
//! This module provides the core abstractions for email-dispatch jobs:
//!
//! - **Job**: The queued unit of work, tracked through a state machine
//! - **JobState**: Enumeration of possible job states
//! - **EmailJobPayload**: The wire shape enqueued by the CRUD layer
//! - **RetryPolicy**: Exponential backoff configuration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::campaign::CampaignId;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Kind and State
// ═══════════════════════════════════════════════════════════════════════════════

/// Kind of dispatch work a job carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// One email to one recipient
    SingleSend,
    /// A batched campaign send to many recipients
    BulkSend,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleSend => write!(f, "single_send"),
            Self::BulkSend => write!(f, "bulk_send"),
        }
    }
}

/// State of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Eligible for claiming once its ready time has passed
    Waiting,
    /// Scheduled for the future; promoted to Waiting when the delay elapses
    Delayed,
    /// Claimed by a worker and being processed
    Active,
    /// Finished successfully
    Completed,
    /// Failed after exhausting all retry attempts
    Failed,
}

impl JobState {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Check if a job in this state may still be removed by callers.
    pub fn is_removable(&self) -> bool {
        matches!(self, Self::Waiting | Self::Delayed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Delayed => write!(f, "delayed"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Priority
// ═══════════════════════════════════════════════════════════════════════════════

/// Priority level for jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    /// Lowest priority - processed when nothing else is eligible
    Low,
    /// Normal priority - default for most jobs
    Normal,
    /// High priority - processed before normal jobs
    High,
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl JobPriority {
    /// Get the numeric value for queue ordering.
    pub fn score(&self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Normal => 100,
            Self::High => 200,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Payload
// ═══════════════════════════════════════════════════════════════════════════════

/// A single recipient of an email job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Destination address
    pub email: String,
    /// Per-recipient template variables
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl Recipient {
    /// Create a recipient with no variables.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            variables: HashMap::new(),
        }
    }

    /// Add a template variable.
    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }
}

/// The wire shape enqueued by the CRUD layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailJobPayload {
    /// Sending account used to construct the transport
    pub email_account_id: String,
    /// Ordered recipient list (single-send jobs use the first entry)
    pub recipients: Vec<Recipient>,
    /// Message subject
    pub subject: String,
    /// HTML content, rendered per recipient
    pub content: String,
    /// Optional future send time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Owning campaign for aggregate write-back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<CampaignId>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for job retry behavior with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of execution attempts
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay; the delay strictly doubles per failed attempt
    #[serde(with = "humantime_serde", default = "default_backoff_base")]
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
        }
    }
}

impl RetryPolicy {
    /// Calculate the delay after a failed attempt (1-indexed).
    ///
    /// Attempt 1 waits `backoff_base`, attempt 2 waits twice that, and so on.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base.saturating_mul(1u32 << exponent)
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(1000)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Enqueue Options
// ═══════════════════════════════════════════════════════════════════════════════

/// Options applied when enqueuing a job.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Delay before the job becomes eligible
    pub delay: Option<Duration>,
    /// Priority for queue ordering
    pub priority: JobPriority,
    /// Retry policy override (defaults to the engine-wide policy)
    pub retry: Option<RetryPolicy>,
}

impl EnqueueOptions {
    /// Compute the delay for a requested send time: `max(0, scheduled_for - now)`.
    pub fn delay_until(scheduled_for: DateTime<Utc>) -> Duration {
        (scheduled_for - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A unit of dispatch work tracked through the queue state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,
    /// What kind of work this job carries
    pub kind: JobKind,
    /// The enqueued payload
    pub payload: EmailJobPayload,
    /// Current state
    pub state: JobState,
    /// Priority for queue ordering
    pub priority: JobPriority,
    /// Number of execution attempts so far
    pub attempts: u32,
    /// Maximum attempts allowed
    pub max_attempts: u32,
    /// Base retry delay (doubles per failed attempt)
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    /// Progress percentage (0-100)
    pub progress: u8,
    /// When the job was created
    pub created_at: DateTime<Utc>,
    /// When the job becomes eligible for claiming
    pub ready_at: DateTime<Utc>,
    /// When the current/last attempt started
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
    /// Last error message (if any attempt failed)
    pub last_error: Option<String>,
}

impl Job {
    /// Create a new job from a payload and enqueue options.
    pub fn new(kind: JobKind, payload: EmailJobPayload, opts: EnqueueOptions) -> Self {
        let now = Utc::now();
        let delay = opts.delay.unwrap_or(Duration::ZERO);
        let retry = opts.retry.unwrap_or_default();
        let (state, ready_at) = if delay.is_zero() {
            (JobState::Waiting, now)
        } else {
            (
                JobState::Delayed,
                now + chrono::Duration::from_std(delay).unwrap_or_default(),
            )
        };

        Self {
            id: JobId::new(),
            kind,
            payload,
            state,
            priority: opts.priority,
            attempts: 0,
            max_attempts: retry.max_attempts,
            backoff_base: retry.backoff_base,
            progress: 0,
            created_at: now,
            ready_at,
            started_at: None,
            finished_at: None,
            last_error: None,
        }
    }

    /// Number of recipients in the payload.
    pub fn recipient_count(&self) -> usize {
        self.payload.recipients.len()
    }

    /// Delay before the next retry, derived from the current attempt count.
    pub fn next_backoff(&self) -> Duration {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_base: self.backoff_base,
        }
        .delay_for_attempt(self.attempts)
    }

    /// Check if the job may be retried after another failure.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Mark as claimed by a worker.
    pub fn mark_running(&mut self) {
        self.state = JobState::Active;
        self.started_at = Some(Utc::now());
        self.attempts += 1;
    }

    /// Revert an unprocessed claim (lock acquisition failed).
    pub fn mark_released(&mut self) {
        self.state = JobState::Waiting;
        self.started_at = None;
        self.attempts = self.attempts.saturating_sub(1);
    }

    /// Mark as completed.
    pub fn mark_completed(&mut self) {
        self.state = JobState::Completed;
        self.progress = 100;
        self.finished_at = Some(Utc::now());
    }

    /// Return to Waiting for a retry after the given delay.
    pub fn mark_retrying(&mut self, error: &str, delay: Duration) {
        self.state = JobState::Waiting;
        self.last_error = Some(error.to_string());
        self.ready_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
    }

    /// Mark as terminally failed.
    pub fn mark_failed(&mut self, error: &str) {
        self.state = JobState::Failed;
        self.last_error = Some(error.to_string());
        self.finished_at = Some(Utc::now());
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Events
// ═══════════════════════════════════════════════════════════════════════════════

/// Notification emitted by the worker pool and processors.
///
/// Consumed by callers through an explicit channel rather than ambient global
/// event emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum JobEvent {
    /// A job was enqueued
    Enqueued { job_id: JobId, kind: JobKind },
    /// A processor reported progress
    Progress { job_id: JobId, percent: u8 },
    /// A job completed successfully
    Completed { job_id: JobId },
    /// A job failed and was scheduled for retry
    Retried {
        job_id: JobId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// A job failed terminally
    Failed { job_id: JobId, error: String },
}

/// Sender half of the job-event notification channel.
pub type JobEventSender = tokio::sync::mpsc::UnboundedSender<JobEvent>;

/// Receiver half of the job-event notification channel.
pub type JobEventReceiver = tokio::sync::mpsc::UnboundedReceiver<JobEvent>;

/// Create a job-event notification channel.
pub fn event_channel() -> (JobEventSender, JobEventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
