//! # Rooftop Dispatch
//!
//! The asynchronous email-campaign dispatch engine of the Rooftop CRM.
//!
//! ## Architecture
//!
//! - **Durable Queue**: jobs with state, delay, priority, and retry metadata
//! - **Worker Pool**: fixed-size concurrent executors over one shared queue
//! - **Lock Manager**: renewable per-job leases preventing double-processing
//! - **Rate Limiter**: process-wide token gate bounding claim throughput
//! - **Processors**: single-send and batched bulk-send with partial-failure
//!   accounting
//! - **Status Aggregator**: best-effort campaign write-back
//!
//! The CRUD layer enqueues work through [`service::DispatchService`] and
//! reads back status by polling jobs and campaigns; send outcomes never
//! surface through a blocking response.

pub mod campaign;
pub mod config;
pub mod error;
pub mod jobs;
pub mod lock;
pub mod mailer;
pub mod processor;
pub mod service;
pub mod telemetry;
pub mod throttle;

pub use error::{DispatchError, ErrorCode, ErrorContext, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::campaign::{
        Campaign, CampaignId, CampaignStatus, CampaignStore, InMemoryCampaignStore,
        StatusAggregator, StatusUpdate,
    };
    pub use crate::config::DispatchConfig;
    pub use crate::error::{DispatchError, ErrorCode, ErrorSeverity, Result};
    pub use crate::jobs::{
        event_channel, EmailJobPayload, EnqueueOptions, Job, JobEvent, JobEventReceiver,
        JobEventSender, JobId, JobKind, JobPriority, JobQueue, JobState, NackOutcome,
        QueueBackend, Recipient, RetentionPolicy, RetryPolicy, WorkerEnv, WorkerHandle,
        WorkerPool, WorkerPoolConfig, WorkerStats,
    };
    pub use crate::lock::{
        InMemoryLockManager, LeaseHandle, LockConfig, LockManager, LockToken, RedisLockManager,
    };
    pub use crate::mailer::{
        AccountStore, EmailAccount, InMemoryAccountStore, MockTransport, PassthroughRenderer,
        SmtpCredentials, SmtpTransportFactory, StaticTransportFactory, TemplateRenderer,
        TlsMode, Transport, TransportFactory,
    };
    pub use crate::processor::{
        BulkSendProcessor, JobContext, JobProcessor, ProcessorSet, SendConfig,
        SingleSendProcessor,
    };
    pub use crate::service::{DispatchService, DispatchServiceBuilder};
    pub use crate::throttle::{FixedWindowLimiter, RateLimitConfig, RateLimiter, Unlimited};
}
