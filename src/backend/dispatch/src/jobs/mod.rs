//! Background job system for the dispatch engine.
//!
//! This module provides the durable queue and the worker pool:
//!
//! - **Job model**: state machine, payload wire shape, retry policy
//! - **Queue**: in-memory and Redis backends behind one trait
//! - **Worker**: fixed-size concurrent executors with graceful shutdown
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        Dispatch Job System                           │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────┐    ┌───────────┐    ┌───────────┐    ┌─────────────┐  │
//! │  │ Service  │───▶│   Queue   │───▶│  Worker   │───▶│  Processor  │  │
//! │  │ (enqueue)│    │ (durable) │    │  (pool)   │    │ (send work) │  │
//! │  └──────────┘    └───────────┘    └───────────┘    └─────────────┘  │
//! │                        ▲               │ lease            │          │
//! │                        │ ack/nack      ▼                  ▼          │
//! │                        └────────── Lock Manager      Aggregator      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod job;
pub mod queue;
pub mod worker;

pub use job::{
    event_channel, EmailJobPayload, EnqueueOptions, Job, JobEvent, JobEventReceiver,
    JobEventSender, JobId, JobKind, JobPriority, JobState, Recipient, RetryPolicy,
};
pub use queue::{
    InMemoryQueueBackend, JobQueue, NackOutcome, QueueBackend, RedisQueueBackend, RetentionPolicy,
};
pub use worker::{WorkerEnv, WorkerHandle, WorkerPool, WorkerPoolConfig, WorkerStats};
