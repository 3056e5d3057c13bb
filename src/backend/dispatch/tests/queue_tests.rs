//! Queue behavior tests: eligibility, ordering, retry accounting, and the
//! claim/release/remove state machine.

use rooftop_dispatch::error::DispatchError;
use rooftop_dispatch::jobs::{
    EmailJobPayload, EnqueueOptions, Job, JobKind, JobPriority, JobQueue, JobState, NackOutcome,
    Recipient, RetentionPolicy, RetryPolicy,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn payload(recipients: usize) -> EmailJobPayload {
    EmailJobPayload {
        email_account_id: "acct-1".to_string(),
        recipients: (0..recipients)
            .map(|i| Recipient::new(format!("lead{}@example.com", i)))
            .collect(),
        subject: "Market update".to_string(),
        content: "<p>This month in listings</p>".to_string(),
        scheduled_for: None,
        campaign_id: None,
    }
}

fn job() -> Job {
    Job::new(JobKind::SingleSend, payload(1), EnqueueOptions::default())
}

// ============================================================================
// Claim Semantics
// ============================================================================

#[tokio::test]
async fn test_concurrent_workers_claim_distinct_jobs() {
    let queue = Arc::new(JobQueue::in_memory());
    for _ in 0..10 {
        queue.enqueue(job()).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..10 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            queue.dequeue_next().await.unwrap().map(|j| j.id)
        }));
    }

    let mut claimed = HashSet::new();
    for handle in handles {
        if let Some(id) = handle.await.unwrap() {
            // No job may be handed to two workers.
            assert!(claimed.insert(id));
        }
    }
    assert_eq!(claimed.len(), 10);
}

#[tokio::test]
async fn test_active_job_is_not_claimable_again() {
    let queue = JobQueue::in_memory();
    queue.enqueue(job()).await.unwrap();

    assert!(queue.dequeue_next().await.unwrap().is_some());
    assert!(queue.dequeue_next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_claim_increments_attempts_release_reverts() {
    let queue = JobQueue::in_memory();
    let enqueued = job();
    let id = enqueued.id;
    queue.enqueue(enqueued).await.unwrap();

    let claimed = queue.dequeue_next().await.unwrap().unwrap();
    assert_eq!(claimed.attempts, 1);
    assert_eq!(claimed.state, JobState::Active);

    queue.release(id).await.unwrap();
    let released = queue.get(id).await.unwrap().unwrap();
    assert_eq!(released.attempts, 0);
    assert_eq!(released.state, JobState::Waiting);

    // The released job is immediately claimable again.
    let reclaimed = queue.dequeue_next().await.unwrap().unwrap();
    assert_eq!(reclaimed.id, id);
    assert_eq!(reclaimed.attempts, 1);
}

// ============================================================================
// Retry Policy
// ============================================================================

#[tokio::test]
async fn test_attempts_never_exceed_max() {
    let queue = JobQueue::in_memory();
    let enqueued = Job::new(
        JobKind::SingleSend,
        payload(1),
        EnqueueOptions {
            retry: Some(RetryPolicy {
                max_attempts: 3,
                backoff_base: Duration::from_millis(1),
            }),
            ..Default::default()
        },
    );
    let id = enqueued.id;
    queue.enqueue(enqueued).await.unwrap();

    let error = DispatchError::transient_send("relay down");
    let mut outcomes = Vec::new();
    loop {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let Some(claimed) = queue.dequeue_next().await.unwrap() else {
            let current = queue.get(id).await.unwrap().unwrap();
            if current.state == JobState::Failed {
                break;
            }
            continue;
        };
        assert!(claimed.attempts <= claimed.max_attempts);
        outcomes.push(queue.nack(id, &error).await.unwrap());
    }

    assert_eq!(outcomes.len(), 3);
    assert!(matches!(outcomes[0], NackOutcome::Retried { attempt: 1, .. }));
    assert!(matches!(outcomes[1], NackOutcome::Retried { attempt: 2, .. }));
    assert_eq!(outcomes[2], NackOutcome::Exhausted);

    let failed = queue.get(id).await.unwrap().unwrap();
    assert_eq!(failed.attempts, 3);
    assert_eq!(failed.state, JobState::Failed);

    // A terminally failed job is never claimed again.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(queue.dequeue_next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_backoff_sequence_doubles() {
    let policy = RetryPolicy {
        max_attempts: 3,
        backoff_base: Duration::from_millis(1000),
    };
    assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
    assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
    assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
}

#[tokio::test]
async fn test_retried_job_waits_out_its_backoff() {
    let queue = JobQueue::in_memory();
    let enqueued = Job::new(
        JobKind::SingleSend,
        payload(1),
        EnqueueOptions {
            retry: Some(RetryPolicy {
                max_attempts: 3,
                backoff_base: Duration::from_millis(60),
            }),
            ..Default::default()
        },
    );
    let id = enqueued.id;
    queue.enqueue(enqueued).await.unwrap();

    queue.dequeue_next().await.unwrap().unwrap();
    queue
        .nack(id, &DispatchError::transient_send("flaky"))
        .await
        .unwrap();

    // Not yet eligible: the 60ms backoff has not elapsed.
    assert!(queue.dequeue_next().await.unwrap().is_none());
    tokio::time::sleep(Duration::from_millis(90)).await;
    assert!(queue.dequeue_next().await.unwrap().is_some());
}

// ============================================================================
// Scheduling and Ordering
// ============================================================================

#[tokio::test]
async fn test_scheduled_job_flows_delayed_to_waiting() {
    let queue = JobQueue::in_memory();
    let enqueued = Job::new(
        JobKind::BulkSend,
        payload(3),
        EnqueueOptions {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        },
    );
    let id = enqueued.id;
    queue.enqueue(enqueued).await.unwrap();

    assert_eq!(
        queue.get(id).await.unwrap().unwrap().state,
        JobState::Delayed
    );
    assert!(queue.dequeue_next().await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(80)).await;
    let claimed = queue.dequeue_next().await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
}

#[tokio::test]
async fn test_high_priority_claims_first() {
    let queue = JobQueue::in_memory();
    let normal = job();
    queue.enqueue(normal).await.unwrap();

    let high = Job::new(
        JobKind::SingleSend,
        payload(1),
        EnqueueOptions {
            priority: JobPriority::High,
            ..Default::default()
        },
    );
    let high_id = high.id;
    queue.enqueue(high).await.unwrap();

    assert_eq!(queue.dequeue_next().await.unwrap().unwrap().id, high_id);
}

// ============================================================================
// Removal and Retention
// ============================================================================

#[tokio::test]
async fn test_remove_rejected_once_claimed() {
    let queue = JobQueue::in_memory();
    let enqueued = job();
    let id = enqueued.id;
    queue.enqueue(enqueued).await.unwrap();
    queue.dequeue_next().await.unwrap().unwrap();

    assert!(queue.remove(id).await.is_err());

    queue.ack(id).await.unwrap();
    // Completed jobs are reaped by retention, not removed by callers.
    assert!(queue.remove(id).await.is_err());
}

#[tokio::test]
async fn test_retention_keeps_newest_completed() {
    let queue = JobQueue::in_memory();
    let mut ids = Vec::new();
    for _ in 0..4 {
        let enqueued = job();
        ids.push(enqueued.id);
        queue.enqueue(enqueued).await.unwrap();
        let claimed = queue.dequeue_next().await.unwrap().unwrap();
        queue.ack(claimed.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let removed = queue
        .sweep(&RetentionPolicy {
            keep_completed: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(removed, 3);

    let remaining = queue.list(&[JobState::Completed]).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, *ids.last().unwrap());
}

#[tokio::test]
async fn test_sweep_leaves_pending_jobs_alone() {
    let queue = JobQueue::in_memory();
    queue.enqueue(job()).await.unwrap();
    queue
        .enqueue(Job::new(
            JobKind::SingleSend,
            payload(1),
            EnqueueOptions {
                delay: Some(Duration::from_secs(60)),
                ..Default::default()
            },
        ))
        .await
        .unwrap();

    let removed = queue
        .sweep(&RetentionPolicy {
            keep_completed: 0,
            keep_failed_for: Duration::ZERO,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(removed, 0);
    assert_eq!(queue.len().await.unwrap(), 2);
}
