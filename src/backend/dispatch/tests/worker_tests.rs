//! Worker pool tests: lease exclusivity, lock-conflict handling, rate-limit
//! gating, and graceful shutdown.

use rooftop_dispatch::campaign::{CampaignStore, InMemoryCampaignStore, StatusAggregator};
use rooftop_dispatch::config::DispatchConfig;
use rooftop_dispatch::jobs::{
    EmailJobPayload, JobState, Recipient, WorkerPoolConfig,
};
use rooftop_dispatch::lock::{InMemoryLockManager, LockManager};
use rooftop_dispatch::mailer::{InMemoryAccountStore, MockTransport, StaticTransportFactory};
use rooftop_dispatch::processor::SendConfig;
use rooftop_dispatch::service::DispatchService;
use rooftop_dispatch::throttle::{FixedWindowLimiter, RateLimitConfig, RateLimiter, Unlimited};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn fast_config(concurrency: usize) -> DispatchConfig {
    DispatchConfig {
        worker: WorkerPoolConfig {
            concurrency,
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        },
        sending: SendConfig {
            send_timeout: Duration::from_millis(200),
            batch_size: 10,
            batch_pause: Duration::from_millis(5),
        },
        ..Default::default()
    }
}

fn payload(recipients: usize) -> EmailJobPayload {
    EmailJobPayload {
        email_account_id: "acct-1".to_string(),
        recipients: (0..recipients)
            .map(|i| Recipient::new(format!("lead{}@example.com", i)))
            .collect(),
        subject: "Just listed".to_string(),
        content: "<p>3 bed, 2 bath</p>".to_string(),
        scheduled_for: None,
        campaign_id: None,
    }
}

fn accounts() -> Arc<InMemoryAccountStore> {
    let store = Arc::new(InMemoryAccountStore::new());
    store.insert_simple("acct-1", "listings@rooftop.example");
    store
}

async fn wait_until<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

// ============================================================================
// Lease Exclusivity (two workers, one job)
// ============================================================================

#[tokio::test]
async fn test_second_worker_observes_lock_failure_and_does_not_process() {
    let locks: Arc<InMemoryLockManager> = Arc::new(InMemoryLockManager::new());
    let transport = Arc::new(MockTransport::new());

    let mut service = DispatchService::builder(fast_config(2))
        .lock_manager(locks.clone())
        .rate_limiter(Arc::new(Unlimited))
        .account_store(accounts())
        .transport_factory(Arc::new(StaticTransportFactory(transport.clone())))
        .build();

    let id = service.add_email_job(payload(1)).await.unwrap();

    // Another worker already holds the lease for this job.
    let foreign_token = locks.acquire(id, Duration::from_secs(30)).await.unwrap();

    service.start();
    let saw_conflict = wait_until(
        || {
            service
                .worker_stats()
                .map(|s| s.lock_conflicts() >= 1)
                .unwrap_or(false)
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(saw_conflict, "expected a lock conflict to be recorded");

    // Stop polling so the job is quiescent, then check the claim was
    // released without processing or charging an attempt.
    service.shutdown().await;
    let job = service.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(job.attempts, 0);
    assert_eq!(transport.sent_count(), 0);

    // Once the foreign lease is gone the job is processed normally.
    locks.release(id, &foreign_token).await.unwrap();
    service.start();
    let completed = wait_until(
        || transport.sent_count() == 1,
        Duration::from_secs(2),
    )
    .await;
    assert!(completed, "expected the job to complete after lease release");
    service.shutdown().await;

    let job = service.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 1);
}

// ============================================================================
// Rate Limiting
// ============================================================================

#[tokio::test]
async fn test_claims_are_bounded_by_the_shared_limiter() {
    let transport = Arc::new(MockTransport::new());
    let limiter: Arc<dyn RateLimiter> = Arc::new(FixedWindowLimiter::new(RateLimitConfig {
        max_claims: 2,
        window: Duration::from_secs(30),
    }));

    let mut service = DispatchService::builder(fast_config(4))
        .rate_limiter(limiter)
        .account_store(accounts())
        .transport_factory(Arc::new(StaticTransportFactory(transport.clone())))
        .build();

    for _ in 0..5 {
        service.add_email_job(payload(1)).await.unwrap();
    }

    service.start();
    wait_until(|| transport.sent_count() >= 2, Duration::from_secs(2)).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Only two claims fit in the window, across all four workers.
    assert_eq!(transport.sent_count(), 2);
    let waiting = service.list_jobs(&[JobState::Waiting]).await.unwrap();
    assert_eq!(waiting.len(), 3);

    service.shutdown().await;
}

// ============================================================================
// Pool Lifecycle
// ============================================================================

#[tokio::test]
async fn test_pool_processes_many_jobs_concurrently() {
    let transport = Arc::new(MockTransport::new());
    let mut service = DispatchService::builder(fast_config(5))
        .rate_limiter(Arc::new(Unlimited))
        .account_store(accounts())
        .transport_factory(Arc::new(StaticTransportFactory(transport.clone())))
        .build();

    for _ in 0..20 {
        service.add_email_job(payload(1)).await.unwrap();
    }
    service.start();

    let all_done = wait_until(
        || {
            service
                .worker_stats()
                .map(|s| s.succeeded() == 20)
                .unwrap_or(false)
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(all_done);
    assert_eq!(transport.sent_count(), 20);

    let stats = service.worker_stats().unwrap();
    assert_eq!(stats.failed(), 0);

    service.shutdown().await;
    assert_eq!(
        service
            .list_jobs(&[JobState::Completed])
            .await
            .unwrap()
            .len(),
        20
    );
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_stops_polling() {
    let transport = Arc::new(MockTransport::new());
    let mut service = DispatchService::builder(fast_config(2))
        .rate_limiter(Arc::new(Unlimited))
        .account_store(accounts())
        .transport_factory(Arc::new(StaticTransportFactory(transport.clone())))
        .build();

    service.start();
    service.shutdown().await;
    service.shutdown().await;

    // Jobs enqueued after shutdown stay queued.
    service.add_email_job(payload(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.sent_count(), 0);
    assert_eq!(service.list_jobs(&[JobState::Waiting]).await.unwrap().len(), 1);
}

// ============================================================================
// Aggregator wiring (terminal failure)
// ============================================================================

#[tokio::test]
async fn test_exhausted_job_marks_campaign_failed() {
    let transport = Arc::new(MockTransport::new());
    transport.fail_for("lead0@example.com");

    let campaigns = Arc::new(InMemoryCampaignStore::new());
    let campaign_id = campaigns.insert("camp-exhaust", 1);

    let mut config = fast_config(1);
    config.retry.max_attempts = 2;
    config.retry.backoff_base = Duration::from_millis(20);

    let mut service = DispatchService::builder(config)
        .rate_limiter(Arc::new(Unlimited))
        .account_store(accounts())
        .transport_factory(Arc::new(StaticTransportFactory(transport.clone())))
        .campaign_store(campaigns.clone())
        .build();

    let mut failing = payload(1);
    failing.campaign_id = Some(campaign_id.clone());
    let id = service.add_email_job(failing).await.unwrap();

    service.start();
    let failed = wait_until(
        || {
            service
                .worker_stats()
                .map(|s| s.failed() >= 1)
                .unwrap_or(false)
        },
        Duration::from_secs(3),
    )
    .await;
    assert!(failed);
    service.shutdown().await;

    let job = service.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 2);

    let aggregator = StatusAggregator::new(campaigns.clone());
    assert!(!aggregator.is_cancelled(&campaign_id).await);
    let campaign = campaigns
        .get(&campaign_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        campaign.status,
        rooftop_dispatch::campaign::CampaignStatus::Failed
    );
}
