//! Per-job distributed locking.
//!
//! A lease grants one worker exclusive ownership of a job for a bounded TTL;
//! the owner must renew before the renewal threshold elapses or the lease may
//! be reclaimed. Acquire/renew/release are atomic compare-and-swap operations
//! on the (token, expiry) pair so two workers can never both believe they
//! hold the same lease.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::jobs::JobId;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Lease configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// How long a lease lasts without renewal
    #[serde(with = "humantime_serde", default = "default_ttl")]
    pub ttl: Duration,
    /// Renew once this much of the TTL remains
    #[serde(with = "humantime_serde", default = "default_renew_threshold")]
    pub renew_threshold: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            renew_threshold: default_renew_threshold(),
        }
    }
}

fn default_ttl() -> Duration {
    Duration::from_millis(30_000)
}

fn default_renew_threshold() -> Duration {
    Duration::from_millis(15_000)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Lock Token
// ═══════════════════════════════════════════════════════════════════════════════

/// Opaque proof of lease ownership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken(Uuid);

impl LockToken {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Manager Contract
// ═══════════════════════════════════════════════════════════════════════════════

/// Trait for lease managers.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquire a lease over a job for `ttl`.
    ///
    /// Fails with `LockUnavailable` if another worker holds a non-expired
    /// lease.
    async fn acquire(&self, job_id: JobId, ttl: Duration) -> Result<LockToken>;

    /// Extend an owned lease by `ttl` from now.
    ///
    /// Fails with `LockExpired` when the lease was lost (expired or
    /// reclaimed); the caller must stop assuming exclusive ownership.
    async fn renew(&self, job_id: JobId, token: &LockToken, ttl: Duration) -> Result<()>;

    /// Release an owned lease. Releasing a lease that was already lost is
    /// a no-op.
    async fn release(&self, job_id: JobId, token: &LockToken) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Manager
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct Lease {
    token: LockToken,
    expires_at: Instant,
}

/// In-memory lease manager for testing and single-process deployments.
///
/// Each map entry is mutated under its shard lock, which makes the
/// compare-and-swap on (token, expiry) atomic.
#[derive(Default)]
pub struct InMemoryLockManager {
    leases: DashMap<JobId, Lease>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire(&self, job_id: JobId, ttl: Duration) -> Result<LockToken> {
        let now = Instant::now();
        let token = LockToken::new();

        match self.leases.entry(job_id) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if entry.get().expires_at > now {
                    return Err(DispatchError::lock_unavailable(format!(
                        "job {} is leased to another worker",
                        job_id
                    )));
                }
                entry.insert(Lease {
                    token: token.clone(),
                    expires_at: now + ttl,
                });
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Lease {
                    token: token.clone(),
                    expires_at: now + ttl,
                });
            }
        }

        tracing::debug!(job_id = %job_id, token = %token, "Lease acquired");
        Ok(token)
    }

    async fn renew(&self, job_id: JobId, token: &LockToken, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        match self.leases.get_mut(&job_id) {
            Some(mut lease) if lease.token == *token && lease.expires_at > now => {
                lease.expires_at = now + ttl;
                Ok(())
            }
            _ => Err(DispatchError::lock_expired(format!(
                "lease for job {} was lost",
                job_id
            ))),
        }
    }

    async fn release(&self, job_id: JobId, token: &LockToken) -> Result<()> {
        self.leases
            .remove_if(&job_id, |_, lease| lease.token == *token);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Manager
// ═══════════════════════════════════════════════════════════════════════════════

/// Redis-backed lease manager for multi-process deployments.
///
/// Acquire is `SET key token NX PX ttl`; renew and release compare the stored
/// token inside a Lua script so a stale worker can never extend or drop a
/// lease it no longer owns.
pub struct RedisLockManager {
    client: redis::Client,
    prefix: String,
}

impl RedisLockManager {
    /// Create a new Redis lease manager.
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    fn lease_key(&self, job_id: JobId) -> String {
        format!("{}:lease:{}", self.prefix, job_id)
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                DispatchError::queue("Failed to get Redis connection for lease", e.to_string())
            })
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire(&self, job_id: JobId, ttl: Duration) -> Result<LockToken> {
        let token = LockToken::new();
        let mut conn = self.get_conn().await?;

        let set: Option<String> = redis::cmd("SET")
            .arg(self.lease_key(job_id))
            .arg(token.to_string())
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| DispatchError::queue("Failed to acquire Redis lease", e.to_string()))?;

        match set {
            Some(_) => Ok(token),
            None => Err(DispatchError::lock_unavailable(format!(
                "job {} is leased to another worker",
                job_id
            ))),
        }
    }

    async fn renew(&self, job_id: JobId, token: &LockToken, ttl: Duration) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let script = redis::Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('PEXPIRE', KEYS[1], ARGV[2])
            end
            return 0
            "#,
        );

        let renewed: i64 = script
            .key(self.lease_key(job_id))
            .arg(token.to_string())
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DispatchError::queue("Failed to renew Redis lease", e.to_string()))?;

        if renewed == 1 {
            Ok(())
        } else {
            Err(DispatchError::lock_expired(format!(
                "lease for job {} was lost",
                job_id
            )))
        }
    }

    async fn release(&self, job_id: JobId, token: &LockToken) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let script = redis::Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            end
            return 0
            "#,
        );

        let _: i64 = script
            .key(self.lease_key(job_id))
            .arg(token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DispatchError::queue("Failed to release Redis lease", e.to_string()))?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Lease Handle
// ═══════════════════════════════════════════════════════════════════════════════

/// A worker's handle over an acquired lease.
///
/// Processors renew through this at batch boundaries; renewal failure
/// surfaces `LockExpired` so the in-flight work can stop instead of racing a
/// second claimant.
pub struct LeaseHandle {
    manager: Arc<dyn LockManager>,
    job_id: JobId,
    token: LockToken,
    ttl: Duration,
}

impl LeaseHandle {
    pub fn new(
        manager: Arc<dyn LockManager>,
        job_id: JobId,
        token: LockToken,
        ttl: Duration,
    ) -> Self {
        Self {
            manager,
            job_id,
            token,
            ttl,
        }
    }

    /// The leased job.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Extend the lease by the configured TTL.
    pub async fn renew(&self) -> Result<()> {
        self.manager.renew(self.job_id, &self.token, self.ttl).await
    }

    /// Release the lease.
    pub async fn release(&self) -> Result<()> {
        self.manager.release(self.job_id, &self.token).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let manager = InMemoryLockManager::new();
        let job_id = JobId::new();

        let token = manager.acquire(job_id, Duration::from_secs(30)).await.unwrap();
        let second = manager.acquire(job_id, Duration::from_secs(30)).await;
        assert!(second.is_err());
        assert_eq!(second.unwrap_err().code(), ErrorCode::LockUnavailable);

        manager.release(job_id, &token).await.unwrap();
        manager.acquire(job_id, Duration::from_secs(30)).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let manager = InMemoryLockManager::new();
        let job_id = JobId::new();

        manager.acquire(job_id, Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The first lease has expired; a second worker may reclaim it.
        manager.acquire(job_id, Duration::from_secs(30)).await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_extends_owned_lease() {
        let manager = InMemoryLockManager::new();
        let job_id = JobId::new();

        let token = manager.acquire(job_id, Duration::from_millis(50)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.renew(job_id, &token, Duration::from_secs(30)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        // Would have expired without the renewal.
        let second = manager.acquire(job_id, Duration::from_secs(30)).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_renew_fails_after_expiry() {
        let manager = InMemoryLockManager::new();
        let job_id = JobId::new();

        let token = manager.acquire(job_id, Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let renewed = manager.renew(job_id, &token, Duration::from_secs(30)).await;
        assert!(renewed.is_err());
        assert_eq!(renewed.unwrap_err().code(), ErrorCode::LockExpired);
    }

    #[tokio::test]
    async fn test_stale_token_cannot_renew_or_release() {
        let manager = InMemoryLockManager::new();
        let job_id = JobId::new();

        let stale = manager.acquire(job_id, Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let current = manager.acquire(job_id, Duration::from_secs(30)).await.unwrap();

        // The stale worker can neither extend nor drop the new lease.
        assert!(manager.renew(job_id, &stale, Duration::from_secs(30)).await.is_err());
        manager.release(job_id, &stale).await.unwrap();
        assert!(manager.acquire(job_id, Duration::from_secs(30)).await.is_err());

        manager.release(job_id, &current).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let manager = Arc::new(InMemoryLockManager::new());
        let job_id = JobId::new();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.acquire(job_id, Duration::from_secs(30)).await.is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_config_defaults() {
        let config = LockConfig::default();
        assert_eq!(config.ttl, Duration::from_millis(30_000));
        assert_eq!(config.renew_threshold, Duration::from_millis(15_000));
    }
}
