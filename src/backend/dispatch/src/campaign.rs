//! Campaign records and the status aggregator.
//!
//! The campaign store is an external collaborator; this module specifies the
//! narrow contract the engine depends on, an in-memory implementation for
//! tests and development, and the best-effort `StatusAggregator` that writes
//! aggregate send results back without ever masking a send outcome.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use crate::error::{DispatchError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Campaign Identification and Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Identifier of a campaign record in the external store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CampaignId(pub String);

impl CampaignId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for CampaignId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CampaignId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Status of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    /// Being authored; not yet handed to the engine
    Draft,
    /// Enqueued, possibly for a future send time
    Scheduled,
    /// At least one job is actively sending
    Sending,
    /// All sends succeeded
    Completed,
    /// The send failed, fully or partially
    Failed,
    /// Cancelled by an external request; advisory to in-flight jobs
    Cancelled,
}

impl CampaignStatus {
    /// Check if the campaign is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check whether a transition to `next` is allowed.
    ///
    /// Re-asserting the current status is a no-op and always allowed;
    /// `Cancelled` is reachable from any pre-terminal state.
    pub fn can_transition_to(&self, next: CampaignStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            Self::Draft => matches!(next, Self::Scheduled | Self::Sending | Self::Cancelled),
            Self::Scheduled => matches!(next, Self::Sending | Self::Cancelled),
            Self::Sending => matches!(next, Self::Completed | Self::Failed | Self::Cancelled),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Sending => "sending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Campaign Record
// ═══════════════════════════════════════════════════════════════════════════════

/// The persisted aggregate record of a campaign's overall outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub status: CampaignStatus,
    pub total_recipients: u32,
    pub successful_sends: u32,
    pub failed_sends: u32,
    /// Addresses whose sends failed, for operator follow-up
    pub failed_recipients: Vec<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Status Updates
// ═══════════════════════════════════════════════════════════════════════════════

/// A partial update applied to a campaign record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: Option<CampaignStatus>,
    pub successful_sends: Option<u32>,
    pub failed_sends: Option<u32>,
    pub failed_recipients: Option<Vec<String>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    /// Start an update that sets the status.
    pub fn status(status: CampaignStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Start an update that touches counters only.
    pub fn counts(successful: u32, failed: u32) -> Self {
        Self {
            successful_sends: Some(successful),
            failed_sends: Some(failed),
            ..Default::default()
        }
    }

    pub fn with_counts(mut self, successful: u32, failed: u32) -> Self {
        self.successful_sends = Some(successful);
        self.failed_sends = Some(failed);
        self
    }

    pub fn with_failed_recipients(mut self, emails: Vec<String>) -> Self {
        self.failed_recipients = Some(emails);
        self
    }

    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_sent_at(mut self, at: DateTime<Utc>) -> Self {
        self.sent_at = Some(at);
        self
    }

    pub fn with_completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Contract
// ═══════════════════════════════════════════════════════════════════════════════

/// Narrow contract over the external campaign store.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Fetch a campaign record.
    async fn get(&self, id: &CampaignId) -> Result<Option<Campaign>>;

    /// Apply a partial update to a campaign record.
    async fn update_status(&self, id: &CampaignId, update: StatusUpdate) -> Result<()>;
}

/// In-memory campaign store for testing and development.
#[derive(Default)]
pub struct InMemoryCampaignStore {
    campaigns: DashMap<CampaignId, Campaign>,
}

impl InMemoryCampaignStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a draft campaign.
    pub fn insert(&self, id: impl Into<CampaignId>, total_recipients: u32) -> CampaignId {
        let id = id.into();
        self.campaigns.insert(
            id.clone(),
            Campaign {
                id: id.clone(),
                status: CampaignStatus::Draft,
                total_recipients,
                successful_sends: 0,
                failed_sends: 0,
                failed_recipients: Vec::new(),
                scheduled_at: None,
                sent_at: None,
                completed_at: None,
            },
        );
        id
    }
}

#[async_trait]
impl CampaignStore for InMemoryCampaignStore {
    async fn get(&self, id: &CampaignId) -> Result<Option<Campaign>> {
        Ok(self.campaigns.get(id).map(|c| c.clone()))
    }

    async fn update_status(&self, id: &CampaignId, update: StatusUpdate) -> Result<()> {
        let mut campaign = self
            .campaigns
            .get_mut(id)
            .ok_or_else(|| DispatchError::persistence_write(format!("unknown campaign {}", id)))?;

        if let Some(status) = update.status {
            if !campaign.status.can_transition_to(status) {
                return Err(DispatchError::invalid_transition(format!(
                    "campaign {} cannot move {} -> {}",
                    id, campaign.status, status
                )));
            }
            campaign.status = status;
        }
        if let Some(successful) = update.successful_sends {
            campaign.successful_sends = successful;
        }
        if let Some(failed) = update.failed_sends {
            campaign.failed_sends = failed;
        }
        if let Some(emails) = update.failed_recipients {
            campaign.failed_recipients = emails;
        }
        if let Some(at) = update.scheduled_at {
            campaign.scheduled_at = Some(at);
        }
        if let Some(at) = update.sent_at {
            campaign.sent_at = Some(at);
        }
        if let Some(at) = update.completed_at {
            campaign.completed_at = Some(at);
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Status Aggregator
// ═══════════════════════════════════════════════════════════════════════════════

/// Best-effort write-back of aggregate send results.
///
/// Store failures are logged and counted, never propagated: the email send
/// already happened and its outcome must not be masked or retried merely
/// because bookkeeping failed.
pub struct StatusAggregator {
    store: std::sync::Arc<dyn CampaignStore>,
}

impl StatusAggregator {
    pub fn new(store: std::sync::Arc<dyn CampaignStore>) -> Self {
        Self { store }
    }

    /// Apply an update, swallowing (but logging and counting) failures.
    pub async fn apply(&self, id: &CampaignId, update: StatusUpdate) {
        if let Err(e) = self.store.update_status(id, update).await {
            warn!(
                campaign_id = %id,
                error = %e,
                "Campaign status write-back failed"
            );
            counter!("dispatch_campaign_writeback_failures_total").increment(1);
        }
    }

    /// Mark the campaign as scheduled for a send time.
    pub async fn mark_scheduled(&self, id: &CampaignId, at: DateTime<Utc>) {
        self.apply(id, StatusUpdate::status(CampaignStatus::Scheduled).with_scheduled_at(at))
            .await;
    }

    /// Mark the campaign as actively sending.
    pub async fn mark_sending(&self, id: &CampaignId) {
        self.apply(id, StatusUpdate::status(CampaignStatus::Sending).with_sent_at(Utc::now()))
            .await;
    }

    /// Record a successful single send.
    pub async fn mark_completed(&self, id: &CampaignId) {
        self.apply(
            id,
            StatusUpdate::status(CampaignStatus::Completed)
                .with_counts(1, 0)
                .with_completed_at(Utc::now()),
        )
        .await;
    }

    /// Record a terminal job failure (retries exhausted).
    pub async fn mark_failed(&self, id: &CampaignId) {
        self.apply(
            id,
            StatusUpdate::status(CampaignStatus::Failed).with_completed_at(Utc::now()),
        )
        .await;
    }

    /// Record the final accounting of a bulk send.
    pub async fn record_bulk_outcome(
        &self,
        id: &CampaignId,
        total: u32,
        successful: u32,
        failed_recipients: Vec<String>,
    ) {
        let failed = total - successful;
        let status = if successful == total {
            CampaignStatus::Completed
        } else {
            CampaignStatus::Failed
        };
        self.apply(
            id,
            StatusUpdate::status(status)
                .with_counts(successful, failed)
                .with_failed_recipients(failed_recipients)
                .with_completed_at(Utc::now()),
        )
        .await;
    }

    /// Check whether the campaign was cancelled (advisory; used at batch
    /// boundaries for best-effort early exit).
    pub async fn is_cancelled(&self, id: &CampaignId) -> bool {
        match self.store.get(id).await {
            Ok(Some(campaign)) => campaign.status == CampaignStatus::Cancelled,
            Ok(None) => false,
            Err(e) => {
                warn!(campaign_id = %id, error = %e, "Cancellation check failed");
                false
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
