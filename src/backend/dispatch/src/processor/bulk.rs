//! Bulk-send processor: batched campaign sends with partial-failure
//! accounting.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::single::send_with_timeout;
use super::{JobContext, JobProcessor, SendConfig};
use crate::campaign::StatusAggregator;
use crate::error::Result;
use crate::jobs::JobKind;
use crate::mailer::{AccountStore, TemplateRenderer, TransportFactory};

/// Processes [`JobKind::BulkSend`] jobs.
///
/// Recipients are partitioned into fixed-size batches; every send within a
/// batch runs concurrently and an individual failure never aborts the batch
/// or the job. Between batches the processor reports progress, renews its
/// lease, checks for campaign cancellation, and pauses briefly.
pub struct BulkSendProcessor {
    accounts: Arc<dyn AccountStore>,
    transports: Arc<dyn TransportFactory>,
    renderer: Arc<dyn TemplateRenderer>,
    aggregator: Arc<StatusAggregator>,
    config: SendConfig,
}

impl BulkSendProcessor {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        transports: Arc<dyn TransportFactory>,
        renderer: Arc<dyn TemplateRenderer>,
        aggregator: Arc<StatusAggregator>,
        config: SendConfig,
    ) -> Self {
        Self {
            accounts,
            transports,
            renderer,
            aggregator,
            config,
        }
    }
}

#[async_trait]
impl JobProcessor for BulkSendProcessor {
    fn kind(&self) -> JobKind {
        JobKind::BulkSend
    }

    #[instrument(skip(self, ctx), fields(job_id = %ctx.job.id))]
    async fn process(&self, ctx: &JobContext) -> Result<()> {
        let payload = &ctx.job.payload;
        let total = payload.recipients.len();
        if total == 0 {
            ctx.report_progress(100).await?;
            return Ok(());
        }

        // Transport setup failures are job-level failures and feed the
        // standard retry policy.
        let account = self.accounts.get_account(&payload.email_account_id).await?;
        let transport = self.transports.build(&account).await?;

        if let Some(ref campaign_id) = payload.campaign_id {
            self.aggregator.mark_sending(campaign_id).await;
        }

        let mut sent = 0usize;
        let mut failed_recipients: Vec<String> = Vec::new();
        let mut cancelled = false;
        let batch_size = self.config.batch_size.max(1);
        let batches = payload.recipients.chunks(batch_size);
        let batch_count = (total + batch_size - 1) / batch_size;

        for (index, batch) in batches.enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.batch_pause).await;

                // Cancellation is advisory; batch boundaries are the
                // best-effort early-exit points.
                if let Some(ref campaign_id) = payload.campaign_id {
                    if self.aggregator.is_cancelled(campaign_id).await {
                        info!(campaign_id = %campaign_id, "Campaign cancelled; stopping bulk send");
                        cancelled = true;
                        break;
                    }
                }
            }

            let sends = batch.iter().map(|recipient| {
                let html = self.renderer.render(&payload.content, &recipient.variables);
                let from = account.from_address.clone();
                let transport = transport.clone();
                let subject = payload.subject.clone();
                let email = recipient.email.clone();
                async move {
                    let result = send_with_timeout(
                        transport.as_ref(),
                        &from,
                        &email,
                        &subject,
                        &html,
                        self.config.send_timeout,
                    )
                    .await;
                    (email, result)
                }
            });

            for (email, result) in join_all(sends).await {
                if let Err(e) = result {
                    warn!(to = %email, error = %e, "Recipient send failed");
                    failed_recipients.push(email);
                }
            }
            sent += batch.len();

            let progress = (sent * 100 / total) as u8;
            ctx.report_progress(progress).await?;
            ctx.renew_lease().await?;

            debug!(
                batch = index + 1,
                batches = batch_count,
                sent,
                failed = failed_recipients.len(),
                "Bulk batch finished"
            );
        }

        let successful = (sent - failed_recipients.len()) as u32;
        if let Some(ref campaign_id) = payload.campaign_id {
            if cancelled {
                info!(
                    campaign_id = %campaign_id,
                    successful,
                    "Skipping write-back for cancelled campaign"
                );
            } else {
                self.aggregator
                    .record_bulk_outcome(campaign_id, total as u32, successful, failed_recipients)
                    .await;
            }
        }

        // Partial success is not a job-level failure.
        Ok(())
    }
}
