//! Single-send processor: one email to one recipient.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use super::{JobContext, JobProcessor, SendConfig};
use crate::campaign::StatusAggregator;
use crate::error::{DispatchError, Result};
use crate::jobs::JobKind;
use crate::mailer::{AccountStore, TemplateRenderer, Transport, TransportFactory};

/// Processes [`JobKind::SingleSend`] jobs.
pub struct SingleSendProcessor {
    accounts: Arc<dyn AccountStore>,
    transports: Arc<dyn TransportFactory>,
    renderer: Arc<dyn TemplateRenderer>,
    aggregator: Arc<StatusAggregator>,
    config: SendConfig,
}

impl SingleSendProcessor {
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
impl JobProcessor for SingleSendProcessor {
    fn kind(&self) -> JobKind {
        JobKind::SingleSend
    }

    #[instrument(skip(self, ctx), fields(job_id = %ctx.job.id))]
    async fn process(&self, ctx: &JobContext) -> Result<()> {
        let payload = &ctx.job.payload;
        let recipient = payload
            .recipients
            .first()
            .ok_or_else(|| DispatchError::validation("single-send job has no recipient"))?;

        let account = self.accounts.get_account(&payload.email_account_id).await?;
        let transport = self.transports.build(&account).await?;

        if let Some(ref campaign_id) = payload.campaign_id {
            self.aggregator.mark_sending(campaign_id).await;
        }

        let html = self.renderer.render(&payload.content, &recipient.variables);
        send_with_timeout(
            transport.as_ref(),
            &account.from_address,
            &recipient.email,
            &payload.subject,
            &html,
            self.config.send_timeout,
        )
        .await?;

        debug!(to = %recipient.email, "Single send delivered");
        ctx.report_progress(100).await?;

        if let Some(ref campaign_id) = payload.campaign_id {
            self.aggregator.mark_completed(campaign_id).await;
        }
        Ok(())
    }
}

/// Race a transport send against the per-send timeout.
pub(crate) async fn send_with_timeout(
    transport: &dyn Transport,
    from: &str,
    to: &str,
    subject: &str,
    html: &str,
    timeout: Duration,
) -> Result<()> {
    match tokio::time::timeout(timeout, transport.send(from, to, subject, html)).await {
        Ok(result) => result,
        Err(_) => Err(DispatchError::send_timeout(timeout.as_millis() as u64)),
    }
}
