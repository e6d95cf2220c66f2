use crate::traits::ChannelSender;
use crate::types::OutboundMessage;
use anyhow::Result;
use async_trait::async_trait;

/// Sender for local development: logs the reply instead of delivering it.
#[derive(Debug, Default, Clone)]
pub struct NoopSender;

#[async_trait]
impl ChannelSender for NoopSender {
    fn channel_id(&self) -> &str {
        "noop"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        tracing::info!(
            conversation = %message.conversation,
            job_id = ?message.job_id,
            text = %message.text,
            "noop channel: reply logged, not delivered"
        );
        Ok(())
    }
}
