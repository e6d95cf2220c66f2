use crate::types::OutboundMessage;
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Unique channel identifier: "whatsapp", "noop".
    fn channel_id(&self) -> &str;

    /// Deliver a message to the customer's chat on this platform.
    async fn send(&self, message: &OutboundMessage) -> Result<()>;
}
