//! Channel types and send adapters for Warung.
//!
//! Adapters are pure I/O: they take a fully formed `OutboundMessage` and
//! deliver it to the provider's send API. Everything upstream (dedup,
//! buffering, job dispatch) lives in `warung-core`.

mod noop;
mod traits;
mod types;
mod whatsapp;

pub use noop::NoopSender;
pub use traits::ChannelSender;
pub use types::{
    ChatId, ConversationKey, InboundEvent, MessageId, OutboundMessage, TenantId,
};
pub use whatsapp::WhatsAppCloudSender;
