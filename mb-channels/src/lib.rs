//! Chat channel types and delivery adapters.
//!
//! Adapters are pure I/O: the bridge posts `InboundMessage` webhooks in and
//! replies go out as `OutboundMessage`.

mod traits;
mod types;
mod whatsapp;

pub use traits::ChannelAdapter;
pub use types::{
    ConversationKey, InboundMedia, InboundMessage, MediaRef, MessageId, MessageKind,
    OutboundMessage, UserKey,
};
pub use whatsapp::WhatsAppBridgeAdapter;
