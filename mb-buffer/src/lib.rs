//! Per-user message coalescing for the chat backend.
//!
//! Inbound messages are buffered per user; a debounce timer decides when a
//! burst is complete and the whole burst is handed to the user's
//! [`BatchHandler`] in one call, with at most one call in flight per user.

mod buffer;
mod config;
mod error;
mod handler;
mod message;
mod scheduler;

pub use buffer::UserBuffer;
pub use config::{
    DEFAULT_INITIAL_TIMEOUT_SECONDS, DEFAULT_INTER_MESSAGE_TIMEOUT_SECONDS,
    DEFAULT_POLL_GRANULARITY_SECONDS, SchedulerConfig,
};
pub use error::{Result, SchedulerError};
pub use handler::BatchHandler;
pub use message::BufferedMessage;
pub use scheduler::{
    BufferStatus, CoalescingScheduler, FireReason, MessagePreview, SchedulerStats, SubmitOutcome,
};
