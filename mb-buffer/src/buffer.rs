use crate::message::BufferedMessage;
use chrono::{DateTime, Utc};
use mb_channels::UserKey;
use std::time::Duration;
use tokio::time::Instant;

/// Per-user queue of pending messages plus the timing state the debounce
/// policy reads. Holds no locks or timers; the scheduler owns those.
#[derive(Debug)]
pub struct UserBuffer {
    user_key: UserKey,
    pending: Vec<BufferedMessage>,
    last_message_at: DateTime<Utc>,
    last_activity: Instant,
    processing: bool,
}

impl UserBuffer {
    pub fn new(user_key: UserKey) -> Self {
        Self {
            user_key,
            pending: Vec::new(),
            last_message_at: Utc::now(),
            last_activity: Instant::now(),
            processing: false,
        }
    }

    pub fn user_key(&self) -> &UserKey {
        &self.user_key
    }

    pub fn append(&mut self, message: BufferedMessage) {
        self.pending.push(message);
        self.last_message_at = Utc::now();
        self.last_activity = Instant::now();
    }

    pub fn should_trigger(&self, inter_message_timeout: Duration) -> bool {
        self.should_trigger_at(inter_message_timeout, Instant::now())
    }

    /// True iff messages are pending and strictly more than
    /// `inter_message_timeout` has passed since the last append.
    pub fn should_trigger_at(&self, inter_message_timeout: Duration, now: Instant) -> bool {
        !self.pending.is_empty()
            && now.saturating_duration_since(self.last_activity) > inter_message_timeout
    }

    /// Moves every pending message out, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<BufferedMessage> {
        std::mem::take(&mut self.pending)
    }

    pub fn pending(&self) -> &[BufferedMessage] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    pub(crate) fn set_processing(&mut self, processing: bool) {
        self.processing = processing;
    }

    pub fn last_message_at(&self) -> DateTime<Utc> {
        self.last_message_at
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }
}
