use mb_channels::UserKey;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no batch handler registered for {user_key}; batch of {batch_size} discarded")]
    NoHandlerRegistered { user_key: UserKey, batch_size: usize },

    #[error("batch handler failed for {user_key}: {message}")]
    HandlerFailure { user_key: UserKey, message: String },
}
