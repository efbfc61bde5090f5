use crate::message::BufferedMessage;
use anyhow::Result;
use async_trait::async_trait;
use mb_channels::UserKey;
use std::future::Future;

/// Consumer of a completed batch. Invocations for one user never overlap.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(&self, user_key: UserKey, batch: Vec<BufferedMessage>) -> Result<()>;
}

#[async_trait]
impl<F, Fut> BatchHandler for F
where
    F: Fn(UserKey, Vec<BufferedMessage>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, user_key: UserKey, batch: Vec<BufferedMessage>) -> Result<()> {
        (self)(user_key, batch).await
    }
}
