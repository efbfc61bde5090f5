//! Per-user message coalescing.
//!
//! Every accepted message re-arms the user's timer. The timer ticks at
//! `poll_granularity`; it fires once the user has been silent for longer than
//! `inter_message_timeout`, or once `initial_timeout` has passed since it was
//! armed. Firing drains the buffer and flips it to processing in one step
//! under the user's lock, then awaits the registered [`BatchHandler`] on a
//! separate task. Messages arriving while a batch is in flight are dropped.

use crate::buffer::UserBuffer;
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::handler::BatchHandler;
use crate::message::BufferedMessage;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::FutureExt;
use mb_channels::{MessageKind, UserKey};
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const PREVIEW_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted { pending: usize },
    /// The user has a batch in flight; the message was dropped.
    RejectedWhileProcessing,
}

impl SubmitOutcome {
    pub fn accepted(self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FireReason {
    Inactivity,
    HardCap,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagePreview {
    pub kind: MessageKind,
    pub received_at: DateTime<Utc>,
    pub preview: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferStatus {
    pub user_key: UserKey,
    pub count: usize,
    pub processing: bool,
    pub last_message_at: DateTime<Utc>,
    pub messages: Vec<MessagePreview>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub accepted: u64,
    pub rejected_while_processing: u64,
    pub batches_dispatched: u64,
    pub batches_discarded: u64,
    pub handler_failures: u64,
    pub active_buffers: usize,
    pub armed_timers: usize,
    pub pending_messages: usize,
    pub processing_users: usize,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    rejected_while_processing: AtomicU64,
    batches_dispatched: AtomicU64,
    batches_discarded: AtomicU64,
    handler_failures: AtomicU64,
}

struct KeySlot {
    buffer: UserBuffer,
    /// Set by `cleanup`; a submit holding a stale slot must retry.
    evicted: bool,
}

type SharedSlot = Arc<Mutex<KeySlot>>;

struct TimerHandle {
    generation: u64,
    cancel: CancellationToken,
}

struct SchedulerInner {
    config: SchedulerConfig,
    buffers: DashMap<UserKey, SharedSlot>,
    timers: DashMap<UserKey, TimerHandle>,
    handlers: DashMap<UserKey, Arc<dyn BatchHandler>>,
    next_generation: AtomicU64,
    counters: Counters,
}

/// Coalesces bursts of messages per user and hands each burst to that
/// user's [`BatchHandler`] exactly once.
///
/// Cheap to clone; clones share state. Must be used from within a tokio
/// runtime because `submit` spawns the per-user timer task.
#[derive(Clone)]
pub struct CoalescingScheduler {
    inner: Arc<SchedulerInner>,
}

impl Default for CoalescingScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl CoalescingScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                buffers: DashMap::new(),
                timers: DashMap::new(),
                handlers: DashMap::new(),
                next_generation: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Buffers `message` for `user_key` and restarts the user's timer, or
    /// drops it when a batch for that user is being handled.
    pub fn submit(&self, user_key: &UserKey, message: BufferedMessage) -> Result<SubmitOutcome> {
        if user_key.is_blank() {
            return Err(SchedulerError::InvalidInput("user key is empty".to_string()));
        }
        message.validate()?;
        if message.user_key != *user_key {
            return Err(SchedulerError::InvalidInput(format!(
                "message belongs to {} but was submitted for {}",
                message.user_key, user_key
            )));
        }

        loop {
            let slot = self.inner.slot_for(user_key);
            let mut guard = lock_slot(&slot);
            if guard.evicted {
                continue;
            }
            if guard.buffer.is_processing() {
                self.inner
                    .counters
                    .rejected_while_processing
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    user_key = %user_key,
                    kind = %message.kind,
                    "batch in flight for user; dropping message"
                );
                return Ok(SubmitOutcome::RejectedWhileProcessing);
            }

            let kind = message.kind;
            guard.buffer.append(message);
            let pending = guard.buffer.len();
            self.inner.arm_timer(user_key, &slot);
            drop(guard);

            self.inner.counters.accepted.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                user_key = %user_key,
                kind = %kind,
                pending,
                initial_timeout_secs = self.inner.config.initial_timeout.as_secs_f64(),
                "message buffered; timer armed"
            );
            return Ok(SubmitOutcome::Accepted { pending });
        }
    }

    /// Binds `handler` to `user_key`, replacing any previous binding.
    pub fn register_handler(&self, user_key: &UserKey, handler: Arc<dyn BatchHandler>) {
        self.inner.handlers.insert(user_key.clone(), handler);
        tracing::info!(user_key = %user_key, "batch handler registered");
    }

    /// Binds `handler` only if the user has none. Returns true if it was bound.
    pub fn register_handler_if_absent(
        &self,
        user_key: &UserKey,
        handler: Arc<dyn BatchHandler>,
    ) -> bool {
        let mut inserted = false;
        self.inner
            .handlers
            .entry(user_key.clone())
            .or_insert_with(|| {
                inserted = true;
                handler
            });
        if inserted {
            tracing::info!(user_key = %user_key, "batch handler registered");
        }
        inserted
    }

    pub fn has_handler(&self, user_key: &UserKey) -> bool {
        self.inner.handlers.contains_key(user_key)
    }

    pub fn status(&self, user_key: &UserKey) -> Option<BufferStatus> {
        let slot = self
            .inner
            .buffers
            .get(user_key)
            .map(|entry| Arc::clone(entry.value()))?;
        let guard = lock_slot(&slot);
        let buffer = &guard.buffer;
        Some(BufferStatus {
            user_key: user_key.clone(),
            count: buffer.len(),
            processing: buffer.is_processing(),
            last_message_at: buffer.last_message_at(),
            messages: buffer
                .pending()
                .iter()
                .map(|m| MessagePreview {
                    kind: m.kind,
                    received_at: m.received_at,
                    preview: m.preview(PREVIEW_CHARS),
                })
                .collect(),
        })
    }

    /// Cancels the user's timer and forgets the buffer and handler binding.
    pub fn cleanup(&self, user_key: &UserKey) {
        let removed = self.inner.buffers.remove(user_key).map(|(_, slot)| slot);
        let discarded = match &removed {
            Some(slot) => {
                let mut guard = lock_slot(slot);
                guard.evicted = true;
                self.inner.cancel_timer(user_key);
                guard.buffer.drain().len()
            }
            None => {
                self.inner.cancel_timer(user_key);
                0
            }
        };
        self.inner.handlers.remove(user_key);
        tracing::info!(
            user_key = %user_key,
            existed = removed.is_some(),
            discarded,
            "user buffer cleaned up"
        );
    }

    /// Cancels every armed timer. Batches already handed to a handler finish.
    pub fn shutdown(&self) {
        let keys: Vec<UserKey> = self.inner.timers.iter().map(|e| e.key().clone()).collect();
        for key in &keys {
            self.inner.cancel_timer(key);
        }
        tracing::info!(cancelled_timers = keys.len(), "coalescing scheduler shut down");
    }

    pub fn stats(&self) -> SchedulerStats {
        let slots: Vec<SharedSlot> = self
            .inner
            .buffers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut pending_messages = 0;
        let mut processing_users = 0;
        for slot in &slots {
            let guard = lock_slot(slot);
            pending_messages += guard.buffer.len();
            if guard.buffer.is_processing() {
                processing_users += 1;
            }
        }

        let counters = &self.inner.counters;
        SchedulerStats {
            accepted: counters.accepted.load(Ordering::Relaxed),
            rejected_while_processing: counters.rejected_while_processing.load(Ordering::Relaxed),
            batches_dispatched: counters.batches_dispatched.load(Ordering::Relaxed),
            batches_discarded: counters.batches_discarded.load(Ordering::Relaxed),
            handler_failures: counters.handler_failures.load(Ordering::Relaxed),
            active_buffers: slots.len(),
            armed_timers: self.inner.timers.len(),
            pending_messages,
            processing_users,
        }
    }
}

impl SchedulerInner {
    fn slot_for(&self, user_key: &UserKey) -> SharedSlot {
        let entry = self.buffers.entry(user_key.clone()).or_insert_with(|| {
            tracing::info!(user_key = %user_key, "user buffer created");
            Arc::new(Mutex::new(KeySlot {
                buffer: UserBuffer::new(user_key.clone()),
                evicted: false,
            }))
        });
        Arc::clone(entry.value())
    }

    /// Replaces the user's timer. Caller holds the user's slot lock, which
    /// makes cancel-and-rearm atomic with respect to a firing timer.
    fn arm_timer(self: &Arc<Self>, user_key: &UserKey, slot: &SharedSlot) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let previous = self.timers.insert(
            user_key.clone(),
            TimerHandle {
                generation,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
            tracing::debug!(
                user_key = %user_key,
                previous_generation = previous.generation,
                "previous timer cancelled"
            );
        }

        let inner = Arc::clone(self);
        let user_key = user_key.clone();
        let slot = Arc::clone(slot);
        tokio::spawn(async move {
            inner.run_timer(user_key, slot, generation, cancel).await;
        });
    }

    fn cancel_timer(&self, user_key: &UserKey) {
        if let Some((_, timer)) = self.timers.remove(user_key) {
            timer.cancel.cancel();
        }
    }

    async fn run_timer(
        self: Arc<Self>,
        user_key: UserKey,
        slot: SharedSlot,
        generation: u64,
        cancel: CancellationToken,
    ) {
        let cfg = self.config;
        let mut elapsed = Duration::ZERO;
        let reason = loop {
            if elapsed >= cfg.initial_timeout {
                break FireReason::HardCap;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::trace!(user_key = %user_key, generation, "timer cancelled");
                    return;
                }
                _ = tokio::time::sleep(cfg.poll_granularity) => {}
            }
            elapsed += cfg.poll_granularity;

            let due = lock_slot(&slot)
                .buffer
                .should_trigger(cfg.inter_message_timeout);
            if due {
                break FireReason::Inactivity;
            }
        };
        self.fire(user_key, slot, generation, &cancel, reason);
    }

    fn fire(
        self: &Arc<Self>,
        user_key: UserKey,
        slot: SharedSlot,
        generation: u64,
        cancel: &CancellationToken,
        reason: FireReason,
    ) {
        let batch = {
            let mut guard = lock_slot(&slot);
            // A submit or cleanup that got the lock first superseded this timer.
            if cancel.is_cancelled() || guard.evicted {
                return;
            }
            if guard.buffer.is_empty() {
                drop(guard);
                self.timers
                    .remove_if(&user_key, |_, timer| timer.generation == generation);
                tracing::debug!(user_key = %user_key, "timer fired on empty buffer");
                return;
            }
            guard.buffer.set_processing(true);
            guard.buffer.drain()
        };
        let batch_size = batch.len();

        let handler = self
            .handlers
            .get(&user_key)
            .map(|entry| Arc::clone(entry.value()));
        let Some(handler) = handler else {
            self.counters.batches_discarded.fetch_add(1, Ordering::Relaxed);
            let error = SchedulerError::NoHandlerRegistered {
                user_key: user_key.clone(),
                batch_size,
            };
            tracing::warn!(user_key = %user_key, ?reason, error = %error, "batch discarded");
            self.finish(&user_key, &slot, generation);
            return;
        };

        self.counters.batches_dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::info!(user_key = %user_key, ?reason, batch_size, "batch ready; dispatching");
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner
                .deliver(user_key, slot, generation, handler, batch)
                .await;
        });
    }

    async fn deliver(
        self: Arc<Self>,
        user_key: UserKey,
        slot: SharedSlot,
        generation: u64,
        handler: Arc<dyn BatchHandler>,
        batch: Vec<BufferedMessage>,
    ) {
        let batch_size = batch.len();
        let outcome = AssertUnwindSafe(handler.handle(user_key.clone(), batch))
            .catch_unwind()
            .await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(panic) => Some(format!("handler panicked: {}", panic_message(&*panic))),
        };
        match failure {
            None => {
                tracing::info!(user_key = %user_key, batch_size, "batch handled");
            }
            Some(message) => {
                self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                let error = SchedulerError::HandlerFailure {
                    user_key: user_key.clone(),
                    message,
                };
                tracing::error!(user_key = %user_key, batch_size, error = %error, "batch handler failed");
            }
        }
        self.finish(&user_key, &slot, generation);
    }

    /// Returns the user to idle once a fired batch is done with.
    fn finish(&self, user_key: &UserKey, slot: &SharedSlot, generation: u64) {
        lock_slot(slot).buffer.set_processing(false);
        self.timers
            .remove_if(user_key, |_, timer| timer.generation == generation);
    }
}

fn lock_slot(slot: &SharedSlot) -> MutexGuard<'_, KeySlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
