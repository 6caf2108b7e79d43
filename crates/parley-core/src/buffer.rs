//! The shared message buffer.
//!
//! The buffer keeps a bounded cache of recent messages and the set of parked
//! long-poll waiters. Posting appends to the cache and sweeps the waiter set in
//! one critical section; the sweep is delivered after the lock is released, so
//! deliveries may freely call back into the buffer.

use crate::message::{Batch, Message, MessageId};
use crate::waiter::{ChannelDelivery, Delivery, DeliveryError, Registration, Waiter, WaiterId};
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Default number of cached messages.
pub const DEFAULT_CACHE_CAPACITY: usize = 200;

/// Buffer errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// A post must carry at least one message.
    #[error("Cannot post an empty batch")]
    EmptyBatch,
}

/// Buffer configuration.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Maximum number of messages kept for cursor replay.
    pub capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// Buffer statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferStats {
    /// Number of cached messages.
    pub cached: usize,
    /// Number of parked waiters.
    pub waiters: usize,
    /// Cache capacity.
    pub capacity: usize,
    /// Total messages posted since construction.
    pub posted_total: u64,
    /// Total deliveries that reported an error.
    pub delivery_failures: u64,
}

/// State guarded by the buffer lock.
#[derive(Default)]
struct State {
    cache: VecDeque<Arc<Message>>,
    waiters: HashMap<WaiterId, Box<dyn Delivery>>,
    posted_total: u64,
}

impl State {
    /// Messages after `cursor`, if the cursor is cached and not the newest.
    fn replay_after(&self, cursor: &MessageId) -> Option<Batch> {
        let pos = self.cache.iter().rposition(|m| m.id == *cursor)?;
        if pos + 1 == self.cache.len() {
            return None;
        }
        Some(self.cache.range(pos + 1..).cloned().collect())
    }
}

struct Shared {
    config: BufferConfig,
    state: Mutex<State>,
    next_waiter: AtomicU64,
    delivery_failures: AtomicU64,
}

/// The message buffer.
///
/// Cloning is cheap and yields another handle to the same buffer. Construct one
/// at startup and hand it to every request handler.
#[derive(Clone)]
pub struct MessageBuffer {
    shared: Arc<Shared>,
}

impl MessageBuffer {
    /// Create a new buffer with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BufferConfig::default())
    }

    /// Create a new buffer with custom configuration.
    #[must_use]
    pub fn with_config(config: BufferConfig) -> Self {
        info!("Creating message buffer with config: {:?}", config);
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State::default()),
                next_waiter: AtomicU64::new(1),
                delivery_failures: AtomicU64::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // Deliveries run outside the lock, so a poisoned guard still holds
        // consistent state.
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the buffer configuration.
    #[must_use]
    pub fn config(&self) -> &BufferConfig {
        &self.shared.config
    }

    /// Post new messages.
    ///
    /// The messages are appended to the cache in order, evicting the oldest
    /// entries beyond capacity. Every waiter parked before this call is removed
    /// and handed the full batch, including messages that did not fit in the
    /// cache. A failing delivery is logged and does not affect the others.
    ///
    /// Returns the number of waiters the batch was delivered to.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::EmptyBatch`] if `messages` is empty.
    pub fn post(&self, messages: impl IntoIterator<Item = Message>) -> Result<usize, BufferError> {
        let batch: Batch = messages.into_iter().map(Arc::new).collect();
        if batch.is_empty() {
            return Err(BufferError::EmptyBatch);
        }

        let waiters = {
            let mut state = self.lock();
            state.cache.extend(batch.iter().cloned());
            while state.cache.len() > self.shared.config.capacity {
                state.cache.pop_front();
            }
            state.posted_total += batch.len() as u64;
            std::mem::take(&mut state.waiters)
        };

        info!(
            messages = batch.len(),
            waiters = waiters.len(),
            "Sending new messages to waiters"
        );

        let count = waiters.len();
        for (id, delivery) in waiters {
            self.dispatch(Some(id), delivery, Arc::clone(&batch));
        }
        Ok(count)
    }

    /// Register a delivery for messages after `cursor`.
    ///
    /// If `cursor` names a cached message that is not the newest one, the
    /// delivery runs before this returns with every message after it, and
    /// nothing is parked. Otherwise (no cursor, the newest message, or an ID
    /// that is not cached) the delivery is parked until the next post.
    pub fn register(
        &self,
        cursor: Option<&MessageId>,
        delivery: Box<dyn Delivery>,
    ) -> Registration {
        let mut state = self.lock();

        let replay = cursor.and_then(|c| state.replay_after(c));
        if let Some(batch) = replay {
            drop(state);
            debug!(messages = batch.len(), "Replaying missed messages");
            self.dispatch(None, delivery, batch);
            return Registration::Immediate;
        }

        let id = WaiterId(self.shared.next_waiter.fetch_add(1, Ordering::Relaxed));
        state.waiters.insert(id, delivery);
        debug!(waiter = %id, waiters = state.waiters.len(), "Waiter registered");
        Registration::Pending(id)
    }

    /// Register a closure for messages after `cursor`.
    ///
    /// See [`MessageBuffer::register`].
    pub fn wait_with<F>(&self, cursor: Option<&MessageId>, callback: F) -> Registration
    where
        F: FnOnce(Batch) -> Result<(), DeliveryError> + Send + 'static,
    {
        self.register(cursor, Box::new(callback))
    }

    /// Wait for messages after `cursor`.
    ///
    /// The returned [`Waiter`] resolves immediately when the cursor is behind,
    /// otherwise on the next post. Dropping it cancels the wait.
    pub fn wait(&self, cursor: Option<&MessageId>) -> Waiter {
        let (tx, rx) = oneshot::channel();
        let registration = self.register(cursor, Box::new(ChannelDelivery(tx)));
        Waiter::new(registration, rx, self.clone())
    }

    /// Cancel a parked waiter.
    ///
    /// Returns `true` if the waiter was removed by this call, `false` if it was
    /// already delivered or cancelled.
    pub fn cancel(&self, id: WaiterId) -> bool {
        let removed = self.lock().waiters.remove(&id);
        match removed {
            Some(_) => {
                debug!(waiter = %id, "Waiter cancelled");
                true
            }
            None => {
                trace!(waiter = %id, "Cancel for waiter no longer registered");
                false
            }
        }
    }

    /// Check if a waiter is still parked.
    #[must_use]
    pub fn is_waiting(&self, id: WaiterId) -> bool {
        self.lock().waiters.contains_key(&id)
    }

    /// Snapshot of the cached messages, oldest first.
    #[must_use]
    pub fn messages(&self) -> Vec<Arc<Message>> {
        self.lock().cache.iter().cloned().collect()
    }

    /// Get buffer statistics.
    #[must_use]
    pub fn stats(&self) -> BufferStats {
        let state = self.lock();
        BufferStats {
            cached: state.cache.len(),
            waiters: state.waiters.len(),
            capacity: self.shared.config.capacity,
            posted_total: state.posted_total,
            delivery_failures: self.shared.delivery_failures.load(Ordering::Relaxed),
        }
    }

    fn dispatch(&self, waiter: Option<WaiterId>, delivery: Box<dyn Delivery>, batch: Batch) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| delivery.deliver(batch)))
            .unwrap_or(Err(DeliveryError::Panicked));

        if let Err(e) = result {
            self.shared.delivery_failures.fetch_add(1, Ordering::Relaxed);
            match waiter {
                Some(id) => warn!(waiter = %id, error = %e, "Error in waiter delivery"),
                None => warn!(error = %e, "Error in immediate delivery"),
            }
        }
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}
