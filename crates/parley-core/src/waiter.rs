//! Long-poll waiters.
//!
//! A waiter is a pending request for "whatever arrives next". It is stored in
//! the buffer as a boxed [`Delivery`] and removed exactly once, either by a post
//! sweeping the waiter set or by cancellation. `Delivery::deliver` consumes the
//! box, so a waiter can never be invoked twice.

use crate::buffer::MessageBuffer;
use crate::message::Batch;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;

/// Handle identifying a registered waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WaiterId(pub(crate) u64);

impl WaiterId {
    /// Get the raw numeric value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WaiterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Errors a delivery can report back to the buffer.
///
/// These are logged and counted, never propagated to the poster.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The receiving side has gone away.
    #[error("Receiver closed")]
    Closed,

    /// The delivery callback failed.
    #[error("Delivery failed: {0}")]
    Failed(String),

    /// The delivery callback panicked.
    #[error("Delivery panicked")]
    Panicked,
}

/// Errors returned when awaiting a [`Waiter`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    /// The waiter was cancelled before any messages arrived.
    #[error("Wait cancelled")]
    Cancelled,
}

/// A one-shot consumer of a message batch.
pub trait Delivery: Send {
    /// Deliver the batch, consuming the waiter.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch could not be handed over.
    fn deliver(self: Box<Self>, batch: Batch) -> Result<(), DeliveryError>;
}

impl<F> Delivery for F
where
    F: FnOnce(Batch) -> Result<(), DeliveryError> + Send,
{
    fn deliver(self: Box<Self>, batch: Batch) -> Result<(), DeliveryError> {
        (*self)(batch)
    }
}

/// Delivery into a oneshot channel, backing [`Waiter`].
pub(crate) struct ChannelDelivery(pub(crate) oneshot::Sender<Batch>);

impl Delivery for ChannelDelivery {
    fn deliver(self: Box<Self>, batch: Batch) -> Result<(), DeliveryError> {
        self.0.send(batch).map_err(|_| DeliveryError::Closed)
    }
}

/// Outcome of registering a delivery with the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The cursor was behind; the delivery already ran with the missed messages.
    Immediate,
    /// The delivery is parked until the next post or cancellation.
    Pending(WaiterId),
}

impl Registration {
    /// Get the waiter ID if the delivery was parked.
    #[must_use]
    pub fn waiter_id(&self) -> Option<WaiterId> {
        match self {
            Self::Immediate => None,
            Self::Pending(id) => Some(*id),
        }
    }

    /// Check if the delivery ran immediately.
    #[must_use]
    pub fn is_immediate(&self) -> bool {
        matches!(self, Self::Immediate)
    }
}

/// A pending long-poll, resolving to the next batch of messages.
///
/// Returned by [`MessageBuffer::wait`]. Dropping an unresolved waiter cancels
/// it, so a request handler that is torn down with its connection leaves
/// nothing behind in the buffer.
#[must_use = "a waiter does nothing unless awaited"]
pub struct Waiter {
    registration: Registration,
    receiver: oneshot::Receiver<Batch>,
    buffer: MessageBuffer,
    resolved: bool,
}

impl Waiter {
    pub(crate) fn new(
        registration: Registration,
        receiver: oneshot::Receiver<Batch>,
        buffer: MessageBuffer,
    ) -> Self {
        Self {
            registration,
            receiver,
            buffer,
            resolved: false,
        }
    }

    /// Get the waiter ID, or `None` if the wait was answered immediately.
    #[must_use]
    pub fn id(&self) -> Option<WaiterId> {
        self.registration.waiter_id()
    }

    /// Check if the wait was answered from the cache without parking.
    #[must_use]
    pub fn is_immediate(&self) -> bool {
        self.registration.is_immediate()
    }

    /// Cancel the wait.
    ///
    /// Returns `true` if this call removed the waiter. Awaiting a cancelled
    /// waiter yields [`WaitError::Cancelled`].
    pub fn cancel(&self) -> bool {
        match self.registration {
            Registration::Pending(id) => self.buffer.cancel(id),
            Registration::Immediate => false,
        }
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("registration", &self.registration)
            .field("resolved", &self.resolved)
            .finish()
    }
}

impl Future for Waiter {
    type Output = Result<Batch, WaitError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(result) => {
                this.resolved = true;
                Poll::Ready(result.map_err(|_| WaitError::Cancelled))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if !self.resolved {
            self.cancel();
        }
    }
}
