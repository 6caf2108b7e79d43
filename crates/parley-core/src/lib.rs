//! # parley-core
//!
//! Message buffer and long-poll notification core for the Parley chat server.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Message** - Immutable chat messages with random IDs and rendered markup
//! - **MessageBuffer** - Bounded cache of recent messages plus parked waiters
//! - **Waiter** - A pending long-poll that resolves exactly once
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  post   ┌───────────────┐  deliver  ┌─────────────┐
//! │   Poster    │────────▶│ MessageBuffer │──────────▶│   Waiters   │
//! └─────────────┘         └───────────────┘           └─────────────┘
//!                                 ▲
//!                                 │ wait(cursor) / cancel
//!                          ┌─────────────┐
//!                          │   Poller    │
//!                          └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use parley_core::{HtmlRenderer, Message, MessageBuffer};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let buffer = MessageBuffer::new();
//! let waiter = buffer.wait(None);
//!
//! buffer.post([Message::new("alice", "hi", &HtmlRenderer)]).unwrap();
//!
//! let batch = waiter.await.unwrap();
//! assert_eq!(batch[0].body, "hi");
//! # }
//! ```

pub mod buffer;
pub mod message;
pub mod waiter;

pub use buffer::{BufferConfig, BufferError, BufferStats, MessageBuffer, DEFAULT_CACHE_CAPACITY};
pub use message::{escape_html, Batch, HtmlRenderer, Message, MessageId, Renderer};
pub use waiter::{Delivery, DeliveryError, Registration, WaitError, Waiter, WaiterId};
