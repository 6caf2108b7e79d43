//! Shared fixtures for Parley benchmarks.

use parley_core::{BufferConfig, HtmlRenderer, Message, MessageBuffer, MessageId};

/// Build a message with a fixed author and a body of `size` bytes.
#[must_use]
pub fn message(size: usize) -> Message {
    Message::new("bench", "x".repeat(size), &HtmlRenderer)
}

/// Build a buffer pre-filled to capacity.
///
/// Returns the buffer and the IDs of the cached messages, oldest first.
#[must_use]
pub fn filled_buffer(capacity: usize) -> (MessageBuffer, Vec<MessageId>) {
    let buffer = MessageBuffer::with_config(BufferConfig { capacity });
    let messages: Vec<Message> = (0..capacity).map(|_| message(64)).collect();
    let ids = messages.iter().map(|m| m.id).collect();
    if !messages.is_empty() {
        let _ = buffer.post(messages);
    }
    (buffer, ids)
}

/// Park `count` no-op waiters on the buffer.
pub fn park_waiters(buffer: &MessageBuffer, count: usize) {
    for _ in 0..count {
        buffer.wait_with(None, |_| Ok(()));
    }
}
