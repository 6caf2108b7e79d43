//! Scenario tests for the message buffer, run against the public API.

use parley_core::{
    BufferConfig, DeliveryError, HtmlRenderer, Message, MessageBuffer, MessageId, WaitError,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

fn msg(body: &str) -> Message {
    Message::new("tester", body, &HtmlRenderer)
}

fn ids(batch: &[Arc<Message>]) -> Vec<MessageId> {
    batch.iter().map(|m| m.id).collect()
}

#[test]
fn evicts_oldest_past_capacity() {
    let buffer = MessageBuffer::with_config(BufferConfig { capacity: 200 });
    let mut posted = Vec::new();

    for i in 0..250 {
        let m = msg(&i.to_string());
        posted.push(m.id);
        buffer.post([m]).unwrap();
    }

    let cache = buffer.messages();
    assert_eq!(cache.len(), 200);
    assert_eq!(cache[0].id, posted[50]);
    assert_eq!(ids(&cache), posted[50..].to_vec());
}

#[test]
fn empty_cache_without_cursor_waits_for_post() {
    let buffer = MessageBuffer::new();
    let received = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&received);

    let registration = buffer.wait_with(None, move |batch| {
        *sink.lock().unwrap() = Some(batch);
        Ok(())
    });
    assert!(!registration.is_immediate());
    assert!(received.lock().unwrap().is_none());

    let m = msg("first");
    let id = m.id;
    buffer.post([m]).unwrap();

    let batch = received.lock().unwrap().take().unwrap();
    assert_eq!(ids(&batch), vec![id]);
}

#[test]
fn cursor_at_nth_most_recent_replays_n() {
    let buffer = MessageBuffer::new();
    let messages: Vec<Message> = (0..10).map(|i| msg(&i.to_string())).collect();
    let posted: Vec<MessageId> = messages.iter().map(|m| m.id).collect();
    buffer.post(messages).unwrap();

    for n in 1..10 {
        let cursor = posted[posted.len() - 1 - n];
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);

        let registration = buffer.wait_with(Some(&cursor), move |batch| {
            sink.lock().unwrap().extend(ids(&batch));
            Ok(())
        });

        assert!(registration.is_immediate());
        assert_eq!(*received.lock().unwrap(), posted[posted.len() - n..].to_vec());
    }
}

#[test]
fn cursor_at_latest_stays_pending() {
    let buffer = MessageBuffer::new();
    let a = msg("a");
    let cursor = a.id;
    buffer.post([a]).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let registration = buffer.wait_with(Some(&cursor), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    assert!(!registration.is_immediate());
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(buffer.stats().waiters, 1);
}

#[test]
fn unknown_cursor_behaves_like_no_cursor() {
    let buffer = MessageBuffer::new();
    buffer.post([msg("a"), msg("b")]).unwrap();

    let unknown = MessageId::generate();
    let with_unknown = buffer.wait_with(Some(&unknown), |_| Ok(()));
    let without = buffer.wait_with(None, |_| Ok(()));

    assert!(!with_unknown.is_immediate());
    assert!(!without.is_immediate());
    assert_eq!(buffer.stats().waiters, 2);
}

#[test]
fn cursor_evicted_from_cache_registers() {
    let buffer = MessageBuffer::with_config(BufferConfig { capacity: 2 });
    let first = msg("a");
    let cursor = first.id;
    buffer.post([first]).unwrap();
    buffer.post([msg("b"), msg("c")]).unwrap();

    let registration = buffer.wait_with(Some(&cursor), |_| Ok(()));
    assert!(!registration.is_immediate());
}

#[test]
fn wait_between_posts_gets_only_second() {
    let buffer = MessageBuffer::new();
    let a = msg("a");
    let cursor = a.id;
    buffer.post([a]).unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    buffer.wait_with(Some(&cursor), move |batch| {
        sink.lock().unwrap().extend(ids(&batch));
        Ok(())
    });
    assert!(received.lock().unwrap().is_empty());

    let b = msg("b");
    let b_id = b.id;
    buffer.post([b]).unwrap();

    assert_eq!(*received.lock().unwrap(), vec![b_id]);
}

#[test]
fn fan_out_to_all_waiters() {
    let buffer = MessageBuffer::new();
    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));

    for sink in [Arc::clone(&first), Arc::clone(&second)] {
        buffer.wait_with(None, move |batch| {
            sink.lock().unwrap().push(ids(&batch));
            Ok(())
        });
    }

    let (a, b) = (msg("a"), msg("b"));
    let expected = vec![a.id, b.id];
    assert_eq!(buffer.post([a, b]).unwrap(), 2);

    assert_eq!(*first.lock().unwrap(), vec![expected.clone()]);
    assert_eq!(*second.lock().unwrap(), vec![expected]);
    assert_eq!(buffer.stats().waiters, 0);
}

#[test]
fn failing_waiter_does_not_block_others() {
    let buffer = MessageBuffer::new();
    let delivered = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&delivered);
    buffer.wait_with(None, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    buffer.wait_with(None, |_| Err(DeliveryError::Closed));
    let counter = Arc::clone(&delivered);
    buffer.wait_with(None, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    buffer.post([msg("a")]).unwrap();
    assert_eq!(delivered.load(Ordering::SeqCst), 2);
    assert_eq!(buffer.stats().delivery_failures, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_lost_wakeups_under_concurrency() {
    let buffer = MessageBuffer::new();
    let mut tasks = Vec::new();

    for _ in 0..64 {
        let waiter = buffer.wait(None);
        tasks.push(tokio::spawn(waiter));
    }

    let poster = buffer.clone();
    let m = msg("wake");
    let id = m.id;
    tokio::spawn(async move { poster.post([m]).unwrap() })
        .await
        .unwrap();

    for task in tasks {
        let batch = task.await.unwrap().unwrap();
        assert_eq!(ids(&batch), vec![id]);
    }
    assert_eq!(buffer.stats().waiters, 0);
}

#[test]
fn concurrent_posts_are_totally_ordered() {
    let buffer = MessageBuffer::new();
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let buffer = buffer.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..25 {
                    buffer.post([msg(&format!("{t}-{i}"))]).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let cache = buffer.messages();
    assert_eq!(cache.len(), 100);
    // Each poster's own messages keep their relative order.
    for t in 0..4 {
        let prefix = format!("{t}-");
        let own: Vec<String> = cache
            .iter()
            .filter(|m| m.body.starts_with(&prefix))
            .map(|m| m.body.clone())
            .collect();
        let expected: Vec<String> = (0..25).map(|i| format!("{t}-{i}")).collect();
        assert_eq!(own, expected);
    }
}

#[test]
fn cancel_races_with_post_exactly_once() {
    for _ in 0..200 {
        let buffer = MessageBuffer::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let id = buffer
            .wait_with(None, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .waiter_id()
            .unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let canceller = {
            let buffer = buffer.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                buffer.cancel(id)
            })
        };

        barrier.wait();
        buffer.post([msg("race")]).unwrap();
        let cancelled = canceller.join().unwrap();

        let delivered = calls.load(Ordering::SeqCst);
        assert_eq!(delivered + usize::from(cancelled), 1);
        assert!(!buffer.cancel(id));
    }
}

#[tokio::test]
async fn cancelled_waiter_is_not_delivered() {
    let buffer = MessageBuffer::new();
    let waiter = buffer.wait(None);
    let id = waiter.id().unwrap();

    assert!(buffer.cancel(id));
    assert_eq!(buffer.post([msg("late")]).unwrap(), 0);
    assert_eq!(waiter.await, Err(WaitError::Cancelled));
}

#[tokio::test]
async fn dropped_waiter_task_cancels() {
    let buffer = MessageBuffer::new();
    let waiter = buffer.wait(None);
    let id = waiter.id().unwrap();

    let task = tokio::spawn(waiter);
    tokio::task::yield_now().await;
    task.abort();
    let _ = task.await;

    assert!(!buffer.is_waiting(id));
}

proptest! {
    #[test]
    fn cache_holds_most_recent_messages(
        capacity in 0usize..20,
        batches in prop::collection::vec(1usize..6, 0..30),
    ) {
        let buffer = MessageBuffer::with_config(BufferConfig { capacity });
        let mut posted = Vec::new();

        for size in batches {
            let batch: Vec<Message> = (0..size).map(|i| msg(&i.to_string())).collect();
            posted.extend(batch.iter().map(|m| m.id));
            buffer.post(batch).unwrap();
        }

        let keep = posted.len().min(capacity);
        let cache = ids(&buffer.messages());
        prop_assert_eq!(cache.len(), keep);
        prop_assert_eq!(cache, posted[posted.len() - keep..].to_vec());
    }
}
