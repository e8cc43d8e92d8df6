// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! The producer/consumer queue connecting the protocol engine with
//! application workers.
//!
//! Every request stream owns two of these: an inbound queue the engine
//! pushes `http.request` messages onto, and an outbound queue the
//! application pushes response messages onto. The queue is the only
//! synchronization primitive that crosses the engine/worker boundary, so it
//! carries all three semantics the bridge relies on: FIFO order, wakeup, and
//! close-to-consumer (a consumer that drains a closed queue sees `None` and
//! knows nothing more will ever arrive).

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use tokio::sync::Notify;

use crate::AsgiMessage;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueueError {
    /// The other end closed the queue; the message was not enqueued.
    Closed,

    /// The queue is at capacity. Only returned by [`QueueSender::try_push`].
    Full,
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => f.write_str("the queue is closed"),
            Self::Full => f.write_str("the queue is full"),
        }
    }
}

impl std::error::Error for QueueError {}

struct QueueState {
    messages: VecDeque<AsgiMessage>,
    closed: bool,
}

struct QueueShared {
    state: Mutex<QueueState>,
    capacity: Option<usize>,
    push_notify: Notify,
    pop_notify: Notify,
    drain_hook: Mutex<Option<Arc<Notify>>>,
    sender_count: AtomicUsize,
}

impl QueueShared {
    fn notify_drain(&self) {
        if let Some(hook) = self.drain_hook.lock().expect("queue drain hook lock").as_ref() {
            hook.notify_one();
        }
    }

    fn close(&self) {
        let mut state = self.state.lock().expect("queue state lock");
        state.closed = true;
        self.push_notify.notify_one();
        self.pop_notify.notify_one();
    }
}

/// The producing end of a message queue. Dropping the last sender closes
/// the queue, so a producer that simply returns still delivers end-of-queue
/// to its consumer.
pub struct QueueSender {
    shared: Arc<QueueShared>,
}

impl Clone for QueueSender {
    fn clone(&self) -> Self {
        self.shared.sender_count.fetch_add(1, Ordering::Relaxed);
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl Drop for QueueSender {
    fn drop(&mut self) {
        if self.shared.sender_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.close();
        }
    }
}

/// The consuming end of a message queue. Dropping it closes the queue, so
/// producers stop instead of filling a queue nobody reads.
pub struct QueueReceiver {
    shared: Arc<QueueShared>,
}

impl Drop for QueueReceiver {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Create a queue pair. `capacity` of `None` means the queue is unbounded
/// and [`QueueSender::push`] never waits; the engine uses this for inbound
/// queues, whose effective bound is the flow-control window rather than a
/// message count.
pub fn message_queue(capacity: Option<usize>) -> (QueueSender, QueueReceiver) {
    let shared = Arc::new(QueueShared {
        state: Mutex::new(QueueState {
            messages: VecDeque::new(),
            closed: false,
        }),
        capacity,
        push_notify: Notify::new(),
        pop_notify: Notify::new(),
        drain_hook: Mutex::new(None),
        sender_count: AtomicUsize::new(1),
    });

    (
        QueueSender { shared: Arc::clone(&shared) },
        QueueReceiver { shared },
    )
}

impl QueueSender {
    /// Enqueue a message, waiting for space if the queue is bounded and full.
    pub async fn push(&self, message: AsgiMessage) -> Result<(), QueueError> {
        let mut message = Some(message);
        loop {
            {
                let mut state = self.shared.state.lock().expect("queue state lock");
                if state.closed {
                    return Err(QueueError::Closed);
                }

                let has_room = match self.shared.capacity {
                    Some(capacity) => state.messages.len() < capacity,
                    None => true,
                };

                if has_room {
                    state.messages.push_back(message.take().expect("message already consumed"));
                    self.shared.push_notify.notify_one();
                    return Ok(());
                }
            }

            self.shared.pop_notify.notified().await;
        }
    }

    /// Enqueue a message without waiting.
    pub fn try_push(&self, message: AsgiMessage) -> Result<(), QueueError> {
        let mut state = self.shared.state.lock().expect("queue state lock");
        if state.closed {
            return Err(QueueError::Closed);
        }

        if let Some(capacity) = self.shared.capacity {
            if state.messages.len() >= capacity {
                return Err(QueueError::Full);
            }
        }

        state.messages.push_back(message);
        self.shared.push_notify.notify_one();
        Ok(())
    }

    /// Close the queue. Already-enqueued messages remain poppable; the
    /// consumer sees `None` once they are drained.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().expect("queue state lock").closed
    }

    /// Number of messages currently waiting. The engine compares this
    /// against its high-water mark to decide whether to withhold
    /// flow-control credit.
    pub fn len(&self) -> usize {
        self.shared.state.lock().expect("queue state lock").messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a notifier that is pinged on every pop. The engine installs
    /// one shared notifier across all inbound queues of a connection so a
    /// single `select!` arm can react to any worker draining its queue.
    pub fn set_drain_hook(&self, hook: Arc<Notify>) {
        *self.shared.drain_hook.lock().expect("queue drain hook lock") = Some(hook);
    }
}

impl QueueReceiver {
    /// Dequeue the next message, waiting if the queue is empty. Returns
    /// `None` once the queue is closed and drained.
    pub async fn pop(&mut self) -> Option<AsgiMessage> {
        loop {
            {
                let mut state = self.shared.state.lock().expect("queue state lock");
                if let Some(message) = state.messages.pop_front() {
                    self.shared.pop_notify.notify_one();
                    drop(state);
                    self.shared.notify_drain();
                    return Some(message);
                }

                if state.closed {
                    return None;
                }
            }

            self.shared.push_notify.notified().await;
        }
    }

    /// Dequeue without waiting.
    pub fn try_pop(&mut self) -> Option<AsgiMessage> {
        let message = {
            let mut state = self.shared.state.lock().expect("queue state lock");
            state.messages.pop_front()
        };

        if message.is_some() {
            self.shared.pop_notify.notify_one();
            self.shared.notify_drain();
        }

        message
    }

    /// Close from the consuming side, so a producer that no longer has an
    /// audience stops early instead of filling the queue.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().expect("queue state lock").messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let (sender, mut receiver) = message_queue(None);
        sender.push(AsgiMessage::HttpRequest { body: b"a".to_vec(), more_body: true }).await.unwrap();
        sender.push(AsgiMessage::HttpRequest { body: b"b".to_vec(), more_body: false }).await.unwrap();

        assert_eq!(receiver.pop().await, Some(AsgiMessage::HttpRequest { body: b"a".to_vec(), more_body: true }));
        assert_eq!(receiver.pop().await, Some(AsgiMessage::HttpRequest { body: b"b".to_vec(), more_body: false }));
    }

    #[tokio::test]
    async fn test_close_to_consumer_drains_first() {
        let (sender, mut receiver) = message_queue(None);
        sender.push(AsgiMessage::HttpDisconnect).await.unwrap();
        sender.close();

        assert_eq!(receiver.pop().await, Some(AsgiMessage::HttpDisconnect));
        assert_eq!(receiver.pop().await, None);
        assert_eq!(sender.push(AsgiMessage::HttpDisconnect).await, Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn test_bounded_try_push() {
        let (sender, mut receiver) = message_queue(Some(1));
        assert_eq!(sender.try_push(AsgiMessage::HttpDisconnect), Ok(()));
        assert_eq!(sender.try_push(AsgiMessage::HttpDisconnect), Err(QueueError::Full));

        assert_eq!(receiver.try_pop(), Some(AsgiMessage::HttpDisconnect));
        assert_eq!(sender.try_push(AsgiMessage::HttpDisconnect), Ok(()));
    }

    #[tokio::test]
    async fn test_bounded_push_waits_for_pop() {
        let (sender, mut receiver) = message_queue(Some(1));
        sender.push(AsgiMessage::LifespanStartup).await.unwrap();

        let producer = tokio::spawn(async move {
            sender.push(AsgiMessage::LifespanShutdown).await.unwrap();
            sender
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(receiver.pop().await, Some(AsgiMessage::LifespanStartup));
        assert_eq!(receiver.pop().await, Some(AsgiMessage::LifespanShutdown));

        let sender = producer.await.unwrap();
        assert!(sender.is_empty());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_late_push() {
        let (sender, mut receiver) = message_queue(None);

        let consumer = tokio::spawn(async move { receiver.pop().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        sender.push(AsgiMessage::HttpDisconnect).await.unwrap();

        assert_eq!(consumer.await.unwrap(), Some(AsgiMessage::HttpDisconnect));
    }

    #[tokio::test]
    async fn test_drain_hook_fires_on_pop() {
        let (sender, mut receiver) = message_queue(None);
        let hook = Arc::new(Notify::new());
        sender.set_drain_hook(Arc::clone(&hook));

        sender.push(AsgiMessage::HttpDisconnect).await.unwrap();
        assert_eq!(receiver.pop().await, Some(AsgiMessage::HttpDisconnect));

        // The permit was stored by the pop above, so this resolves instantly.
        tokio::time::timeout(Duration::from_millis(100), hook.notified()).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_last_sender_closes_queue() {
        let (sender, mut receiver) = message_queue(None);
        let second = sender.clone();

        sender.push(AsgiMessage::HttpDisconnect).await.unwrap();
        drop(sender);
        assert!(!second.is_closed());

        drop(second);
        assert_eq!(receiver.pop().await, Some(AsgiMessage::HttpDisconnect));
        assert_eq!(receiver.pop().await, None);
    }

    #[tokio::test]
    async fn test_receiver_close_rejects_producer() {
        let (sender, receiver) = message_queue(None);
        receiver.close();
        assert_eq!(sender.push(AsgiMessage::HttpDisconnect).await, Err(QueueError::Closed));
    }
}
