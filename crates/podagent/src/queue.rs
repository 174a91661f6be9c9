//! Deduplicating FIFO of pending attachment reconciliations.
//!
//! At most one event per attachment is ever queued. Enqueueing the opposite
//! intent for an already-queued attachment removes both: the expected state
//! on disk is the source of truth, so when an add and a delete have both
//! been superseded before processing there is nothing left to do until the
//! observer writes again.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOp {
    Add,
    Delete,
}

/// Identifies one secondary-network attachment on this node.
///
/// The event payload deliberately carries no parameters; they are recovered
/// from the config store at processing time, which keeps queued events valid
/// across expected-state changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttachmentTuple {
    pub pod_name: String,
    pub network_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub op: EventOp,
    pub tuple: AttachmentTuple,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<Event>,
    index: HashMap<AttachmentTuple, EventOp>,
}

/// FIFO with a per-attachment index and an async blocking consumer.
pub struct EventQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    /// Push an event unless the attachment is already queued.
    ///
    /// A queued event with the same intent absorbs the new one; a queued
    /// event with the opposite intent cancels against it and both are
    /// dropped.
    pub fn enqueue(&self, event: Event) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(&pending) = inner.index.get(&event.tuple) {
            if pending != event.op {
                debug!(
                    pod_name = %event.tuple.pod_name,
                    network_name = %event.tuple.network_name,
                    "Opposing events cancel each other, removing both"
                );
                let tuple = event.tuple;
                inner.queue.retain(|queued| queued.tuple != tuple);
                inner.index.remove(&tuple);
            }
            return;
        }

        debug!(
            pod_name = %event.tuple.pod_name,
            network_name = %event.tuple.network_name,
            op = ?event.op,
            "Enqueuing event"
        );
        inner.index.insert(event.tuple.clone(), event.op);
        inner.queue.push_back(event);
        drop(inner);

        self.notify.notify_one();
    }

    /// Remove and return the oldest event, waiting while the queue is empty.
    pub async fn next(&self) -> Event {
        loop {
            if let Some(event) = self.try_dequeue() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    /// Remove and return the oldest event, or `None` when empty.
    pub fn try_dequeue(&self) -> Option<Event> {
        let mut inner = self.inner.lock().unwrap();
        let event = inner.queue.pop_front()?;
        inner.index.remove(&event.tuple);
        Some(event)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn event(op: EventOp, pod: &str, network: &str) -> Event {
        Event {
            op,
            tuple: AttachmentTuple {
                pod_name: pod.to_string(),
                network_name: network.to_string(),
            },
        }
    }

    #[test]
    fn dequeues_in_fifo_order() {
        let queue = EventQueue::new();
        queue.enqueue(event(EventOp::Add, "pod-a", "blue"));
        queue.enqueue(event(EventOp::Add, "pod-b", "blue"));
        queue.enqueue(event(EventOp::Add, "pod-a", "red"));

        assert_eq!(queue.try_dequeue().unwrap().tuple.pod_name, "pod-a");
        assert_eq!(queue.try_dequeue().unwrap().tuple.pod_name, "pod-b");
        assert_eq!(queue.try_dequeue().unwrap().tuple.network_name, "red");
        assert!(queue.try_dequeue().is_none());
    }

    #[test]
    fn same_intent_is_deduplicated() {
        let queue = EventQueue::new();
        queue.enqueue(event(EventOp::Add, "pod", "blue"));
        queue.enqueue(event(EventOp::Add, "pod", "blue"));

        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn opposing_intents_cancel() {
        let queue = EventQueue::new();
        queue.enqueue(event(EventOp::Add, "pod", "blue"));
        queue.enqueue(event(EventOp::Delete, "pod", "blue"));

        assert!(queue.is_empty());

        // the attachment is reusable after the squash
        queue.enqueue(event(EventOp::Delete, "pod", "blue"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_dequeue().unwrap().op, EventOp::Delete);
    }

    #[test]
    fn squash_leaves_other_attachments_queued() {
        let queue = EventQueue::new();
        queue.enqueue(event(EventOp::Add, "pod", "blue"));
        queue.enqueue(event(EventOp::Add, "pod", "red"));
        queue.enqueue(event(EventOp::Delete, "pod", "blue"));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_dequeue().unwrap().tuple.network_name, "red");
    }

    #[tokio::test]
    async fn next_wakes_on_enqueue() {
        let queue = Arc::new(EventQueue::new());

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };

        // give the consumer a chance to park on the empty queue
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(event(EventOp::Add, "pod", "blue"));

        let received = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.tuple.network_name, "blue");
        assert!(queue.is_empty());
    }
}
