//! Change feed for observing entity writes.
//!
//! Every add, update and delete publishes one [`ChangeEvent`] after the
//! write is complete. Subscribers receive events on unbounded channels, in
//! the order they subscribed. A bounded history supports catch-up polling.
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut changes = engine.subscribe();
//! tokio::spawn(async move {
//!     while let Some(event) = changes.recv().await {
//!         println!("{:?} {}", event.change_type, event.entity_id);
//!     }
//! });
//! ```

use crate::entity::EntityId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Default number of events kept for polling.
pub const DEFAULT_CHANGE_HISTORY: usize = 10_000;

/// Type of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    /// Entity was added.
    Added,
    /// Entity was replaced with a new version.
    Updated,
    /// Entity was deleted.
    Deleted,
}

/// A single change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Position in the feed, starting at 1.
    pub sequence: u64,
    /// The changed entity.
    pub entity_id: EntityId,
    /// Type of change.
    pub change_type: ChangeType,
    /// Serialized entity for Added/Updated; `None` for Deleted.
    pub payload: Option<Vec<u8>>,
}

struct FeedState {
    next_sequence: u64,
    subscribers: Vec<UnboundedSender<ChangeEvent>>,
    history: VecDeque<ChangeEvent>,
}

/// Distributes change events to subscribers.
pub struct ChangeFeed {
    state: Mutex<FeedState>,
    max_history: usize,
}

impl ChangeFeed {
    /// Creates a feed keeping the default history.
    pub fn new() -> Self {
        Self::with_max_history(DEFAULT_CHANGE_HISTORY)
    }

    /// Creates a feed keeping at most `max_history` events for polling.
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            state: Mutex::new(FeedState {
                next_sequence: 1,
                subscribers: Vec::new(),
                history: VecDeque::new(),
            }),
            max_history,
        }
    }

    /// Subscribes to all future events.
    ///
    /// Dropping the receiver unsubscribes at the next publish.
    pub fn subscribe(&self) -> UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().subscribers.push(tx);
        rx
    }

    /// Publishes a change and returns its sequence number.
    pub fn publish(
        &self,
        entity_id: EntityId,
        change_type: ChangeType,
        payload: Option<Vec<u8>>,
    ) -> u64 {
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let event = ChangeEvent {
            sequence,
            entity_id,
            change_type,
            payload,
        };

        if self.max_history > 0 {
            if state.history.len() == self.max_history {
                state.history.pop_front();
            }
            state.history.push_back(event.clone());
        }
        state
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
        sequence
    }

    /// Returns up to `limit` events with a sequence above `cursor`.
    pub fn poll(&self, cursor: u64, limit: usize) -> Vec<ChangeEvent> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|e| e.sequence > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Returns the sequence of the last published event, or 0.
    pub fn latest_sequence(&self) -> u64 {
        self.state.lock().next_sequence - 1
    }

    /// Returns the number of live subscribers as of the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Returns the number of events held for polling.
    pub fn history_len(&self) -> usize {
        self.state.lock().history.len()
    }

    /// Drops every subscriber, ending their streams.
    pub fn close(&self) {
        self.state.lock().subscribers.clear();
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ChangeFeed")
            .field("latest_sequence", &(state.next_sequence - 1))
            .field("subscribers", &state.subscribers.len())
            .field("history", &state.history.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn id(n: u8) -> EntityId {
        EntityId::from_bytes([n; 16])
    }

    #[tokio::test]
    async fn publish_and_receive() {
        let feed = ChangeFeed::new();
        let mut rx = feed.subscribe();

        let seq = feed.publish(id(1), ChangeType::Added, Some(vec![1, 2, 3]));
        assert_eq!(seq, 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.sequence, 1);
        assert_eq!(event.entity_id, id(1));
        assert_eq!(event.change_type, ChangeType::Added);
        assert_eq!(event.payload, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let feed = ChangeFeed::new();
        let mut rx1 = feed.subscribe();
        let mut rx2 = feed.subscribe();

        feed.publish(id(1), ChangeType::Added, Some(vec![]));
        feed.publish(id(1), ChangeType::Deleted, None);

        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(rx.recv().await.unwrap().change_type, ChangeType::Added);
            assert_eq!(rx.recv().await.unwrap().change_type, ChangeType::Deleted);
        }
    }

    #[test]
    fn dropped_subscriber_is_removed() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);
        drop(rx);
        feed.publish(id(1), ChangeType::Added, None);
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn poll_from_cursor() {
        let feed = ChangeFeed::new();
        for n in 1..=5 {
            feed.publish(id(n), ChangeType::Added, None);
        }
        let events = feed.poll(2, 10);
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![3, 4, 5]);
        assert_eq!(feed.poll(0, 2).len(), 2);
        assert_eq!(feed.latest_sequence(), 5);
    }

    #[test]
    fn history_is_bounded() {
        let feed = ChangeFeed::with_max_history(3);
        for n in 1..=10 {
            feed.publish(id(n), ChangeType::Updated, None);
        }
        assert_eq!(feed.history_len(), 3);
        assert_eq!(feed.poll(0, 100)[0].sequence, 8);

        let silent = ChangeFeed::with_max_history(0);
        silent.publish(id(1), ChangeType::Added, None);
        assert_eq!(silent.history_len(), 0);
        assert_eq!(silent.latest_sequence(), 1);
    }

    #[tokio::test]
    async fn close_ends_streams() {
        let feed = ChangeFeed::new();
        let mut rx = feed.subscribe();
        feed.close();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn concurrent_publishers_keep_sequence_order() {
        let feed = Arc::new(ChangeFeed::new());
        let mut rx = feed.subscribe();

        let mut tasks = Vec::new();
        for n in 0..4u8 {
            let feed = Arc::clone(&feed);
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    feed.publish(id(n), ChangeType::Added, None);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut last = 0;
        for _ in 0..100 {
            let event = rx.recv().await.unwrap();
            assert!(event.sequence > last);
            last = event.sequence;
        }
    }
}
