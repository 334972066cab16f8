//! Priority queue of transactions with egress ready to send.
//!
//! Ordering is lexicographic on (priority, sequence number): lower priority
//! values go first and equal priorities are served in creation order, so an
//! older transaction is never starved by a newer one of the same priority.
//! The sequence number is assigned per session and is independent of stream
//! id reuse.

use crate::codec::StreamId;

use std::collections::{BTreeSet, HashMap};

/// Egress priority; lower values are more urgent.
pub type Priority = u8;

#[derive(Debug, Default)]
pub struct EgressQueue {
    order: BTreeSet<(Priority, u32, StreamId)>,
    keys: HashMap<StreamId, (Priority, u32)>,
}

impl EgressQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a transaction. Re-adding updates its position.
    pub fn push(&mut self, stream_id: StreamId, priority: Priority, seq_no: u32) {
        if let Some((p, s)) = self.keys.insert(stream_id, (priority, seq_no)) {
            self.order.remove(&(p, s, stream_id));
        }
        self.order.insert((priority, seq_no, stream_id));
    }

    /// Remove a transaction; returns false if it was not queued.
    pub fn remove(&mut self, stream_id: StreamId) -> bool {
        match self.keys.remove(&stream_id) {
            Some((p, s)) => {
                self.order.remove(&(p, s, stream_id));
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, stream_id: StreamId) -> bool {
        self.keys.contains_key(&stream_id)
    }

    /// Most urgent transaction, if any.
    pub fn front(&self) -> Option<StreamId> {
        self.order.first().map(|&(_, _, id)| id)
    }

    /// Queued transactions in service order.
    pub fn ordered(&self) -> Vec<StreamId> {
        self.order.iter().map(|&(_, _, id)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> StreamId {
        StreamId::new(n)
    }

    #[test]
    fn test_priority_then_sequence() {
        let mut queue = EgressQueue::new();
        queue.push(id(1), 3, 0);
        queue.push(id(3), 0, 1);
        queue.push(id(5), 3, 2);
        queue.push(id(7), 1, 3);

        assert_eq!(queue.ordered(), vec![id(3), id(7), id(1), id(5)]);
        assert_eq!(queue.front(), Some(id(3)));
    }

    #[test]
    fn test_sequence_not_stream_id_breaks_ties() {
        let mut queue = EgressQueue::new();
        // a reused low stream id created later must not jump ahead
        queue.push(id(9), 2, 4);
        queue.push(id(1), 2, 5);
        assert_eq!(queue.ordered(), vec![id(9), id(1)]);
    }

    #[test]
    fn test_push_twice_repositions() {
        let mut queue = EgressQueue::new();
        queue.push(id(1), 3, 0);
        queue.push(id(3), 3, 1);
        queue.push(id(3), 0, 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.ordered(), vec![id(3), id(1)]);
    }

    #[test]
    fn test_remove() {
        let mut queue = EgressQueue::new();
        queue.push(id(1), 3, 0);
        assert!(queue.contains(id(1)));
        assert!(queue.remove(id(1)));
        assert!(!queue.remove(id(1)));
        assert!(queue.is_empty());
        assert_eq!(queue.front(), None);
    }

    #[test]
    fn test_clear() {
        let mut queue = EgressQueue::new();
        queue.push(id(1), 3, 0);
        queue.push(id(3), 3, 1);
        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.ordered().is_empty());
    }
}
