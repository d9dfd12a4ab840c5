use std::cmp::Ordering;
use std::collections::BinaryHeap;

use petgraph::graph::NodeIndex;

#[derive(Debug, Clone, Copy)]
struct Ready {
    priority: f32,
    index: NodeIndex,
}

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ready {}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.index.cmp(&self.index))
    }
}

/// Max-heap of targets whose children are all done.
#[derive(Debug, Default)]
pub(crate) struct ReadyQueue {
    heap: BinaryHeap<Ready>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, index: NodeIndex, priority: f32) {
        self.heap.push(Ready { priority, index });
    }

    /// Removes the target with the highest priority.
    pub fn pop(&mut self) -> Option<NodeIndex> {
        self.heap.pop().map(|ready| ready.index)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pops_highest_first() {
        let mut queue = ReadyQueue::new();
        for (i, priority) in [2.0, 9.0, 3.0, 8.0, 5.0, 6.0, 4.0, 1.0, 7.0].into_iter().enumerate() {
            queue.insert(NodeIndex::new(i), priority);
        }
        assert_eq!(queue.len(), 9);

        let order: Vec<_> = std::iter::from_fn(|| queue.pop()).map(|i| i.index()).collect();
        assert_eq!(order, vec![1, 3, 8, 5, 4, 6, 2, 0, 7]);
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_ties_are_stable_by_index() {
        let mut queue = ReadyQueue::new();
        queue.insert(NodeIndex::new(3), 1.0);
        queue.insert(NodeIndex::new(1), 1.0);
        queue.insert(NodeIndex::new(2), 1.0);

        assert_eq!(queue.pop(), Some(NodeIndex::new(1)));
        assert_eq!(queue.pop(), Some(NodeIndex::new(2)));
        assert_eq!(queue.pop(), Some(NodeIndex::new(3)));
    }
}
