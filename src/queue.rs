use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};

/// Fixed-fan-out chain node. Slots are write-once and nodes link forward
/// through shared ownership, so any number of snapshots can keep reading a
/// node while the live queue appends into later slots or later nodes.
struct Node<T, const N: usize> {
    slots: [OnceLock<T>; N],
    next: OnceLock<Arc<Node<T, N>>>,
}

impl<T, const N: usize> Node<T, N> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: std::array::from_fn(|_| OnceLock::new()),
            next: OnceLock::new(),
        })
    }
}

/// An append-only FIFO queue supporting O(1) snapshots.
///
/// Elements live in a chain of fixed-capacity nodes shared between the live
/// queue and its snapshots. Slots are never rewritten: the live queue only
/// fills slots past every snapshot's recorded end, and dequeues only move
/// the live head position. A snapshot therefore sees exactly the elements
/// that were present at capture time, forever, without copying any of them.
///
/// Mutation follows a single-writer discipline (`&mut self`); snapshots may
/// be read concurrently with it and with each other.
pub struct PersistentQueue<T, const N: usize> {
    head: Arc<Node<T, N>>,
    tail: Arc<Node<T, N>>,
    /// Next slot to dequeue within the head node.
    head_offset: usize,
    /// Next free slot within the tail node.
    tail_offset: usize,
    len: usize,
}

impl<T, const N: usize> PersistentQueue<T, N> {
    pub fn new() -> Self {
        assert!(N > 0, "node fan-out must be positive");
        let node = Node::new();
        Self {
            head: node.clone(),
            tail: node,
            head_offset: 0,
            tail_offset: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends an element at the tail.
    pub fn enqueue(&mut self, value: T) {
        if self.tail_offset == N {
            let node = Node::new();
            if self.tail.next.set(node.clone()).is_err() {
                unreachable!("tail node already has a successor");
            }
            self.tail = node;
            self.tail_offset = 0;
        }
        if self.tail.slots[self.tail_offset].set(value).is_err() {
            unreachable!("tail slot already written");
        }
        self.tail_offset += 1;
        self.len += 1;
    }

    /// Removes and returns the head element.
    ///
    /// The element is cloned out because snapshots taken before this call
    /// still expose it.
    pub fn dequeue(&mut self) -> Result<T>
    where
        T: Clone,
    {
        if self.len == 0 {
            return Err(Error::EmptyQueue);
        }
        if self.head_offset == N {
            let next = self
                .head
                .next
                .get()
                .cloned()
                .expect("non-empty queue has a successor node");
            self.head = next;
            self.head_offset = 0;
        }
        let value = self.head.slots[self.head_offset]
            .get()
            .cloned()
            .expect("queued slot is initialized");
        self.head_offset += 1;
        self.len -= 1;
        Ok(value)
    }

    /// Iterates from the current head to the current tail in enqueue order.
    ///
    /// The iterator is invalidated (statically, via the borrow) by any
    /// mutation; take a snapshot for a mutation-immune view.
    pub fn iter(&self) -> Iter<'_, T, N> {
        Iter {
            node: &self.head,
            offset: self.head_offset,
            remaining: self.len,
        }
    }

    /// Captures the queue's content at this instant without copying
    /// elements. O(1).
    pub fn snapshot(&self) -> PersistentQueueSnapshot<T, N> {
        PersistentQueueSnapshot {
            head: self.head.clone(),
            head_offset: self.head_offset,
            len: self.len,
        }
    }
}

impl<T, const N: usize> Default for PersistentQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// A read-only view of a [`PersistentQueue`] fixed at the moment of capture.
///
/// Independently droppable; the underlying nodes are released once neither
/// the live queue nor any snapshot references them.
pub struct PersistentQueueSnapshot<T, const N: usize> {
    head: Arc<Node<T, N>>,
    head_offset: usize,
    len: usize,
}

impl<T, const N: usize> PersistentQueueSnapshot<T, N> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> Iter<'_, T, N> {
        Iter {
            node: &self.head,
            offset: self.head_offset,
            remaining: self.len,
        }
    }
}

impl<T, const N: usize> Clone for PersistentQueueSnapshot<T, N> {
    fn clone(&self) -> Self {
        Self {
            head: self.head.clone(),
            head_offset: self.head_offset,
            len: self.len,
        }
    }
}

pub struct Iter<'a, T, const N: usize> {
    node: &'a Node<T, N>,
    offset: usize,
    remaining: usize,
}

impl<'a, T, const N: usize> Iterator for Iter<'a, T, N> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        if self.remaining == 0 {
            return None;
        }
        if self.offset == N {
            self.node = self
                .node
                .next
                .get()
                .expect("iterator within bounds has a successor node");
            self.offset = 0;
        }
        let value = self.node.slots[self.offset]
            .get()
            .expect("slot within bounds is initialized");
        self.offset += 1;
        self.remaining -= 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, T, const N: usize> ExactSizeIterator for Iter<'a, T, N> {}
