//! Priority worklist of pending cross-references.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use super::xref::XRef;

/// Heap entry ordered by xref priority, then by insertion sequence so
/// entries of equal priority come out first-in first-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pending {
    xref: XRef,
    sequence: u64,
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.xref.xref_type, self.sequence).cmp(&(other.xref.xref_type, other.sequence))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-priority queue over [`XRefType`](super::xref::XRefType) order.
#[derive(Debug, Clone, Default)]
pub struct Worklist {
    heap: BinaryHeap<Reverse<Pending>>,
    sequence: u64,
}

impl Worklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, xref: XRef) {
        self.heap.push(Reverse(Pending {
            xref,
            sequence: self.sequence,
        }));
        self.sequence += 1;
    }

    /// Highest-priority entry; oldest first among equals.
    pub fn pop(&mut self) -> Option<XRef> {
        self.heap.pop().map(|Reverse(pending)| pending.xref)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
