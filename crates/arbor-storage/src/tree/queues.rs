//! Typed work queues owned by the tree driver.

use arbor_common::{ArborError, NodeId, Result};
use std::collections::VecDeque;

/// Pending work, drained to a fixed point by [`super::BufferTree`].
#[derive(Debug, Default)]
pub(crate) struct WorkQueues {
    /// Internal nodes whose buffers must be emptied. LIFO.
    internal: VecDeque<NodeId>,
    /// Leaf-level nodes whose buffers must be reconciled. FIFO.
    leaf: VecDeque<NodeId>,
    /// The node waiting for steal or merge. Holds at most one entry.
    underflow: VecDeque<NodeId>,
    /// Leaf-level nodes padded with placeholder children.
    placeholders: VecDeque<NodeId>,
}

impl WorkQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a node for buffer emptying on the queue matching its kind.
    pub fn push_emptying(&mut self, id: NodeId, is_internal: bool) {
        if is_internal {
            if !self.internal.contains(&id) {
                self.internal.push_front(id);
            }
        } else if !self.leaf.contains(&id) {
            self.leaf.push_back(id);
        }
    }

    pub fn pop_internal(&mut self) -> Option<NodeId> {
        self.internal.pop_front()
    }

    pub fn pop_leaf(&mut self) -> Option<NodeId> {
        self.leaf.pop_front()
    }

    pub fn has_emptying(&self) -> bool {
        !self.internal.is_empty() || !self.leaf.is_empty()
    }

    /// Queues `id` for steal or merge.
    ///
    /// A different node already waiting means two nodes underflow at once,
    /// which the rebalancing logic never produces.
    pub fn push_underflow(&mut self, id: NodeId) -> Result<()> {
        match self.underflow.front() {
            None => {
                self.underflow.push_back(id);
                Ok(())
            }
            Some(queued) if *queued == id => Ok(()),
            Some(queued) => Err(ArborError::invariant(format!(
                "{} underflows while {} is still queued for rebalancing",
                id, queued
            ))),
        }
    }

    pub fn peek_underflow(&self) -> Option<NodeId> {
        self.underflow.front().copied()
    }

    pub fn pop_underflow(&mut self) -> Option<NodeId> {
        self.underflow.pop_front()
    }

    /// Records that `id` holds placeholder children.
    pub fn mark_placeholders(&mut self, id: NodeId) {
        if !self.placeholders.contains(&id) {
            self.placeholders.push_back(id);
        }
    }

    /// Records that `id` no longer holds placeholder children.
    pub fn clear_placeholders(&mut self, id: NodeId) {
        self.placeholders.retain(|queued| *queued != id);
    }

    pub fn pop_placeholders(&mut self) -> Option<NodeId> {
        self.placeholders.pop_front()
    }

    /// Drops every reference to a deleted node.
    pub fn forget(&mut self, id: NodeId) {
        self.internal.retain(|queued| *queued != id);
        self.leaf.retain(|queued| *queued != id);
        self.underflow.retain(|queued| *queued != id);
        self.placeholders.retain(|queued| *queued != id);
    }

    /// Returns true when no work of any kind is pending.
    pub fn is_idle(&self) -> bool {
        self.internal.is_empty()
            && self.leaf.is_empty()
            && self.underflow.is_empty()
            && self.placeholders.is_empty()
    }

    pub fn clear(&mut self) {
        self.internal.clear();
        self.leaf.clear();
        self.underflow.clear();
        self.placeholders.clear();
    }
}
