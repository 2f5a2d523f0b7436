//! Node splitting and the upward split cascade.

use super::BufferTree;
use crate::node::{ChildId, Slot, TreeNode};
use crate::observer::Phase;
use arbor_common::{Key, NodeId, Result};
use tracing::debug;

impl BufferTree {
    /// Splits an overflowing `node` and every ancestor that overflows in turn.
    ///
    /// `node` is written back before its ancestors are split and reloaded
    /// afterwards, since an ancestor split may re-parent it.
    pub(super) fn split_cascade(&mut self, node: &mut TreeNode) -> Result<()> {
        let mut parent = self.split_node(node)?;
        self.store.store_node(node)?;

        while parent.child_count() > self.params.b {
            let grandparent = self.split_node(&mut parent)?;
            self.store.store_node(&parent)?;
            parent = grandparent;
        }
        self.store.store_node(&parent)?;

        *node = self.store.load_node(node.id)?;
        Ok(())
    }

    /// Splits `node`, which holds exactly `b + 1` children.
    ///
    /// A new left sibling takes the lower half and is written to disk; `node`
    /// keeps the upper half and its identifier but is not written. Returns the
    /// updated, unwritten parent, which is a fresh root if `node` was the root.
    pub(super) fn split_node(&mut self, node: &mut TreeNode) -> Result<TreeNode> {
        let _phase = self.store.observe(Phase::NodeSplit);

        let half = node.split_off_left(self.params.b)?;
        let mut parent = match node.parent {
            Some(parent_id) => self.store.load_node(parent_id)?,
            None => self.grow_root(node),
        };

        let mut left = TreeNode {
            id: self.store.new_node_id(),
            is_internal: node.is_internal,
            handles: half.handles,
            children: half.children,
            buffer_blocks: Vec::new(),
            last_block_len: 0,
            parent: Some(parent.id),
        };

        let index = parent.child_index(node.id)?;
        parent
            .children
            .insert(index, Slot::Real(ChildId::Node(left.id)));
        parent.handles.insert(index, Slot::Real(half.promoted));

        if node.is_internal {
            for child_id in left.child_nodes()? {
                self.reparent(child_id, left.id)?;
            }
        }
        if node.has_buffer() {
            self.redistribute_buffer(node, &mut left, half.promoted)?;
        }
        self.store.store_node(&left)?;

        debug!(
            node = %node.id,
            left = %left.id,
            parent = %parent.id,
            promoted = half.promoted,
            "split node"
        );
        Ok(parent)
    }

    /// Places a new internal root above `node` and returns it unwritten.
    fn grow_root(&mut self, node: &mut TreeNode) -> TreeNode {
        let mut root = TreeNode::new_internal(self.store.new_node_id(), None);
        root.children.push(Slot::Real(ChildId::Node(node.id)));
        node.parent = Some(root.id);
        self.root = root.id;
        debug!(old_root = %node.id, new_root = %root.id, "root grows");
        root
    }

    /// Rewrites the parent pointer of a stored node.
    pub(super) fn reparent(&self, child: NodeId, parent: NodeId) -> Result<()> {
        let mut node = self.store.load_node(child)?;
        node.parent = Some(parent);
        self.store.store_node(&node)
    }

    /// Moves buffered elements with keys up to `promoted` from `right` to `left`.
    fn redistribute_buffer(
        &self,
        right: &mut TreeNode,
        left: &mut TreeNode,
        promoted: Key,
    ) -> Result<()> {
        let blocks = std::mem::take(&mut right.buffer_blocks);
        right.last_block_len = 0;

        let mut elements = Vec::new();
        for block in &blocks {
            elements.extend(self.store.read_block(*block)?);
        }
        let (lower, upper): (Vec<_>, Vec<_>) =
            elements.into_iter().partition(|e| e.key <= promoted);

        self.store.append_or_create_block(left, &lower)?;
        self.store.append_or_create_block(right, &upper)?;
        for block in blocks {
            self.store.delete_block(block)?;
        }
        debug!(
            left = %left.id,
            right = %right.id,
            lower = lower.len(),
            upper = upper.len(),
            "redistributed buffer on split"
        );
        Ok(())
    }
}
