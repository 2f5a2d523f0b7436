//! Underflow handling: placeholder deletion, steal, merge and root collapse.
//!
//! A leaf-level node that shrinks below its minimum during reconciliation is
//! padded with placeholder children instead of being rebalanced on the spot.
//! Placeholders are later deleted one at a time; once a node really drops below
//! its minimum it is queued for steal or merge with an adjacent sibling.

use super::BufferTree;
use crate::node::{ChildId, RealParts, Slot, TreeNode};
use crate::observer::Phase;
use arbor_common::{ArborError, Key, NodeId, Result};
use tracing::debug;

impl BufferTree {
    /// Resolves pending underflow and placeholder work.
    ///
    /// Returns true if a buffer had to be queued for emptying first; the driver
    /// then re-runs the emptying phases before calling back.
    pub(super) fn rebalance(&mut self) -> Result<bool> {
        loop {
            if let Some(id) = self.queues.peek_underflow() {
                if self.resolve_underflow(id)? || self.queues.has_emptying() {
                    return Ok(true);
                }
                continue;
            }
            match self.queues.pop_placeholders() {
                Some(id) => self.delete_placeholder(id)?,
                None => return Ok(false),
            }
        }
    }

    /// Removes one placeholder child from `id`.
    fn delete_placeholder(&mut self, id: NodeId) -> Result<()> {
        let _phase = self.store.observe(Phase::PlaceholderDeletion);
        let mut node = self.store.load_node(id)?;
        if !node.pop_placeholder()? {
            return Ok(());
        }

        if node.child_count() < self.min_children(&node) {
            self.queues.push_underflow(id)?;
        } else if node.has_placeholders() {
            self.queues.mark_placeholders(id);
        }
        self.store.store_node(&node)
    }

    /// Steals, merges or collapses for the queued node `id`.
    fn resolve_underflow(&mut self, id: NodeId) -> Result<bool> {
        let node = self.store.load_node(id)?;
        if node.real_child_count() >= self.min_children(&node) {
            self.queues.pop_underflow();
            return Ok(false);
        }

        if self.is_root(&node) {
            self.queues.pop_underflow();
            return self.collapse_root(node);
        }

        if must_empty_first(&node) {
            self.queues.push_emptying(node.id, node.is_internal);
            return Ok(true);
        }

        let parent_id = node
            .parent
            .ok_or_else(|| ArborError::invariant(format!("non-root {} has no parent", id)))?;
        let parent = self.store.load_node(parent_id)?;

        if parent.child_count() == 1 {
            self.queues.pop_underflow();
            let _phase = self.store.observe(Phase::NodeMerge);
            self.detach_empty(node, parent)?;
            return Ok(false);
        }

        let (neighbor_id, is_left) = parent.neighbor_of(id)?;
        let neighbor = self.store.load_node(neighbor_id)?;
        if must_empty_first(&neighbor) {
            self.queues
                .push_emptying(neighbor.id, neighbor.is_internal);
            return Ok(true);
        }

        self.queues.pop_underflow();
        if neighbor.child_count() < self.params.merge_threshold() {
            self.merge_with_neighbor(node, neighbor, parent, is_left)?;
        } else {
            self.steal_from_neighbor(node, neighbor, parent, is_left)?;
        }
        Ok(false)
    }

    /// Absorbs `neighbor` into `node` and drops it from `parent`.
    fn merge_with_neighbor(
        &mut self,
        mut node: TreeNode,
        mut neighbor: TreeNode,
        mut parent: TreeNode,
        is_left: bool,
    ) -> Result<()> {
        let _phase = self.store.observe(Phase::NodeMerge);

        let index = parent.child_index(node.id)?;
        let (separator_index, neighbor_index) = if is_left {
            (index - 1, index - 1)
        } else {
            (index, index + 1)
        };
        let separator = parent.real_handle(separator_index)?;

        let mine = node.take_real_parts()?;
        let theirs = neighbor.take_real_parts()?;
        let moved: Vec<ChildId> = theirs.children.clone();

        let (lower, upper) = if is_left { (theirs, mine) } else { (mine, theirs) };
        let (handles, children) = join(lower, separator, upper);
        node.set_real_parts(handles, children);

        if node.is_internal {
            for child in moved.iter().filter_map(|c| c.as_node()) {
                self.reparent(child, node.id)?;
            }
        }

        parent.handles.remove(separator_index);
        parent.children.remove(neighbor_index);

        self.move_buffer(&neighbor, &mut node)?;
        self.store.delete_node(neighbor.id)?;
        self.queues.forget(neighbor.id);

        debug!(
            node = %node.id,
            absorbed = %neighbor.id,
            children = node.real_child_count(),
            "merged nodes"
        );

        if node.real_child_count() == 0 {
            return self.detach_empty(node, parent);
        }

        self.settle(&mut node)?;
        if self.is_buffer_full(&node) {
            self.queues.push_emptying(node.id, node.is_internal);
        }
        self.store.store_node(&parent)?;
        if parent.real_child_count() < self.min_children(&parent) {
            self.queues.push_underflow(parent.id)?;
        }
        Ok(())
    }

    /// Moves `s` children from the near end of `neighbor` into `node`.
    fn steal_from_neighbor(
        &mut self,
        mut node: TreeNode,
        mut neighbor: TreeNode,
        mut parent: TreeNode,
        is_left: bool,
    ) -> Result<()> {
        let _phase = self.store.observe(Phase::NodeSteal);
        let s = self.params.s;

        let index = parent.child_index(node.id)?;
        let separator_index = if is_left { index - 1 } else { index };
        let separator = parent.real_handle(separator_index)?;

        let mine = node.take_real_parts()?;
        let mut theirs = neighbor.take_real_parts()?;
        if theirs.placeholders > 0 || theirs.children.len() <= s {
            return Err(ArborError::invariant(format!(
                "cannot steal {} children from {} holding {} real and {} placeholders",
                s,
                neighbor.id,
                theirs.children.len(),
                theirs.placeholders
            )));
        }

        let (stolen, new_separator) = if is_left {
            let n = theirs.children.len();
            let children = theirs.children.split_off(n - s);
            let handles = theirs.handles.split_off(n - s);
            let new_separator = theirs.handles.pop().ok_or_else(|| {
                ArborError::invariant(format!("{} has no handle to promote", neighbor.id))
            })?;
            let stolen = RealParts {
                handles,
                children,
                placeholders: 0,
            };
            (stolen, new_separator)
        } else {
            let children: Vec<ChildId> = theirs.children.drain(..s).collect();
            let mut handles: Vec<Key> = theirs.handles.drain(..s).collect();
            let new_separator = handles.pop().ok_or_else(|| {
                ArborError::invariant(format!("{} has no handle to promote", neighbor.id))
            })?;
            let stolen = RealParts {
                handles,
                children,
                placeholders: 0,
            };
            (stolen, new_separator)
        };
        let moved: Vec<ChildId> = stolen.children.clone();

        let (lower, upper) = if is_left { (stolen, mine) } else { (mine, stolen) };
        let (handles, children) = join(lower, separator, upper);
        node.set_real_parts(handles, children);
        neighbor.set_real_parts(theirs.handles, theirs.children);
        parent.handles[separator_index] = Slot::Real(new_separator);

        if node.is_internal {
            for child in moved.iter().filter_map(|c| c.as_node()) {
                self.reparent(child, node.id)?;
            }
        }

        debug!(
            node = %node.id,
            from = %neighbor.id,
            stolen = s,
            separator = new_separator,
            "stole children"
        );

        self.settle(&mut node)?;
        if self.is_buffer_full(&node) {
            self.queues.push_emptying(node.id, node.is_internal);
        }
        self.store.store_node(&neighbor)?;
        self.store.store_node(&parent)
    }

    /// Removes `node`, which has no real children, from `parent`.
    ///
    /// Only reachable with `a = 1`. Elements still buffered at `node` move to
    /// the parent, whose key range covers the node's.
    fn detach_empty(&mut self, node: TreeNode, mut parent: TreeNode) -> Result<()> {
        if node.real_child_count() > 0 {
            return Err(ArborError::invariant(format!(
                "{} detached while holding {} real children",
                node.id,
                node.real_child_count()
            )));
        }

        let index = parent.child_index(node.id)?;
        parent.children.remove(index);
        if !parent.handles.is_empty() {
            let handle = index.min(parent.handles.len() - 1);
            parent.handles.remove(handle);
        }
        self.move_buffer(&node, &mut parent)?;
        self.store.delete_node(node.id)?;
        self.queues.forget(node.id);
        debug!(node = %node.id, parent = %parent.id, "detached empty node");

        self.store.store_node(&parent)?;
        if parent.real_child_count() < self.min_children(&parent) {
            self.queues.push_underflow(parent.id)?;
        }
        Ok(())
    }

    /// Replaces an internal root holding a single child with that child.
    ///
    /// Elements still buffered at the old root move into the child's buffer.
    /// A root left without children turns back into an empty leaf root.
    /// Returns true if the new root's buffer is full and was queued.
    fn collapse_root(&mut self, root: TreeNode) -> Result<bool> {
        let _phase = self.store.observe(Phase::RootCollapse);
        if !root.is_internal || root.child_count() > 1 {
            return Err(ArborError::invariant(format!(
                "root {} cannot collapse with {} children",
                root.id,
                root.child_count()
            )));
        }
        if root.children.is_empty() {
            return self.reset_root(root);
        }

        let mut child = self.store.load_node(root.child_node(0)?)?;
        child.parent = None;
        if child.is_internal && child.children.is_empty() {
            make_empty_leaf(&mut child);
        }
        self.move_buffer(&root, &mut child)?;

        self.root = child.id;
        self.store.store_node(&child)?;
        self.store.delete_node(root.id)?;
        self.queues.forget(root.id);
        debug!(old_root = %root.id, new_root = %child.id, "root collapsed");

        // With a = 1 the promoted node may itself hold a single child.
        if child.is_internal && child.child_count() < self.min_children(&child) {
            self.queues.push_underflow(child.id)?;
        }
        let full = self.is_buffer_full(&child);
        if full {
            self.queues.push_emptying(child.id, child.is_internal);
        }
        Ok(full)
    }

    /// Turns an internal root without children into an empty leaf root.
    fn reset_root(&mut self, mut root: TreeNode) -> Result<bool> {
        make_empty_leaf(&mut root);
        self.store.store_node(&root)?;
        debug!(root = %root.id, "root emptied");

        let full = self.is_buffer_full(&root);
        if full {
            self.queues.push_emptying(root.id, false);
        }
        Ok(full)
    }

    /// Appends every element buffered at `from` to `to` and drops `from`'s blocks.
    fn move_buffer(&self, from: &TreeNode, to: &mut TreeNode) -> Result<()> {
        for block in &from.buffer_blocks {
            let elements = self.store.read_block(*block)?;
            self.store.append_or_create_block(to, &elements)?;
            self.store.delete_block(*block)?;
        }
        Ok(())
    }

    /// Pads `node` back to its minimum if needed and writes it.
    ///
    /// Only leaf-level nodes are padded with placeholders.
    fn settle(&mut self, node: &mut TreeNode) -> Result<()> {
        let min = self.min_children(node);
        if !node.is_internal && node.child_count() < min {
            node.pad_placeholders(min);
            self.queues.mark_placeholders(node.id);
        } else {
            self.queues.clear_placeholders(node.id);
        }
        self.store.store_node(node)
    }
}

/// Whether `node` must empty its buffer before it can be rebalanced.
///
/// An internal node without children has nowhere to route its buffer, so the
/// buffer travels with the node instead.
fn must_empty_first(node: &TreeNode) -> bool {
    node.has_buffer() && (!node.is_internal || node.real_child_count() > 0)
}

fn make_empty_leaf(node: &mut TreeNode) {
    node.is_internal = false;
    node.handles.clear();
    node.children.clear();
}

/// Concatenates two adjacent fan-outs around their separator.
///
/// The separator is kept only when both sides hold children.
fn join(lower: RealParts, separator: Key, upper: RealParts) -> (Vec<Key>, Vec<ChildId>) {
    let mut handles = lower.handles;
    if !lower.children.is_empty() && !upper.children.is_empty() {
        handles.push(separator);
    }
    handles.extend(upper.handles);

    let mut children = lower.children;
    children.extend(upper.children);
    (handles, children)
}
