//! Structural validation and in-order leaf scans.

use super::BufferTree;
use crate::node::{ChildId, Slot, TreeNode};
use arbor_common::{ArborError, Key, NodeId, Result};
use std::collections::HashSet;

/// Summary of a validated tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeShape {
    /// Levels of nodes; a lone leaf-level root has height 1.
    pub height: usize,
    pub internal_nodes: usize,
    pub leaf_nodes: usize,
    pub leaf_blocks: usize,
    /// Live keys across all leaf blocks.
    pub keys: usize,
    /// Buffer blocks still held by any node.
    pub buffered_blocks: usize,
}

/// Open-closed key range `(lower, upper]` a subtree must respect.
#[derive(Debug, Clone, Copy)]
struct KeyRange {
    lower: Option<Key>,
    upper: Option<Key>,
}

impl KeyRange {
    const ALL: KeyRange = KeyRange {
        lower: None,
        upper: None,
    };

    fn contains(&self, key: Key) -> bool {
        self.lower.map_or(true, |lo| key > lo) && self.upper.map_or(true, |hi| key <= hi)
    }

    /// Range of child `i` given the node's handles.
    fn child(&self, handles: &[Key], i: usize) -> KeyRange {
        KeyRange {
            lower: if i == 0 { self.lower } else { Some(handles[i - 1]) },
            upper: handles.get(i).copied().or(self.upper),
        }
    }
}

struct Checker<'a> {
    tree: &'a BufferTree,
    seen: HashSet<NodeId>,
    leaf_depth: Option<usize>,
    shape: TreeShape,
}

impl BufferTree {
    /// Walks the whole tree and verifies the a-b tree invariants.
    ///
    /// Intended for quiescent trees: placeholders are reported as violations.
    pub fn check_invariants(&self) -> Result<TreeShape> {
        let mut checker = Checker {
            tree: self,
            seen: HashSet::new(),
            leaf_depth: None,
            shape: TreeShape::default(),
        };
        checker.visit(self.root, None, KeyRange::ALL, 1)?;
        checker.shape.height = checker.leaf_depth.unwrap_or(1);
        Ok(checker.shape)
    }

    /// All keys in the leaf blocks, left to right.
    ///
    /// Updates still buffered in nodes or in the top buffer are not included.
    pub fn leaf_keys(&self) -> Result<Vec<Key>> {
        let mut keys = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let node = self.store.load_node(id)?;
            if node.is_internal {
                stack.extend(node.child_nodes()?.into_iter().rev());
            } else {
                for leaf in node.leaf_ids()? {
                    keys.extend(self.store.load_leaf(leaf)?);
                }
            }
        }
        Ok(keys)
    }
}

impl Checker<'_> {
    fn visit(
        &mut self,
        id: NodeId,
        parent: Option<NodeId>,
        range: KeyRange,
        depth: usize,
    ) -> Result<()> {
        if !self.seen.insert(id) {
            return Err(violation(id, "reachable twice"));
        }
        let node = self.tree.store.load_node(id)?;
        if node.parent != parent {
            return Err(violation(
                id,
                &format!("parent is {:?}, expected {:?}", node.parent, parent),
            ));
        }
        self.check_fanout(&node)?;
        self.shape.buffered_blocks += node.buffer_blocks.len();

        let handles: Vec<Key> = node.handles.iter().filter_map(|h| h.real()).collect();
        for pair in handles.windows(2) {
            if pair[0] >= pair[1] {
                return Err(violation(id, "handles not strictly ascending"));
            }
        }
        if let Some(bad) = handles.iter().find(|h| !range.contains(**h)) {
            return Err(violation(id, &format!("handle {} outside {:?}", bad, range)));
        }

        if node.is_internal {
            self.shape.internal_nodes += 1;
            for (i, child) in node.child_nodes()?.into_iter().enumerate() {
                self.visit(child, Some(id), range.child(&handles, i), depth + 1)?;
            }
            return Ok(());
        }

        self.shape.leaf_nodes += 1;
        match self.leaf_depth {
            None => self.leaf_depth = Some(depth),
            Some(expected) if expected != depth => {
                return Err(violation(
                    id,
                    &format!("leaf level at depth {}, expected {}", depth, expected),
                ));
            }
            Some(_) => {}
        }

        for (i, leaf) in node.leaf_ids()?.into_iter().enumerate() {
            let keys = self.tree.store.load_leaf(leaf)?;
            let leaf_range = range.child(&handles, i);
            if keys.is_empty() || keys.len() > self.tree.params.leaf_block {
                return Err(violation(
                    id,
                    &format!("{} holds {} keys", leaf, keys.len()),
                ));
            }
            if keys.windows(2).any(|pair| pair[0] >= pair[1]) {
                return Err(violation(id, &format!("{} keys not strictly ascending", leaf)));
            }
            if let Some(bad) = keys.iter().find(|k| !leaf_range.contains(**k)) {
                return Err(violation(
                    id,
                    &format!("{} key {} outside {:?}", leaf, bad, leaf_range),
                ));
            }
            self.shape.leaf_blocks += 1;
            self.shape.keys += keys.len();
        }
        Ok(())
    }

    fn check_fanout(&self, node: &TreeNode) -> Result<()> {
        let params = &self.tree.params;
        let is_root = node.id == self.tree.root;
        let count = node.child_count();
        let min = params.min_children(is_root, node.is_internal);
        if count < min || count > params.b {
            return Err(violation(
                node.id,
                &format!("{} children, allowed {}..={}", count, min, params.b),
            ));
        }
        if node.handles.len() != count.saturating_sub(1) {
            return Err(violation(
                node.id,
                &format!("{} handles for {} children", node.handles.len(), count),
            ));
        }
        if node.has_placeholders() || node.handles.iter().any(Slot::is_placeholder) {
            return Err(violation(node.id, "placeholders at rest"));
        }

        let kind_ok = node.children.iter().all(|c| match c {
            Slot::Real(ChildId::Node(_)) => node.is_internal,
            Slot::Real(ChildId::Leaf(_)) => !node.is_internal,
            Slot::Placeholder => false,
        });
        if !kind_ok {
            return Err(violation(node.id, "child kind does not match node kind"));
        }
        Ok(())
    }
}

fn violation(id: NodeId, what: &str) -> ArborError {
    ArborError::invariant(format!("{}: {}", id, what))
}
