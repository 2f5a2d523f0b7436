//! Buffer emptying for internal and leaf-level nodes.

use super::BufferTree;
use crate::element::{sort_and_collapse, BufferElement};
use crate::node::{ChildId, Slot};
use crate::observer::Phase;
use crate::sort::{merge_runs, write_sorted_run};
use crate::store::{NodeStore, RunReader};
use arbor_common::{ArborError, BlockId, Key, LeafId, NodeId, Result, RunId};
use std::mem;
use tracing::{debug, trace};

impl BufferTree {
    /// Fans an internal node's buffer out to its children.
    ///
    /// Blocks are consumed `m/2` at a time. Children whose buffer overflows, or
    /// every child when `force` is set, are queued for emptying.
    pub(super) fn empty_internal(&mut self, id: NodeId, force: bool) -> Result<()> {
        let _phase = self.store.observe(Phase::InternalBufferEmptying);
        let mut node = self.store.load_node(id)?;
        if !node.is_internal {
            return Err(ArborError::invariant(format!(
                "{} queued for internal emptying is a leaf-level node",
                id
            )));
        }
        if node.children.is_empty() {
            // Waiting on rebalancing; the buffer moves with the node.
            trace!(node = %id, "no children to receive buffer");
            return Ok(());
        }

        let children = node.child_nodes()?;
        let handles: Vec<Key> = (0..node.handles.len())
            .map(|i| node.real_handle(i))
            .collect::<Result<_>>()?;

        let blocks = mem::take(&mut node.buffer_blocks);
        node.last_block_len = 0;
        let mut overflowing: Vec<NodeId> = Vec::new();
        let mut children_internal: Option<bool> = None;

        for chunk in blocks.chunks(self.params.blocks_per_read()) {
            let mut batch = Vec::new();
            for block in chunk {
                batch.extend(self.store.read_block(*block)?);
            }
            let batch = sort_and_collapse(batch);
            trace!(node = %id, elements = batch.len(), "fanning out batch");

            let mut rest: &[BufferElement] = &batch;
            for (i, child_id) in children.iter().enumerate() {
                if rest.is_empty() {
                    break;
                }
                let cut = match handles.get(i) {
                    Some(handle) => rest.partition_point(|e| e.key <= *handle),
                    None => rest.len(),
                };
                let (part, tail) = rest.split_at(cut);
                rest = tail;
                if part.is_empty() {
                    continue;
                }

                let mut child = self.store.load_node(*child_id)?;
                children_internal = Some(child.is_internal);
                self.store.append_or_create_block(&mut child, part)?;
                if self.is_buffer_full(&child) && !overflowing.contains(child_id) {
                    overflowing.push(*child_id);
                }
                self.store.store_node(&child)?;
            }

            for block in chunk {
                self.store.delete_block(*block)?;
            }
        }
        self.store.store_node(&node)?;

        let targets = if force { children } else { overflowing };
        if let Some(first) = targets.first() {
            let is_internal = match children_internal {
                Some(kind) => kind,
                None => self.store.load_node(*first)?.is_internal,
            };
            for child in targets {
                self.queues.push_emptying(child, is_internal);
            }
        }
        Ok(())
    }

    /// Reconciles a leaf-level node's buffer with its leaf blocks.
    ///
    /// The buffer is sorted into one run, merged with the old leaf blocks into
    /// fresh blocks of `B_leaf` keys, and the node's fan-out is rebuilt. Growth
    /// beyond the previous size may split the node; shrinking below the
    /// minimum pads it with placeholders.
    pub(super) fn empty_leaf(&mut self, id: NodeId) -> Result<()> {
        let _phase = self.store.observe(Phase::LeafBufferEmptying);
        let mut node = self.store.load_node(id)?;
        if node.is_internal {
            return Err(ArborError::invariant(format!(
                "{} queued for leaf emptying is an internal node",
                id
            )));
        }
        if !node.has_buffer() {
            return Ok(());
        }

        let run = self.sort_buffer(mem::take(&mut node.buffer_blocks))?;
        node.last_block_len = 0;

        let old_leaves = node.leaf_ids()?;
        let before = old_leaves.len();
        node.take_real_parts()?;

        let produced = self.merge_into_leaves(run, &old_leaves)?;
        for leaf in &old_leaves {
            self.store.delete_leaf(*leaf)?;
        }
        self.store.delete_run(run)?;

        debug!(
            node = %id,
            before,
            after = produced.len(),
            "leaf buffer emptied"
        );

        let keep = before.max(1).min(produced.len());
        let initial_handles = produced[..keep.saturating_sub(1)]
            .iter()
            .map(|(max, _)| *max)
            .collect();
        let initial_children = produced[..keep]
            .iter()
            .map(|(_, leaf)| ChildId::Leaf(*leaf))
            .collect();
        node.set_real_parts(initial_handles, initial_children);

        if keep > 0 {
            for pair in produced[keep - 1..].windows(2) {
                node.handles.push(Slot::Real(pair[0].0));
                node.children.push(Slot::Real(ChildId::Leaf(pair[1].1)));
                if node.child_count() > self.params.b {
                    self.split_cascade(&mut node)?;
                }
            }
        }

        let min = self.min_children(&node);
        if node.child_count() < min {
            node.pad_placeholders(min);
            self.queues.mark_placeholders(node.id);
            debug!(node = %id, real = node.real_child_count(), min, "padded with placeholders");
        } else {
            self.queues.clear_placeholders(node.id);
        }
        self.store.store_node(&node)
    }

    /// Sorts buffer blocks into one collapsed run and deletes the blocks.
    fn sort_buffer(&self, blocks: Vec<BlockId>) -> Result<RunId> {
        let mut runs = Vec::new();
        {
            let _phase = self.store.observe(Phase::ExternalMergeSort);
            for chunk in blocks.chunks(self.params.blocks_per_read()) {
                let mut batch = Vec::new();
                for block in chunk {
                    batch.extend(self.store.read_block(*block)?);
                }
                runs.push(write_sorted_run(&self.store, batch)?);
                for block in chunk {
                    self.store.delete_block(*block)?;
                }
            }
        }
        merge_runs(&self.store, runs, self.params.merge_window())
    }

    /// Merges a sorted run into the keys of `old_leaves`.
    ///
    /// Returns the new leaf blocks with their maximal keys, in key order.
    fn merge_into_leaves(
        &self,
        run: RunId,
        old_leaves: &[LeafId],
    ) -> Result<Vec<(Key, LeafId)>> {
        let _phase = self.store.observe(Phase::LeafMerge);
        let mut reader = self.store.open_run(run, self.params.merge_window())?;
        let mut out = LeafBuilder::new(self.params.leaf_block);

        for leaf in old_leaves {
            for key in self.store.load_leaf(*leaf)? {
                self.emit_updates_below(&mut reader, key, &mut out)?;
                match reader.peek()? {
                    Some(e) if e.key == key => {
                        reader.next_element()?;
                        if e.is_insert() {
                            out.push(&self.store, key)?;
                        }
                    }
                    _ => out.push(&self.store, key)?,
                }
            }
        }
        while let Some(e) = reader.next_element()? {
            if e.is_insert() {
                out.push(&self.store, e.key)?;
            }
        }
        out.finish(&self.store)
    }

    /// Emits inserted keys from the run that sort before `key`.
    fn emit_updates_below(
        &self,
        reader: &mut RunReader,
        key: Key,
        out: &mut LeafBuilder,
    ) -> Result<()> {
        while let Some(e) = reader.peek()? {
            if e.key >= key {
                break;
            }
            reader.next_element()?;
            if e.is_insert() {
                out.push(&self.store, e.key)?;
            }
        }
        Ok(())
    }
}

/// Collects merged keys into leaf blocks of a fixed size.
struct LeafBuilder {
    capacity: usize,
    current: Vec<Key>,
    produced: Vec<(Key, LeafId)>,
}

impl LeafBuilder {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            current: Vec::with_capacity(capacity),
            produced: Vec::new(),
        }
    }

    fn push(&mut self, store: &NodeStore, key: Key) -> Result<()> {
        self.current.push(key);
        if self.current.len() >= self.capacity {
            self.seal(store)?;
        }
        Ok(())
    }

    fn seal(&mut self, store: &NodeStore) -> Result<()> {
        if let Some(&max) = self.current.last() {
            let leaf = store.create_leaf(&self.current)?;
            self.produced.push((max, leaf));
            self.current.clear();
        }
        Ok(())
    }

    fn finish(mut self, store: &NodeStore) -> Result<Vec<(Key, LeafId)>> {
        self.seal(store)?;
        Ok(self.produced)
    }
}
