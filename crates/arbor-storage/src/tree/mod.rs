//! Buffer tree: an a-b tree whose nodes carry on-disk update buffers.
//!
//! ```text
//! insert/delete ─▶ [top buffer, B elements] ─▶ root buffer
//!                                                  │ (root buffer full)
//!                                                  ▼
//!                     internal emptying ─▶ child buffers ─▶ ... ─▶ leaf-level nodes
//!                                                                      │
//!                                  leaf reconciliation ─▶ new leaf blocks
//!                                         │                    │
//!                                  split cascade        placeholders / underflow
//!                                                              │
//!                                                       steal / merge / collapse
//! ```
//!
//! Every public operation runs the driver loop until all work queues are empty,
//! so callers never observe a half-rebalanced tree. Components only push work
//! onto the queues; the loop in [`BufferTree::drain`] owns re-entrancy.

mod check;
mod emptying;
mod queues;
mod rebalance;
mod split;

pub use check::TreeShape;

use crate::element::BufferElement;
use crate::node::TreeNode;
use crate::observer::{NoopObserver, Phase, PhaseObserver};
use crate::store::NodeStore;
use arbor_common::{ArborError, Key, LogicalTime, NodeId, Result, TreeConfig, TreeParams};
use queues::WorkQueues;
use std::sync::Arc;
use tracing::{debug, info};

/// External-memory buffer tree over integer keys.
///
/// Updates are batched in a top-level buffer of `B_buffer` elements and then
/// cascade lazily through the node buffers. The tree is single-writer: all
/// mutating operations take `&mut self`.
pub struct BufferTree {
    params: TreeParams,
    store: NodeStore,
    root: NodeId,
    /// In-memory buffer in front of the root, at most `B_buffer` elements.
    top_buffer: Vec<BufferElement>,
    /// Logical time handed to the next update.
    clock: LogicalTime,
    queues: WorkQueues,
    /// Set once an operation fails mid-drain.
    poisoned: bool,
}

impl BufferTree {
    /// Creates an empty tree in `config.data_dir` with no instrumentation.
    pub fn create(config: TreeConfig) -> Result<Self> {
        Self::with_observer(config, Arc::new(NoopObserver))
    }

    /// Creates an empty tree reporting phases to `observer`.
    pub fn with_observer(config: TreeConfig, observer: Arc<dyn PhaseObserver>) -> Result<Self> {
        let params = config.params()?;
        let store = NodeStore::open(&config, observer)?;

        let root = TreeNode::new_leaf(store.new_node_id(), None);
        store.store_node(&root)?;

        info!(
            data_dir = %config.data_dir.display(),
            m = params.m,
            a = params.a,
            b = params.b,
            s = params.s,
            t = params.t,
            "Created buffer tree"
        );

        Ok(Self {
            params,
            store,
            root: root.id,
            top_buffer: Vec::with_capacity(params.buffer_block),
            clock: LogicalTime::FIRST,
            queues: WorkQueues::new(),
            poisoned: false,
        })
    }

    /// Inserts `key`. Inserting a present key is a no-op once reconciled.
    pub fn insert(&mut self, key: Key) -> Result<()> {
        let time = self.tick();
        self.push_element(BufferElement::insert(key, time))
    }

    /// Deletes `key`. Deleting an absent key is a no-op once reconciled.
    pub fn delete(&mut self, key: Key) -> Result<()> {
        let time = self.tick();
        self.push_element(BufferElement::delete(key, time))
    }

    /// Pushes every pending update down to the leaf blocks.
    ///
    /// Afterwards all buffers are empty and the tree satisfies the a-b
    /// invariants with no placeholders.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_usable()?;
        self.run_guarded(|tree| {
            let _phase = tree.store.observe(Phase::Flush);
            if !tree.top_buffer.is_empty() {
                tree.push_top_buffer()?;
            }
            let root = tree.store.load_node(tree.root)?;
            tree.queues.push_emptying(root.id, root.is_internal);
            tree.drain(true)
        })
    }

    /// Identifier of the current root node.
    pub fn root_id(&self) -> NodeId {
        self.root
    }

    /// Parameters derived from the configuration.
    pub fn params(&self) -> &TreeParams {
        &self.params
    }

    /// Number of updates waiting in the in-memory top buffer.
    pub fn pending_elements(&self) -> usize {
        self.top_buffer.len()
    }

    /// Loads a node for inspection.
    pub fn load_node(&self, id: NodeId) -> Result<TreeNode> {
        self.store.load_node(id)
    }

    /// Observer receiving this tree's phase hooks.
    pub fn observer(&self) -> &Arc<dyn PhaseObserver> {
        self.store.observer()
    }

    /// Returns true if an earlier failure left the tree unusable.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn tick(&mut self) -> LogicalTime {
        let time = self.clock;
        self.clock = time.next();
        time
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(ArborError::TreePoisoned);
        }
        Ok(())
    }

    /// Runs `op`, poisoning the tree if it fails.
    fn run_guarded<F>(&mut self, op: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let result = op(self);
        if let Err(ref e) = result {
            tracing::error!(error = %e, "buffer tree operation failed, tree is poisoned");
            self.poisoned = true;
            self.queues.clear();
        }
        result
    }

    fn push_element(&mut self, element: BufferElement) -> Result<()> {
        self.ensure_usable()?;
        self.run_guarded(|tree| {
            if tree.top_buffer.len() >= tree.params.buffer_block {
                return Err(ArborError::invariant(format!(
                    "top buffer holds {} elements, capacity is {}",
                    tree.top_buffer.len(),
                    tree.params.buffer_block
                )));
            }
            tree.top_buffer.push(element);
            if tree.top_buffer.len() < tree.params.buffer_block {
                return Ok(());
            }

            if tree.push_top_buffer()? {
                tree.drain(false)?;
            }
            Ok(())
        })
    }

    /// Moves the top buffer into the root's buffer.
    ///
    /// Returns true if the root buffer became full and the root was queued.
    fn push_top_buffer(&mut self) -> Result<bool> {
        let _phase = self.store.observe(Phase::TreeBufferPush);
        let mut root = self.store.load_node(self.root)?;
        self.store
            .append_or_create_block(&mut root, &self.top_buffer)?;
        self.top_buffer.clear();
        self.store.store_node(&root)?;

        let full = self.is_buffer_full(&root);
        if full {
            self.queues.push_emptying(root.id, root.is_internal);
        }
        Ok(full)
    }

    fn is_root(&self, node: &TreeNode) -> bool {
        node.id == self.root
    }

    fn is_buffer_full(&self, node: &TreeNode) -> bool {
        self.params
            .is_buffer_full(node.buffer_blocks.len(), self.is_root(node), node.is_internal)
    }

    fn min_children(&self, node: &TreeNode) -> usize {
        self.params.min_children(self.is_root(node), node.is_internal)
    }

    /// Runs all queued work to quiescence.
    ///
    /// With `force` set every emptied internal node passes its buffer on to all
    /// of its children, so the whole tree is emptied.
    fn drain(&mut self, force: bool) -> Result<()> {
        let mut rounds = 0usize;
        loop {
            rounds += 1;
            while let Some(id) = self.queues.pop_internal() {
                self.empty_internal(id, force)?;
            }
            while let Some(id) = self.queues.pop_leaf() {
                self.empty_leaf(id)?;
            }
            if self.queues.has_emptying() {
                continue;
            }
            if !self.rebalance()? {
                break;
            }
        }
        debug!(rounds, root = %self.root, "drain finished");

        if !self.queues.is_idle() {
            return Err(ArborError::invariant("work left in queues after drain"));
        }
        Ok(())
    }
}
