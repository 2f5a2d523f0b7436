//! File-backed persistence for nodes, buffer blocks, leaf blocks and sort runs.
//!
//! Every object lives in its own file under the tree's data directory:
//!
//! ```text
//! <data_dir>/nodes/00000001     binary node record
//! <data_dir>/blocks/00000002    buffer block, one element per line
//! <data_dir>/leaves/00000003    leaf block, one key per line
//! <data_dir>/runs/00000004      sorted run, one element per line
//! ```
//!
//! Identifiers come from a single allocator and are never reused. Each read or
//! write call is one unit of I/O accounting and is reported to the observer.

use crate::element::{decode_elements, encode_elements, BufferElement};
use crate::node::TreeNode;
use crate::observer::{Phase, PhaseGuard, PhaseObserver};
use arbor_common::{
    ArborError, BlockId, IdAllocator, Key, LeafId, NodeId, Result, RunId, TreeConfig,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

const NODES_DIR: &str = "nodes";
const BLOCKS_DIR: &str = "blocks";
const LEAVES_DIR: &str = "leaves";
const RUNS_DIR: &str = "runs";

/// Persistent store for all on-disk state of one tree.
pub struct NodeStore {
    /// Base directory for all files.
    data_dir: PathBuf,
    /// Sync every written file before returning.
    fsync_enabled: bool,
    /// Elements per buffer block.
    block_elements: usize,
    /// Shared identifier source for every object kind.
    ids: Mutex<IdAllocator>,
    observer: Arc<dyn PhaseObserver>,
}

impl NodeStore {
    /// Opens a store rooted at `config.data_dir`, creating its directories.
    ///
    /// Fails if the directory already holds node records from another tree.
    pub fn open(config: &TreeConfig, observer: Arc<dyn PhaseObserver>) -> Result<Self> {
        if config.buffer_block_elements == 0 {
            return Err(ArborError::InvalidParameter {
                name: "buffer_block_elements".to_string(),
                value: "0".to_string(),
            });
        }

        for dir in [NODES_DIR, BLOCKS_DIR, LEAVES_DIR, RUNS_DIR] {
            std::fs::create_dir_all(config.data_dir.join(dir))?;
        }

        if std::fs::read_dir(config.data_dir.join(NODES_DIR))?
            .next()
            .is_some()
        {
            return Err(ArborError::ConfigError(format!(
                "data directory {} already contains a tree",
                config.data_dir.display()
            )));
        }

        Ok(Self {
            data_dir: config.data_dir.clone(),
            fsync_enabled: config.fsync_enabled,
            block_elements: config.buffer_block_elements,
            ids: Mutex::new(IdAllocator::new()),
            observer,
        })
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Returns the observer receiving phase hooks.
    pub fn observer(&self) -> &Arc<dyn PhaseObserver> {
        &self.observer
    }

    /// Enters `phase` until the returned guard is dropped.
    pub fn observe(&self, phase: Phase) -> PhaseGuard {
        PhaseGuard::enter(&self.observer, phase)
    }

    fn allocate(&self) -> u64 {
        self.ids.lock().allocate()
    }

    fn path(&self, dir: &str, id: u64) -> PathBuf {
        self.data_dir.join(dir).join(format!("{:08}", id))
    }

    /// Writes `data` as the complete contents of `path`.
    fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(data)?;
        if self.fsync_enabled {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Appends `data` to an existing file.
    fn append_file(&self, path: &Path, data: &[u8]) -> std::io::Result<()> {
        let mut file = OpenOptions::new().append(true).open(path)?;
        file.write_all(data)?;
        if self.fsync_enabled {
            file.sync_all()?;
        }
        Ok(())
    }

    // Nodes

    /// Issues a fresh node identifier.
    pub fn new_node_id(&self) -> NodeId {
        NodeId(self.allocate())
    }

    /// Loads a node record.
    pub fn load_node(&self, id: NodeId) -> Result<TreeNode> {
        let _io = self.observe(Phase::NodeRead);
        trace!(node = %id, "load node");
        let data = std::fs::read(self.path(NODES_DIR, id.0))
            .map_err(|e| not_found(e, ArborError::NodeNotFound { node_id: id.0 }))?;
        TreeNode::deserialize(id, &data)
    }

    /// Writes a node record, replacing any previous version.
    pub fn store_node(&self, node: &TreeNode) -> Result<()> {
        let _io = self.observe(Phase::NodeWrite);
        trace!(node = %node.id, children = node.children.len(), "store node");
        self.write_file(&self.path(NODES_DIR, node.id.0), &node.serialize())
    }

    pub fn delete_node(&self, id: NodeId) -> Result<()> {
        trace!(node = %id, "delete node");
        std::fs::remove_file(self.path(NODES_DIR, id.0))
            .map_err(|e| not_found(e, ArborError::NodeNotFound { node_id: id.0 }))
    }

    // Buffer blocks

    /// Writes `elements` as a new buffer block.
    pub fn write_block(&self, elements: &[BufferElement]) -> Result<BlockId> {
        let id = BlockId(self.allocate());
        let _io = self.observe(Phase::ElementWrite);
        trace!(block = %id, elements = elements.len(), "write block");
        self.write_file(
            &self.path(BLOCKS_DIR, id.0),
            encode_elements(elements).as_bytes(),
        )?;
        Ok(id)
    }

    /// Appends `elements` to an existing buffer block.
    pub fn append_to_block(&self, id: BlockId, elements: &[BufferElement]) -> Result<()> {
        let _io = self.observe(Phase::ElementWrite);
        trace!(block = %id, elements = elements.len(), "append block");
        self.append_file(
            &self.path(BLOCKS_DIR, id.0),
            encode_elements(elements).as_bytes(),
        )
        .map_err(|e| not_found(e, ArborError::BlockNotFound { block_id: id.0 }))
    }

    pub fn read_block(&self, id: BlockId) -> Result<Vec<BufferElement>> {
        let _io = self.observe(Phase::ElementRead);
        trace!(block = %id, "read block");
        let text = std::fs::read_to_string(self.path(BLOCKS_DIR, id.0))
            .map_err(|e| not_found(e, ArborError::BlockNotFound { block_id: id.0 }))?;
        decode_elements(&text)
    }

    pub fn delete_block(&self, id: BlockId) -> Result<()> {
        trace!(block = %id, "delete block");
        std::fs::remove_file(self.path(BLOCKS_DIR, id.0))
            .map_err(|e| not_found(e, ArborError::BlockNotFound { block_id: id.0 }))
    }

    /// Appends `elements` to `node`'s buffer.
    ///
    /// The last block is filled first while it has spare room, the remainder
    /// goes into new full-size blocks. Only the in-memory node is updated; the
    /// caller stores it.
    pub fn append_or_create_block(
        &self,
        node: &mut TreeNode,
        elements: &[BufferElement],
    ) -> Result<()> {
        let mut rest = elements;

        if let Some(&last) = node.buffer_blocks.last() {
            let room = self.block_elements.saturating_sub(node.last_block_len);
            if room > 0 && !rest.is_empty() {
                let (head, tail) = rest.split_at(room.min(rest.len()));
                self.append_to_block(last, head)?;
                node.last_block_len += head.len();
                rest = tail;
            }
        }

        for chunk in rest.chunks(self.block_elements) {
            let id = self.write_block(chunk)?;
            node.buffer_blocks.push(id);
            node.last_block_len = chunk.len();
        }
        Ok(())
    }

    // Leaf blocks

    /// Writes `keys` as a new leaf block.
    pub fn create_leaf(&self, keys: &[Key]) -> Result<LeafId> {
        let id = LeafId(self.allocate());
        self.store_leaf(id, keys)?;
        Ok(id)
    }

    pub fn load_leaf(&self, id: LeafId) -> Result<Vec<Key>> {
        let _io = self.observe(Phase::LeafRead);
        trace!(leaf = %id, "load leaf");
        let text = std::fs::read_to_string(self.path(LEAVES_DIR, id.0))
            .map_err(|e| not_found(e, ArborError::LeafNotFound { leaf_id: id.0 }))?;
        text.lines()
            .filter(|line| !line.is_empty())
            .map(|line| {
                line.parse::<Key>().map_err(|e| ArborError::ElementParse {
                    line: line.to_string(),
                    reason: format!("bad leaf key: {}", e),
                })
            })
            .collect()
    }

    /// Writes the ordered keys of a leaf block, replacing any previous contents.
    pub fn store_leaf(&self, id: LeafId, keys: &[Key]) -> Result<()> {
        let _io = self.observe(Phase::LeafWrite);
        trace!(leaf = %id, keys = keys.len(), "store leaf");
        let mut text = String::with_capacity(keys.len() * 12);
        for key in keys {
            text.push_str(&key.to_string());
            text.push('\n');
        }
        self.write_file(&self.path(LEAVES_DIR, id.0), text.as_bytes())
    }

    pub fn delete_leaf(&self, id: LeafId) -> Result<()> {
        trace!(leaf = %id, "delete leaf");
        std::fs::remove_file(self.path(LEAVES_DIR, id.0))
            .map_err(|e| not_found(e, ArborError::LeafNotFound { leaf_id: id.0 }))
    }

    // Sort runs

    /// Starts a new sorted run.
    pub fn create_run(&self) -> Result<RunWriter> {
        let id = RunId(self.allocate());
        let file = File::create(self.path(RUNS_DIR, id.0))?;
        Ok(RunWriter {
            id,
            writer: BufWriter::new(file),
            pending: Vec::with_capacity(self.block_elements),
            block_elements: self.block_elements,
            fsync_enabled: self.fsync_enabled,
            observer: Arc::clone(&self.observer),
        })
    }

    /// Opens a sorted run for reading through a window of `window` elements.
    pub fn open_run(&self, id: RunId, window: usize) -> Result<RunReader> {
        let file = File::open(self.path(RUNS_DIR, id.0))
            .map_err(|e| not_found(e, ArborError::RunNotFound { run_id: id.0 }))?;
        Ok(RunReader {
            id,
            reader: BufReader::new(file),
            window: VecDeque::with_capacity(window.max(1)),
            window_size: window.max(1),
            exhausted: false,
            observer: Arc::clone(&self.observer),
        })
    }

    pub fn delete_run(&self, id: RunId) -> Result<()> {
        trace!(run = %id, "delete run");
        std::fs::remove_file(self.path(RUNS_DIR, id.0))
            .map_err(|e| not_found(e, ArborError::RunNotFound { run_id: id.0 }))
    }

    /// Number of files currently present in one of the store's directories.
    #[cfg(test)]
    pub(crate) fn count_files(&self, dir: &str) -> usize {
        std::fs::read_dir(self.data_dir.join(dir))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

/// Maps `NotFound` I/O errors to the object-specific not-found error.
fn not_found(err: std::io::Error, missing: ArborError) -> ArborError {
    if err.kind() == ErrorKind::NotFound {
        missing
    } else {
        ArborError::Io(err)
    }
}

/// Sequential writer for a sorted run.
///
/// Elements are flushed to the file one buffer block's worth at a time; each
/// flush counts as one element write.
pub struct RunWriter {
    id: RunId,
    writer: BufWriter<File>,
    pending: Vec<BufferElement>,
    block_elements: usize,
    fsync_enabled: bool,
    observer: Arc<dyn PhaseObserver>,
}

impl RunWriter {
    pub fn id(&self) -> RunId {
        self.id
    }

    /// Appends one element; callers push in `(key, logical_time)` order.
    pub fn push(&mut self, element: BufferElement) -> Result<()> {
        self.pending.push(element);
        if self.pending.len() >= self.block_elements {
            self.flush_pending()?;
        }
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let _io = PhaseGuard::enter(&self.observer, Phase::ElementWrite);
        self.writer
            .write_all(encode_elements(&self.pending).as_bytes())?;
        self.pending.clear();
        Ok(())
    }

    /// Writes any pending elements and closes the run.
    pub fn finish(mut self) -> Result<RunId> {
        self.flush_pending()?;
        self.writer.flush()?;
        if self.fsync_enabled {
            self.writer.get_ref().sync_all()?;
        }
        trace!(run = %self.id, "run finished");
        Ok(self.id)
    }
}

/// Windowed reader over a sorted run.
///
/// At most `window` elements are held in memory; each refill counts as one
/// element read.
pub struct RunReader {
    id: RunId,
    reader: BufReader<File>,
    window: VecDeque<BufferElement>,
    window_size: usize,
    exhausted: bool,
    observer: Arc<dyn PhaseObserver>,
}

impl RunReader {
    pub fn id(&self) -> RunId {
        self.id
    }

    fn refill(&mut self) -> Result<()> {
        if self.exhausted || !self.window.is_empty() {
            return Ok(());
        }
        let _io = PhaseGuard::enter(&self.observer, Phase::ElementRead);
        let mut line = String::new();
        while self.window.len() < self.window_size {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                self.exhausted = true;
                break;
            }
            if line.trim_end().is_empty() {
                continue;
            }
            self.window.push_back(BufferElement::parse_line(&line)?);
        }
        Ok(())
    }

    /// Returns the next element without consuming it.
    pub fn peek(&mut self) -> Result<Option<BufferElement>> {
        self.refill()?;
        Ok(self.window.front().copied())
    }

    /// Consumes and returns the next element.
    pub fn next_element(&mut self) -> Result<Option<BufferElement>> {
        self.refill()?;
        Ok(self.window.pop_front())
    }
}
