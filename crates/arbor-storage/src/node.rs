//! Tree node metadata and the structural operations on its fan-out arrays.
//!
//! A node is pure data here: identity, handles, children, buffer block list and
//! parent pointer. Everything that touches the disk lives in the store and the
//! tree driver; this module only rearranges vectors and encodes records.
//!
//! Record format on disk (little endian):
//! ```text
//! +----------------------------+
//! | magic: u32 | version: u8   |
//! | node_id: u64               |
//! | is_internal: u8            |
//! | parent: u64 (MAX = none)   |
//! | num_handles: u32           |
//! | [tag: u8, key: u64] * n    |
//! | num_children: u32          |
//! | [tag: u8, id: u64] * n     |
//! | num_blocks: u32            |
//! | [block_id: u64] * n        |
//! | last_block_len: u64        |
//! | checksum: u32 (CRC32)      |
//! +----------------------------+
//! ```

use arbor_common::{ArborError, BlockId, Key, LeafId, NodeId, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic number at the start of every node record ("ARBN").
pub const NODE_MAGIC: u32 = 0x4E42_5241;

/// Current node record format version.
pub const NODE_FORMAT_VERSION: u8 = 1;

const NO_PARENT: u64 = u64::MAX;
const HEADER_SIZE: usize = 4 + 1 + 8 + 1 + 8;
const CHECKSUM_SIZE: usize = 4;

const HANDLE_PLACEHOLDER: u8 = 0;
const HANDLE_REAL: u8 = 1;

const CHILD_PLACEHOLDER: u8 = 0;
const CHILD_NODE: u8 = 1;
const CHILD_LEAF: u8 = 2;

/// A handle or child slot: either a real entry or a placeholder.
///
/// Placeholders only ever form a trailing run of a leaf node's children and the
/// paired handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot<T> {
    Real(T),
    Placeholder,
}

impl<T: Copy> Slot<T> {
    /// Returns the real value, or `None` for a placeholder.
    #[inline]
    pub fn real(&self) -> Option<T> {
        match self {
            Slot::Real(v) => Some(*v),
            Slot::Placeholder => None,
        }
    }

    #[inline]
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Slot::Placeholder)
    }
}

/// A child reference: another node for internal nodes, a leaf block otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildId {
    Node(NodeId),
    Leaf(LeafId),
}

impl ChildId {
    #[inline]
    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            ChildId::Node(id) => Some(*id),
            ChildId::Leaf(_) => None,
        }
    }

    #[inline]
    pub fn as_leaf(&self) -> Option<LeafId> {
        match self {
            ChildId::Leaf(id) => Some(*id),
            ChildId::Node(_) => None,
        }
    }
}

impl std::fmt::Display for ChildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChildId::Node(id) => write!(f, "{}", id),
            ChildId::Leaf(id) => write!(f, "{}", id),
        }
    }
}

/// The real entries of a node once its placeholders are stripped.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RealParts {
    pub handles: Vec<Key>,
    pub children: Vec<ChildId>,
    pub placeholders: usize,
}

/// Result of splitting an overfull node.
#[derive(Debug)]
pub struct SplitHalf {
    /// Handle promoted into the parent, separating left from right.
    pub promoted: Key,
    /// Handles for the new left sibling.
    pub handles: Vec<Slot<Key>>,
    /// Children for the new left sibling.
    pub children: Vec<Slot<ChildId>>,
}

/// Metadata of one a-b tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub id: NodeId,
    pub is_internal: bool,
    /// Separator keys; `handles.len() == children.len() - 1` once non-empty.
    pub handles: Vec<Slot<Key>>,
    pub children: Vec<Slot<ChildId>>,
    /// Buffer blocks, oldest first.
    pub buffer_blocks: Vec<BlockId>,
    /// Element count of the last buffer block.
    pub last_block_len: usize,
    pub parent: Option<NodeId>,
}

impl TreeNode {
    /// Creates an empty leaf-level node.
    pub fn new_leaf(id: NodeId, parent: Option<NodeId>) -> Self {
        Self {
            id,
            is_internal: false,
            handles: Vec::new(),
            children: Vec::new(),
            buffer_blocks: Vec::new(),
            last_block_len: 0,
            parent,
        }
    }

    /// Creates an empty internal node.
    pub fn new_internal(id: NodeId, parent: Option<NodeId>) -> Self {
        Self {
            is_internal: true,
            ..Self::new_leaf(id, parent)
        }
    }

    /// Returns true if the node has buffered elements on disk.
    #[inline]
    pub fn has_buffer(&self) -> bool {
        !self.buffer_blocks.is_empty()
    }

    /// Number of buffered elements, assuming every block but the last is full.
    pub fn buffered_elements(&self, block_capacity: usize) -> usize {
        match self.buffer_blocks.len() {
            0 => 0,
            n => (n - 1) * block_capacity + self.last_block_len,
        }
    }

    #[inline]
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Number of children that are not placeholders.
    pub fn real_child_count(&self) -> usize {
        self.children.iter().filter(|c| !c.is_placeholder()).count()
    }

    pub fn placeholder_count(&self) -> usize {
        self.children.len() - self.real_child_count()
    }

    pub fn has_placeholders(&self) -> bool {
        self.children.last().is_some_and(|c| c.is_placeholder())
    }

    /// Index of the real child node `child`.
    pub fn child_index(&self, child: NodeId) -> Result<usize> {
        self.children
            .iter()
            .position(|c| *c == Slot::Real(ChildId::Node(child)))
            .ok_or_else(|| {
                ArborError::invariant(format!("{} is not a child of {}", child, self.id))
            })
    }

    /// Child node at index `i`; fails for placeholders and leaf blocks.
    pub fn child_node(&self, i: usize) -> Result<NodeId> {
        match self.children.get(i) {
            Some(Slot::Real(ChildId::Node(id))) => Ok(*id),
            other => Err(ArborError::invariant(format!(
                "{} child {} is not a node: {:?}",
                self.id, i, other
            ))),
        }
    }

    /// All children of an internal node.
    pub fn child_nodes(&self) -> Result<Vec<NodeId>> {
        (0..self.children.len()).map(|i| self.child_node(i)).collect()
    }

    /// All real leaf blocks of a leaf-level node, in key order.
    pub fn leaf_ids(&self) -> Result<Vec<LeafId>> {
        self.children
            .iter()
            .filter_map(|c| c.real())
            .map(|c| {
                c.as_leaf().ok_or_else(|| {
                    ArborError::invariant(format!("{} references node {} as a leaf", self.id, c))
                })
            })
            .collect()
    }

    /// Real handle at index `i`.
    pub fn real_handle(&self, i: usize) -> Result<Key> {
        self.handles.get(i).and_then(|h| h.real()).ok_or_else(|| {
            ArborError::invariant(format!("{} has no real handle at index {}", self.id, i))
        })
    }

    /// Adjacent sibling of `child` within this node, preferring the left one.
    ///
    /// Returns the sibling and whether it is the left neighbor.
    pub fn neighbor_of(&self, child: NodeId) -> Result<(NodeId, bool)> {
        let index = self.child_index(child)?;
        if index > 0 {
            Ok((self.child_node(index - 1)?, true))
        } else if index + 1 < self.children.len() {
            Ok((self.child_node(index + 1)?, false))
        } else {
            Err(ArborError::invariant(format!(
                "{} has no sibling under {}",
                child, self.id
            )))
        }
    }

    /// Verifies that placeholders form a trailing run paired with trailing handles.
    pub fn check_placeholder_suffix(&self) -> Result<()> {
        let real = self
            .children
            .iter()
            .take_while(|c| !c.is_placeholder())
            .count();
        if self.children[real..].iter().any(|c| !c.is_placeholder()) {
            return Err(ArborError::invariant(format!(
                "{} has a real child after a placeholder",
                self.id
            )));
        }

        let expected_handles = self.children.len().saturating_sub(1);
        if self.handles.len() != expected_handles {
            return Err(ArborError::invariant(format!(
                "{} has {} handles for {} children",
                self.id,
                self.handles.len(),
                self.children.len()
            )));
        }

        let real_handles = real.saturating_sub(1);
        let handles_ok = self.handles.iter().enumerate().all(|(i, h)| {
            if i < real_handles {
                !h.is_placeholder()
            } else {
                h.is_placeholder()
            }
        });
        if !handles_ok {
            return Err(ArborError::invariant(format!(
                "{} handles and placeholder children are mismatched",
                self.id
            )));
        }
        Ok(())
    }

    /// Removes all entries and returns the real ones plus the placeholder count.
    pub fn take_real_parts(&mut self) -> Result<RealParts> {
        self.check_placeholder_suffix()?;
        let handles: Vec<Key> = self.handles.drain(..).filter_map(|h| h.real()).collect();
        let total = self.children.len();
        let children: Vec<ChildId> = self.children.drain(..).filter_map(|c| c.real()).collect();
        Ok(RealParts {
            placeholders: total - children.len(),
            handles,
            children,
        })
    }

    /// Replaces all entries with real ones.
    pub fn set_real_parts(&mut self, handles: Vec<Key>, children: Vec<ChildId>) {
        self.handles = handles.into_iter().map(Slot::Real).collect();
        self.children = children.into_iter().map(Slot::Real).collect();
    }

    /// Appends placeholder pairs until the node has `target` children.
    ///
    /// The first child never has a handle, so padding an empty node yields
    /// `target` placeholder children and `target - 1` placeholder handles.
    pub fn pad_placeholders(&mut self, target: usize) {
        while self.children.len() < target {
            if !self.children.is_empty() {
                self.handles.push(Slot::Placeholder);
            }
            self.children.push(Slot::Placeholder);
        }
    }

    /// Removes the trailing placeholder child together with its paired handle.
    ///
    /// Returns false if the last child is real.
    pub fn pop_placeholder(&mut self) -> Result<bool> {
        if !self.has_placeholders() {
            return Ok(false);
        }
        self.children.pop();
        if self.handles.len() > self.children.len().saturating_sub(1) {
            match self.handles.pop() {
                Some(Slot::Placeholder) => {}
                other => {
                    return Err(ArborError::invariant(format!(
                        "{} placeholder child paired with handle {:?}",
                        self.id, other
                    )))
                }
            }
        }
        Ok(true)
    }

    /// Splits a node holding exactly `b + 1` children.
    ///
    /// The node keeps the right half; the returned half belongs to a new left
    /// sibling. The left half gets `b/2` children and the first `b/2 - 1`
    /// handles, handle `b/2 - 1` is promoted.
    pub fn split_off_left(&mut self, b: usize) -> Result<SplitHalf> {
        if self.handles.len() != b || self.children.len() != b + 1 {
            return Err(ArborError::invariant(format!(
                "split of {} with b = {}: {} handles, {} children",
                self.id,
                b,
                self.handles.len(),
                self.children.len()
            )));
        }
        if self.has_placeholders() {
            return Err(ArborError::invariant(format!(
                "split of {} which holds placeholders",
                self.id
            )));
        }

        let half = b / 2;
        let right_handles = self.handles.split_off(half);
        let right_children = self.children.split_off(half);

        let mut left_handles = std::mem::replace(&mut self.handles, right_handles);
        let left_children = std::mem::replace(&mut self.children, right_children);

        let promoted = match left_handles.pop() {
            Some(Slot::Real(key)) => key,
            other => {
                return Err(ArborError::invariant(format!(
                    "split of {} promotes {:?}",
                    self.id, other
                )))
            }
        };

        Ok(SplitHalf {
            promoted,
            handles: left_handles,
            children: left_children,
        })
    }

    /// Encodes the node record with a trailing CRC32.
    pub fn serialize(&self) -> Bytes {
        let size = HEADER_SIZE
            + 4
            + self.handles.len() * 9
            + 4
            + self.children.len() * 9
            + 4
            + self.buffer_blocks.len() * 8
            + 8
            + CHECKSUM_SIZE;
        let mut buf = BytesMut::with_capacity(size);

        buf.put_u32_le(NODE_MAGIC);
        buf.put_u8(NODE_FORMAT_VERSION);
        buf.put_u64_le(self.id.0);
        buf.put_u8(self.is_internal as u8);
        buf.put_u64_le(self.parent.map_or(NO_PARENT, |p| p.0));

        buf.put_u32_le(self.handles.len() as u32);
        for handle in &self.handles {
            match handle {
                Slot::Real(key) => {
                    buf.put_u8(HANDLE_REAL);
                    buf.put_u64_le(*key);
                }
                Slot::Placeholder => {
                    buf.put_u8(HANDLE_PLACEHOLDER);
                    buf.put_u64_le(0);
                }
            }
        }

        buf.put_u32_le(self.children.len() as u32);
        for child in &self.children {
            let (tag, raw) = match child {
                Slot::Real(ChildId::Node(id)) => (CHILD_NODE, id.0),
                Slot::Real(ChildId::Leaf(id)) => (CHILD_LEAF, id.0),
                Slot::Placeholder => (CHILD_PLACEHOLDER, 0),
            };
            buf.put_u8(tag);
            buf.put_u64_le(raw);
        }

        buf.put_u32_le(self.buffer_blocks.len() as u32);
        for block in &self.buffer_blocks {
            buf.put_u64_le(block.0);
        }
        buf.put_u64_le(self.last_block_len as u64);

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);

        buf.freeze()
    }

    /// Decodes a record written by [`TreeNode::serialize`] for node `id`.
    pub fn deserialize(id: NodeId, data: &[u8]) -> Result<Self> {
        let corrupted = |reason: &str| ArborError::NodeCorrupted {
            node_id: id.0,
            reason: reason.to_string(),
        };

        if data.len() < HEADER_SIZE + CHECKSUM_SIZE {
            return Err(corrupted("record too short"));
        }

        let (body, tail) = data.split_at(data.len() - CHECKSUM_SIZE);
        let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        if crc32fast::hash(body) != stored {
            return Err(corrupted("checksum mismatch"));
        }

        let mut buf = body;
        if buf.get_u32_le() != NODE_MAGIC {
            return Err(corrupted("bad magic"));
        }
        let version = buf.get_u8();
        if version != NODE_FORMAT_VERSION {
            return Err(corrupted(&format!("unsupported version {}", version)));
        }
        if buf.get_u64_le() != id.0 {
            return Err(corrupted("record belongs to another node"));
        }
        let is_internal = match buf.get_u8() {
            0 => false,
            1 => true,
            _ => return Err(corrupted("bad node kind")),
        };
        let parent = match buf.get_u64_le() {
            NO_PARENT => None,
            raw => Some(NodeId(raw)),
        };

        let num_handles = read_len(&mut buf, 9, &corrupted)?;
        let mut handles = Vec::with_capacity(num_handles);
        for _ in 0..num_handles {
            let tag = buf.get_u8();
            let key = buf.get_u64_le();
            handles.push(match tag {
                HANDLE_REAL => Slot::Real(key),
                HANDLE_PLACEHOLDER => Slot::Placeholder,
                _ => return Err(corrupted("bad handle tag")),
            });
        }

        let num_children = read_len(&mut buf, 9, &corrupted)?;
        let mut children = Vec::with_capacity(num_children);
        for _ in 0..num_children {
            let tag = buf.get_u8();
            let raw = buf.get_u64_le();
            children.push(match tag {
                CHILD_NODE => Slot::Real(ChildId::Node(NodeId(raw))),
                CHILD_LEAF => Slot::Real(ChildId::Leaf(LeafId(raw))),
                CHILD_PLACEHOLDER => Slot::Placeholder,
                _ => return Err(corrupted("bad child tag")),
            });
        }

        let num_blocks = read_len(&mut buf, 8, &corrupted)?;
        let mut buffer_blocks = Vec::with_capacity(num_blocks);
        for _ in 0..num_blocks {
            buffer_blocks.push(BlockId(buf.get_u64_le()));
        }

        if buf.remaining() != 8 {
            return Err(corrupted("trailing bytes"));
        }
        let last_block_len = buf.get_u64_le() as usize;

        Ok(Self {
            id,
            is_internal,
            handles,
            children,
            buffer_blocks,
            last_block_len,
            parent,
        })
    }
}

/// Reads a `u32` count and checks that `count * entry_size` bytes remain.
fn read_len(
    buf: &mut &[u8],
    entry_size: usize,
    corrupted: &impl Fn(&str) -> ArborError,
) -> Result<usize> {
    if buf.remaining() < 4 {
        return Err(corrupted("truncated count"));
    }
    let count = buf.get_u32_le() as usize;
    if buf.remaining() < count * entry_size {
        return Err(corrupted("truncated entries"));
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(i: u64) -> Slot<ChildId> {
        Slot::Real(ChildId::Leaf(LeafId(i)))
    }

    fn node(i: u64) -> Slot<ChildId> {
        Slot::Real(ChildId::Node(NodeId(i)))
    }

    fn keys(ks: &[Key]) -> Vec<Slot<Key>> {
        ks.iter().map(|k| Slot::Real(*k)).collect()
    }

    fn sample_node() -> TreeNode {
        TreeNode {
            id: NodeId(7),
            is_internal: true,
            handles: keys(&[10, 20]),
            children: vec![node(1), node(2), node(3)],
            buffer_blocks: vec![BlockId(100), BlockId(101)],
            last_block_len: 3,
            parent: Some(NodeId(4)),
        }
    }

    #[test]
    fn test_serialize_roundtrip() {
        let original = sample_node();
        let bytes = original.serialize();
        let decoded = TreeNode::deserialize(NodeId(7), &bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_serialize_roundtrip_with_placeholders() {
        let original = TreeNode {
            id: NodeId(9),
            is_internal: false,
            handles: vec![Slot::Real(5), Slot::Placeholder],
            children: vec![leaf(1), leaf(2), Slot::Placeholder],
            buffer_blocks: vec![],
            last_block_len: 0,
            parent: None,
        };
        let decoded = TreeNode::deserialize(NodeId(9), &original.serialize()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_deserialize_detects_corruption() {
        let mut bytes = sample_node().serialize().to_vec();
        bytes[20] ^= 0xFF;
        let err = TreeNode::deserialize(NodeId(7), &bytes).unwrap_err();
        assert!(matches!(err, ArborError::NodeCorrupted { .. }));
    }

    #[test]
    fn test_deserialize_rejects_wrong_id_and_short_data() {
        let bytes = sample_node().serialize();
        assert!(TreeNode::deserialize(NodeId(8), &bytes).is_err());
        assert!(TreeNode::deserialize(NodeId(7), &bytes[..10]).is_err());
    }

    #[test]
    fn test_neighbor_prefers_left() {
        let n = sample_node();
        assert_eq!(n.neighbor_of(NodeId(2)).unwrap(), (NodeId(1), true));
        assert_eq!(n.neighbor_of(NodeId(3)).unwrap(), (NodeId(2), true));
        assert_eq!(n.neighbor_of(NodeId(1)).unwrap(), (NodeId(2), false));
        assert!(n.neighbor_of(NodeId(99)).is_err());
    }

    #[test]
    fn test_pad_and_pop_placeholders() {
        let mut n = TreeNode::new_leaf(NodeId(1), Some(NodeId(2)));
        n.set_real_parts(vec![4], vec![ChildId::Leaf(LeafId(1)), ChildId::Leaf(LeafId(2))]);
        n.pad_placeholders(4);
        assert_eq!(n.children.len(), 4);
        assert_eq!(n.handles.len(), 3);
        assert_eq!(n.real_child_count(), 2);
        assert_eq!(n.placeholder_count(), 2);
        n.check_placeholder_suffix().unwrap();

        assert!(n.pop_placeholder().unwrap());
        assert!(n.pop_placeholder().unwrap());
        assert!(!n.pop_placeholder().unwrap());
        assert_eq!(n.handles, vec![Slot::Real(4)]);
        assert_eq!(n.children.len(), 2);
    }

    #[test]
    fn test_pad_empty_node() {
        let mut n = TreeNode::new_leaf(NodeId(1), Some(NodeId(2)));
        n.pad_placeholders(3);
        assert_eq!(n.children, vec![Slot::Placeholder; 3]);
        assert_eq!(n.handles, vec![Slot::Placeholder; 2]);
        n.check_placeholder_suffix().unwrap();

        while n.pop_placeholder().unwrap() {}
        assert!(n.children.is_empty());
        assert!(n.handles.is_empty());
    }

    #[test]
    fn test_take_real_parts() {
        let mut n = TreeNode::new_leaf(NodeId(1), Some(NodeId(2)));
        n.set_real_parts(vec![4], vec![ChildId::Leaf(LeafId(1)), ChildId::Leaf(LeafId(2))]);
        n.pad_placeholders(3);
        let parts = n.take_real_parts().unwrap();
        assert_eq!(parts.handles, vec![4]);
        assert_eq!(parts.children.len(), 2);
        assert_eq!(parts.placeholders, 1);
        assert!(n.children.is_empty());
    }

    #[test]
    fn test_placeholder_suffix_violations() {
        let mut n = TreeNode::new_leaf(NodeId(1), None);
        n.children = vec![Slot::Placeholder, leaf(1)];
        n.handles = vec![Slot::Placeholder];
        assert!(n.check_placeholder_suffix().is_err());

        n.children = vec![leaf(1), leaf(2), Slot::Placeholder];
        n.handles = vec![Slot::Placeholder, Slot::Real(3)];
        assert!(n.check_placeholder_suffix().is_err());
    }

    #[test]
    fn test_split_off_left() {
        let b = 8;
        let mut n = TreeNode::new_internal(NodeId(1), None);
        n.set_real_parts(
            (1..=8).map(|k| k * 10).collect(),
            (1..=9).map(|i| ChildId::Node(NodeId(100 + i))).collect(),
        );

        let left = n.split_off_left(b).unwrap();
        assert_eq!(left.promoted, 40);
        assert_eq!(left.handles, keys(&[10, 20, 30]));
        assert_eq!(left.children.len(), 4);
        assert_eq!(n.handles, keys(&[50, 60, 70, 80]));
        assert_eq!(n.children.len(), 5);
        assert_eq!(n.children[0], node(105));
    }

    #[test]
    fn test_split_requires_exact_overflow() {
        let mut n = sample_node();
        let err = n.split_off_left(8).unwrap_err();
        assert!(matches!(err, ArborError::InvariantViolation(_)));
    }

    #[test]
    fn test_leaf_ids_and_child_nodes() {
        let n = sample_node();
        assert_eq!(n.child_nodes().unwrap(), vec![NodeId(1), NodeId(2), NodeId(3)]);
        assert!(n.leaf_ids().is_err());

        let mut l = TreeNode::new_leaf(NodeId(5), None);
        l.children = vec![leaf(1), leaf(2), Slot::Placeholder];
        l.handles = vec![Slot::Real(3), Slot::Placeholder];
        assert_eq!(l.leaf_ids().unwrap(), vec![LeafId(1), LeafId(2)]);
        assert!(l.child_node(0).is_err());
    }

    #[test]
    fn test_buffered_elements() {
        let n = sample_node();
        assert_eq!(n.buffered_elements(10), 13);
        assert_eq!(TreeNode::new_leaf(NodeId(1), None).buffered_elements(10), 0);
    }
}
