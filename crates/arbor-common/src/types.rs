//! Identifier and key types shared by all Arbor components.

use serde::{Deserialize, Serialize};

/// Key type stored in the tree.
pub type Key = u64;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl $name {
            /// Returns the raw identifier value.
            #[inline]
            pub fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Identifier of a tree node's metadata record.
    NodeId,
    "node-"
);
define_id!(
    /// Identifier of a buffer block owned by a node.
    BlockId,
    "block-"
);
define_id!(
    /// Identifier of a leaf block holding live keys.
    LeafId,
    "leaf-"
);
define_id!(
    /// Identifier of a sorted run produced during external merge sort.
    RunId,
    "run-"
);

/// Logical time attached to every buffered update.
///
/// Strictly increasing per tree, never wall-clock. When two updates for the
/// same key meet, the one with the greater logical time wins.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct LogicalTime(pub u64);

impl LogicalTime {
    /// The first logical time handed out by a fresh clock.
    pub const FIRST: LogicalTime = LogicalTime(1);

    /// Returns the following logical time.
    #[inline]
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic issuer of identifiers. Identifiers are never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    /// Creates an allocator whose first identifier is 1.
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Returns the next raw identifier.
    #[inline]
    pub fn allocate(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }

    /// Returns the identifier that the next call to `allocate` will return.
    pub fn peek(&self) -> u64 {
        self.next
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_id_display() {
        assert_eq!(NodeId(7).to_string(), "node-7");
        assert_eq!(BlockId(8).to_string(), "block-8");
        assert_eq!(LeafId(9).to_string(), "leaf-9");
        assert_eq!(RunId(10).to_string(), "run-10");
    }

    #[test]
    fn test_id_ordering_and_hash() {
        assert!(NodeId(1) < NodeId(2));
        let mut set = HashSet::new();
        set.insert(LeafId(3));
        set.insert(LeafId(3));
        set.insert(LeafId(4));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_logical_time_next() {
        let t = LogicalTime::FIRST;
        assert_eq!(t.next(), LogicalTime(2));
        assert!(t < t.next());
        assert_eq!(LogicalTime::default(), LogicalTime(0));
    }

    #[test]
    fn test_allocator_is_monotonic() {
        let mut alloc = IdAllocator::new();
        assert_eq!(alloc.peek(), 1);
        let ids: Vec<u64> = (0..5).map(|_| alloc.allocate()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(alloc.peek(), 6);
    }

    #[test]
    fn test_id_serde_roundtrip() {
        let original = NodeId(12345);
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: NodeId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original, deserialized);
    }
}
