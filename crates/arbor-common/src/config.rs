//! Configuration structures for Arbor.

use crate::error::{ArborError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for a buffer tree instance.
///
/// All sizes are counted in elements, not bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Directory holding node metadata, buffer blocks, leaf blocks and sort runs.
    pub data_dir: PathBuf,
    /// Total memory budget `M`.
    pub memory_elements: usize,
    /// Elements per internal buffer block `B_buffer`.
    pub buffer_block_elements: usize,
    /// Keys per leaf block `B_leaf`.
    pub leaf_block_elements: usize,
    /// Enable fsync after every file write.
    pub fsync_enabled: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            memory_elements: 8192,
            buffer_block_elements: 1024,
            leaf_block_elements: 1024,
            fsync_enabled: true,
        }
    }
}

impl TreeConfig {
    /// Creates a configuration rooted at `data_dir` with the given sizes.
    pub fn new(
        data_dir: impl Into<PathBuf>,
        memory_elements: usize,
        buffer_block_elements: usize,
        leaf_block_elements: usize,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            memory_elements,
            buffer_block_elements,
            leaf_block_elements,
            ..Default::default()
        }
    }

    /// Validates the configuration and derives the tree parameters.
    pub fn params(&self) -> Result<TreeParams> {
        TreeParams::derive(
            self.memory_elements,
            self.buffer_block_elements,
            self.leaf_block_elements,
        )
    }
}

/// Capacity parameters derived once from `(M, B_buffer, B_leaf)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeParams {
    /// Memory budget `M` in elements.
    pub memory: usize,
    /// Elements per buffer block.
    pub buffer_block: usize,
    /// Keys per leaf block.
    pub leaf_block: usize,
    /// Blocks that fit in memory, `M / B_buffer`.
    pub m: usize,
    /// Minimum fan-out of a non-root node.
    pub a: usize,
    /// Maximum fan-out.
    pub b: usize,
    /// Number of children moved by a steal.
    pub s: usize,
    /// Steal-versus-merge threshold offset.
    pub t: usize,
}

impl TreeParams {
    /// Derives `m, a, b, s, t` and rejects configurations the a-b tree cannot use.
    pub fn derive(memory: usize, buffer_block: usize, leaf_block: usize) -> Result<Self> {
        if buffer_block == 0 {
            return Err(invalid("buffer_block_elements", buffer_block));
        }
        if leaf_block == 0 {
            return Err(invalid("leaf_block_elements", leaf_block));
        }

        let m = memory / buffer_block;
        if m < 4 {
            return Err(ArborError::ConfigError(format!(
                "m = M / B_buffer = {} / {} = {} is smaller than 4",
                memory, buffer_block, m
            )));
        }
        if m % 4 != 0 {
            return Err(ArborError::ConfigError(format!(
                "m = M / B_buffer = {} is not divisible by 4",
                m
            )));
        }

        let a = m / 4;
        let b = m;
        let s = ((b / 2) - a + 1).div_ceil(2);
        let t = (b / 2) - a + s - 1;

        Ok(Self {
            memory,
            buffer_block,
            leaf_block,
            m,
            a,
            b,
            s,
            t,
        })
    }

    /// Minimum number of children: 0 for a leaf root, 2 for an internal root, `a` otherwise.
    #[inline]
    pub fn min_children(&self, is_root: bool, is_internal: bool) -> usize {
        match (is_root, is_internal) {
            (false, _) => self.a,
            (true, true) => 2,
            (true, false) => 0,
        }
    }

    /// Number of buffer blocks a node may hold before it has to be emptied.
    #[inline]
    pub fn buffer_capacity(&self, is_root: bool, is_internal: bool) -> usize {
        if is_root && !is_internal {
            self.m / 2 - 1
        } else {
            self.m / 2
        }
    }

    /// Returns true if `blocks` exceeds the node's buffer capacity.
    #[inline]
    pub fn is_buffer_full(&self, blocks: usize, is_root: bool, is_internal: bool) -> bool {
        blocks > self.buffer_capacity(is_root, is_internal)
    }

    /// Buffer blocks consumed per emptying round (`m/2`).
    #[inline]
    pub fn blocks_per_read(&self) -> usize {
        self.m / 2
    }

    /// Elements read from each side of a pairwise run merge.
    #[inline]
    pub fn merge_window(&self) -> usize {
        (self.memory / 2).max(1)
    }

    /// A sibling with fewer children than this is merged instead of stolen from.
    #[inline]
    pub fn merge_threshold(&self) -> usize {
        self.a + self.t + 1
    }
}

fn invalid(name: &str, value: usize) -> ArborError {
    ArborError::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_config_defaults() {
        let config = TreeConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.memory_elements, 8192);
        assert_eq!(config.buffer_block_elements, 1024);
        assert_eq!(config.leaf_block_elements, 1024);
        assert!(config.fsync_enabled);
    }

    #[test]
    fn test_tree_config_new() {
        let config = TreeConfig::new("/tmp/arbor", 64, 8, 4);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/arbor"));
        assert_eq!(config.memory_elements, 64);
        assert_eq!(config.buffer_block_elements, 8);
        assert_eq!(config.leaf_block_elements, 4);
    }

    #[test]
    fn test_params_m8() {
        let params = TreeConfig::default().params().unwrap();
        assert_eq!(params.m, 8);
        assert_eq!(params.a, 2);
        assert_eq!(params.b, 8);
        // s = ceil((4 - 2 + 1) / 2) = 2, t = 4 - 2 + 2 - 1 = 3
        assert_eq!(params.s, 2);
        assert_eq!(params.t, 3);
        assert_eq!(params.merge_threshold(), 6);
        assert_eq!(params.blocks_per_read(), 4);
        assert_eq!(params.merge_window(), 4096);
    }

    #[test]
    fn test_params_m16() {
        let params = TreeParams::derive(160, 10, 10).unwrap();
        assert_eq!(params.m, 16);
        assert_eq!(params.a, 4);
        assert_eq!(params.b, 16);
        // s = ceil((8 - 4 + 1) / 2) = 3, t = 8 - 4 + 3 - 1 = 6
        assert_eq!(params.s, 3);
        assert_eq!(params.t, 6);
    }

    #[test]
    fn test_params_integer_division() {
        // 8200 / 1024 = 8
        let params = TreeParams::derive(8200, 1024, 512).unwrap();
        assert_eq!(params.m, 8);
        assert_eq!(params.leaf_block, 512);
    }

    #[test]
    fn test_params_reject_m_not_divisible_by_four() {
        let err = TreeParams::derive(6 * 1024, 1024, 1024).unwrap_err();
        assert!(matches!(err, ArborError::ConfigError(_)));
        assert!(err.to_string().contains("not divisible by 4"));
    }

    #[test]
    fn test_params_reject_tiny_memory() {
        let err = TreeParams::derive(100, 1024, 1024).unwrap_err();
        assert!(matches!(err, ArborError::ConfigError(_)));
    }

    #[test]
    fn test_params_reject_zero_block_sizes() {
        assert!(matches!(
            TreeParams::derive(64, 0, 4),
            Err(ArborError::InvalidParameter { .. })
        ));
        assert!(matches!(
            TreeParams::derive(64, 8, 0),
            Err(ArborError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_min_children() {
        let params = TreeParams::derive(64, 8, 8).unwrap();
        assert_eq!(params.min_children(false, true), 2);
        assert_eq!(params.min_children(false, false), 2);
        assert_eq!(params.min_children(true, true), 2);
        assert_eq!(params.min_children(true, false), 0);

        let params = TreeParams::derive(16 * 8, 8, 8).unwrap();
        assert_eq!(params.min_children(false, false), 4);
        assert_eq!(params.min_children(true, true), 2);
    }

    #[test]
    fn test_buffer_capacity() {
        let params = TreeParams::derive(64, 8, 8).unwrap();
        assert_eq!(params.buffer_capacity(true, false), 3);
        assert_eq!(params.buffer_capacity(true, true), 4);
        assert_eq!(params.buffer_capacity(false, true), 4);
        assert_eq!(params.buffer_capacity(false, false), 4);

        assert!(!params.is_buffer_full(3, true, false));
        assert!(params.is_buffer_full(4, true, false));
        assert!(!params.is_buffer_full(4, false, true));
        assert!(params.is_buffer_full(5, false, true));
    }

    #[test]
    fn test_tree_config_serde_roundtrip() {
        let original = TreeConfig::new("/var/lib/arbor", 4096, 128, 64);
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: TreeConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(original.data_dir, deserialized.data_dir);
        assert_eq!(original.memory_elements, deserialized.memory_elements);
        assert_eq!(
            original.buffer_block_elements,
            deserialized.buffer_block_elements
        );
        assert_eq!(original.leaf_block_elements, deserialized.leaf_block_elements);
        assert_eq!(original.fsync_enabled, deserialized.fsync_enabled);
    }

    #[test]
    fn test_tree_config_clone() {
        let config1 = TreeConfig::default();
        let config2 = config1.clone();
        assert_eq!(config1.memory_elements, config2.memory_elements);
        assert_eq!(config1.data_dir, config2.data_dir);
    }
}
