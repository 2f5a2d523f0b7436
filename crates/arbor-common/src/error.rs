//! Error types for Arbor.

use thiserror::Error;

/// Result type alias using ArborError.
pub type Result<T> = std::result::Result<T, ArborError>;

/// Errors that can occur in Arbor operations.
///
/// Configuration errors surface at construction. Invariant violations mean the
/// tree structure itself is inconsistent; once one has been returned from a
/// drain, the owning tree refuses further work with [`ArborError::TreePoisoned`].
#[derive(Debug, Error)]
pub enum ArborError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Not-found errors
    #[error("Node not found: {node_id}")]
    NodeNotFound { node_id: u64 },

    #[error("Buffer block not found: {block_id}")]
    BlockNotFound { block_id: u64 },

    #[error("Leaf block not found: {leaf_id}")]
    LeafNotFound { leaf_id: u64 },

    #[error("Sorted run not found: {run_id}")]
    RunNotFound { run_id: u64 },

    // Encoding errors
    #[error("Node corrupted: {node_id}, reason: {reason}")]
    NodeCorrupted { node_id: u64, reason: String },

    #[error("Malformed element line {line:?}: {reason}")]
    ElementParse { line: String, reason: String },

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal consistency errors
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Tree is unusable after an earlier failure")]
    TreePoisoned,
}

impl ArborError {
    /// Returns true for errors that indicate structural corruption of the tree.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ArborError::InvariantViolation(_)
                | ArborError::NodeCorrupted { .. }
                | ArborError::TreePoisoned
        )
    }

    /// Shorthand for building an invariant violation.
    pub fn invariant(msg: impl Into<String>) -> Self {
        ArborError::InvariantViolation(msg.into())
    }
}
