//! Arbor common types, errors, and configuration.
//!
//! This crate provides shared definitions used by the Arbor storage engine.

pub mod config;
pub mod error;
pub mod types;

pub use config::{TreeConfig, TreeParams};
pub use error::{ArborError, Result};
pub use types::{BlockId, IdAllocator, Key, LeafId, LogicalTime, NodeId, RunId};
