//! Storage engine for Arbor.
//!
//! This crate provides:
//! - Buffer tree with lazy, amortized buffer emptying
//! - File-backed store for node records, buffer blocks and leaf blocks
//! - External merge sort over on-disk runs
//! - Element line codec for buffered updates
//! - Phase observers for I/O accounting

mod element;
mod node;
mod observer;
mod sort;
mod store;
mod tree;

pub use element::{Action, BufferElement, FIELD_SEPARATOR};
pub use node::{ChildId, Slot, TreeNode, NODE_FORMAT_VERSION, NODE_MAGIC};
pub use observer::{NoopObserver, Phase, PhaseCounter, PhaseGuard, PhaseObserver, TracingObserver};
pub use store::{NodeStore, RunReader, RunWriter};
pub use tree::{BufferTree, TreeShape};
