//! Phase hooks for I/O accounting and timing.
//!
//! The tree brackets every structural phase and every block-level I/O call with
//! an enter/exit pair. Observers see the phase name only; they cannot return a
//! value and therefore cannot influence tree state.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Named phases reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Phase {
    /// Top-level buffer written into the root's buffer.
    TreeBufferPush = 0,
    /// Forced emptying of every buffer.
    Flush = 1,
    /// Fan-out of an internal node's buffer.
    InternalBufferEmptying = 2,
    /// Reconciliation of a leaf node's buffer with its leaf blocks.
    LeafBufferEmptying = 3,
    /// External merge sort of a leaf node's buffer.
    ExternalMergeSort = 4,
    /// Linear merge of a sorted run with existing leaf blocks.
    LeafMerge = 5,
    NodeSplit = 6,
    NodeSteal = 7,
    NodeMerge = 8,
    RootCollapse = 9,
    PlaceholderDeletion = 10,
    NodeRead = 11,
    NodeWrite = 12,
    ElementRead = 13,
    ElementWrite = 14,
    LeafRead = 15,
    LeafWrite = 16,
}

impl Phase {
    /// Number of distinct phases.
    pub const COUNT: usize = 17;

    /// Every phase, in discriminant order.
    pub const ALL: [Phase; Phase::COUNT] = [
        Phase::TreeBufferPush,
        Phase::Flush,
        Phase::InternalBufferEmptying,
        Phase::LeafBufferEmptying,
        Phase::ExternalMergeSort,
        Phase::LeafMerge,
        Phase::NodeSplit,
        Phase::NodeSteal,
        Phase::NodeMerge,
        Phase::RootCollapse,
        Phase::PlaceholderDeletion,
        Phase::NodeRead,
        Phase::NodeWrite,
        Phase::ElementRead,
        Phase::ElementWrite,
        Phase::LeafRead,
        Phase::LeafWrite,
    ];

    /// Stable name used in logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            Phase::TreeBufferPush => "tree_buffer_push",
            Phase::Flush => "flush",
            Phase::InternalBufferEmptying => "internal_buffer_emptying",
            Phase::LeafBufferEmptying => "leaf_buffer_emptying",
            Phase::ExternalMergeSort => "external_merge_sort",
            Phase::LeafMerge => "leaf_merge",
            Phase::NodeSplit => "node_split",
            Phase::NodeSteal => "node_steal",
            Phase::NodeMerge => "node_merge",
            Phase::RootCollapse => "root_collapse",
            Phase::PlaceholderDeletion => "placeholder_deletion",
            Phase::NodeRead => "io_node_read",
            Phase::NodeWrite => "io_node_write",
            Phase::ElementRead => "io_element_read",
            Phase::ElementWrite => "io_element_write",
            Phase::LeafRead => "io_leaf_read",
            Phase::LeafWrite => "io_leaf_write",
        }
    }

    /// Returns true for phases that correspond to one block-level I/O call.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            Phase::NodeRead
                | Phase::NodeWrite
                | Phase::ElementRead
                | Phase::ElementWrite
                | Phase::LeafRead
                | Phase::LeafWrite
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Receives enter/exit notifications around named phases.
pub trait PhaseObserver: Send + Sync {
    fn enter(&self, phase: Phase);
    fn exit(&self, phase: Phase);
}

/// Observer that ignores every hook.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PhaseObserver for NoopObserver {
    #[inline]
    fn enter(&self, _phase: Phase) {}

    #[inline]
    fn exit(&self, _phase: Phase) {}
}

/// Observer that emits a `trace!` event for every hook.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl PhaseObserver for TracingObserver {
    fn enter(&self, phase: Phase) {
        tracing::trace!(phase = phase.name(), "enter");
    }

    fn exit(&self, phase: Phase) {
        tracing::trace!(phase = phase.name(), "exit");
    }
}

/// Counts phase entries and accumulates the wall time spent in each phase.
///
/// Nested phases are timed independently; an I/O call inside a split counts
/// towards both.
pub struct PhaseCounter {
    entries: [AtomicU64; Phase::COUNT],
    nanos: [AtomicU64; Phase::COUNT],
    open: Mutex<Vec<(Phase, Instant)>>,
}

impl PhaseCounter {
    pub fn new() -> Self {
        Self {
            entries: std::array::from_fn(|_| AtomicU64::new(0)),
            nanos: std::array::from_fn(|_| AtomicU64::new(0)),
            open: Mutex::new(Vec::new()),
        }
    }

    /// Number of times `phase` was entered.
    pub fn count(&self, phase: Phase) -> u64 {
        self.entries[phase as usize].load(Ordering::Relaxed)
    }

    /// Total time spent inside `phase`.
    pub fn elapsed(&self, phase: Phase) -> Duration {
        Duration::from_nanos(self.nanos[phase as usize].load(Ordering::Relaxed))
    }

    /// Sum of all block-level I/O calls.
    pub fn io_calls(&self) -> u64 {
        Phase::ALL
            .iter()
            .filter(|p| p.is_io())
            .map(|p| self.count(*p))
            .sum()
    }

    /// Non-zero counts as `(phase, count)` pairs, in discriminant order.
    pub fn snapshot(&self) -> Vec<(Phase, u64)> {
        Phase::ALL
            .iter()
            .map(|p| (*p, self.count(*p)))
            .filter(|(_, c)| *c > 0)
            .collect()
    }

    /// Clears all counters.
    pub fn reset(&self) {
        for i in 0..Phase::COUNT {
            self.entries[i].store(0, Ordering::Relaxed);
            self.nanos[i].store(0, Ordering::Relaxed);
        }
        self.open.lock().clear();
    }
}

impl Default for PhaseCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseObserver for PhaseCounter {
    fn enter(&self, phase: Phase) {
        self.entries[phase as usize].fetch_add(1, Ordering::Relaxed);
        self.open.lock().push((phase, Instant::now()));
    }

    fn exit(&self, phase: Phase) {
        let mut open = self.open.lock();
        if let Some(pos) = open.iter().rposition(|(p, _)| *p == phase) {
            let (_, started) = open.remove(pos);
            let nanos = started.elapsed().as_nanos() as u64;
            self.nanos[phase as usize].fetch_add(nanos, Ordering::Relaxed);
        }
    }
}

/// Calls `exit` on drop, pairing the `enter` issued by [`PhaseGuard::enter`].
#[must_use = "the phase ends when the guard is dropped"]
pub struct PhaseGuard {
    observer: Arc<dyn PhaseObserver>,
    phase: Phase,
}

impl PhaseGuard {
    pub fn enter(observer: &Arc<dyn PhaseObserver>, phase: Phase) -> Self {
        observer.enter(phase);
        Self {
            observer: Arc::clone(observer),
            phase,
        }
    }
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        self.observer.exit(self.phase);
    }
}
