//! External merge sort over on-disk runs.
//!
//! Runs are merged pairwise until a single run remains. Each side of a pair is
//! streamed through a bounded window, so memory use stays at `2 * window`
//! elements regardless of run length. Equal keys collapse to the element with
//! the later logical time, and every consumed run is deleted.

use crate::element::{newer, sort_and_collapse, BufferElement};
use crate::observer::Phase;
use crate::store::NodeStore;
use arbor_common::{Result, RunId};
use std::collections::VecDeque;
use tracing::debug;

/// Sorts and collapses `elements` in memory and writes them as one run.
pub fn write_sorted_run(store: &NodeStore, elements: Vec<BufferElement>) -> Result<RunId> {
    let mut writer = store.create_run()?;
    for element in sort_and_collapse(elements) {
        writer.push(element)?;
    }
    writer.finish()
}

/// Merges `runs` into one sorted, collapsed run and deletes the inputs.
///
/// With no input runs an empty run is created.
pub fn merge_runs(store: &NodeStore, runs: Vec<RunId>, window: usize) -> Result<RunId> {
    let _phase = store.observe(Phase::ExternalMergeSort);

    let mut pending: VecDeque<RunId> = runs.into();
    if pending.is_empty() {
        return store.create_run()?.finish();
    }

    debug!(runs = pending.len(), window, "merging runs");
    while pending.len() > 1 {
        let (Some(left), Some(right)) = (pending.pop_front(), pending.pop_front()) else {
            break;
        };
        let merged = merge_two(store, left, right, window)?;
        pending.push_back(merged);
    }

    match pending.pop_front() {
        Some(run) => Ok(run),
        None => store.create_run()?.finish(),
    }
}

/// Streams two sorted runs into a new one.
fn merge_two(store: &NodeStore, left: RunId, right: RunId, window: usize) -> Result<RunId> {
    let mut lhs = store.open_run(left, window)?;
    let mut rhs = store.open_run(right, window)?;
    let mut out = store.create_run()?;

    loop {
        let next = match (lhs.peek()?, rhs.peek()?) {
            (Some(l), Some(r)) if l.key < r.key => {
                lhs.next_element()?;
                l
            }
            (Some(l), Some(r)) if r.key < l.key => {
                rhs.next_element()?;
                r
            }
            (Some(l), Some(r)) => {
                lhs.next_element()?;
                rhs.next_element()?;
                newer(l, r)
            }
            (Some(l), None) => {
                lhs.next_element()?;
                l
            }
            (None, Some(r)) => {
                rhs.next_element()?;
                r
            }
            (None, None) => break,
        };
        out.push(next)?;
    }

    let merged = out.finish()?;
    drop(lhs);
    drop(rhs);
    store.delete_run(left)?;
    store.delete_run(right)?;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NoopObserver;
    use arbor_common::{Key, LogicalTime, TreeConfig};
    use rand::seq::SliceRandom;
    use rand::{rngs::StdRng, SeedableRng};
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    fn create_test_store() -> (NodeStore, TempDir) {
        let dir = tempdir().unwrap();
        let mut config = TreeConfig::new(dir.path(), 64, 4, 4);
        config.fsync_enabled = false;
        let store = NodeStore::open(&config, Arc::new(NoopObserver)).unwrap();
        (store, dir)
    }

    fn read_all(store: &NodeStore, run: RunId) -> Vec<BufferElement> {
        let mut reader = store.open_run(run, 3).unwrap();
        let mut out = Vec::new();
        while let Some(e) = reader.next_element().unwrap() {
            out.push(e);
        }
        out
    }

    fn ins(key: Key, time: u64) -> BufferElement {
        BufferElement::insert(key, LogicalTime(time))
    }

    fn del(key: Key, time: u64) -> BufferElement {
        BufferElement::delete(key, LogicalTime(time))
    }

    #[test]
    fn test_merge_no_runs_yields_empty_run() {
        let (store, _dir) = create_test_store();
        let run = merge_runs(&store, vec![], 4).unwrap();
        assert!(read_all(&store, run).is_empty());
    }

    #[test]
    fn test_merge_single_run_is_unchanged() {
        let (store, _dir) = create_test_store();
        let run = write_sorted_run(&store, vec![ins(3, 1), ins(1, 2)]).unwrap();
        let merged = merge_runs(&store, vec![run], 4).unwrap();
        assert_eq!(merged, run);
        assert_eq!(read_all(&store, merged), vec![ins(1, 2), ins(3, 1)]);
    }

    #[test]
    fn test_merge_collapses_equal_keys_to_latest() {
        let (store, _dir) = create_test_store();
        let a = write_sorted_run(&store, vec![ins(1, 1), ins(5, 2), del(9, 7)]).unwrap();
        let b = write_sorted_run(&store, vec![del(1, 4), ins(6, 3), ins(9, 5)]).unwrap();
        let c = write_sorted_run(&store, vec![ins(1, 9)]).unwrap();

        let merged = merge_runs(&store, vec![a, b, c], 2).unwrap();
        assert_eq!(
            read_all(&store, merged),
            vec![ins(1, 9), ins(5, 2), ins(6, 3), del(9, 7)]
        );
        assert_eq!(store.count_files("runs"), 1);
    }

    #[test]
    fn test_merge_many_runs_random() {
        let (store, _dir) = create_test_store();
        let mut rng = StdRng::seed_from_u64(7);
        let mut keys: Vec<Key> = (0..200).collect();
        keys.shuffle(&mut rng);

        let runs: Vec<RunId> = keys
            .chunks(13)
            .enumerate()
            .map(|(i, chunk)| {
                let elements = chunk
                    .iter()
                    .map(|k| ins(*k, (i as u64) * 100 + *k))
                    .collect();
                write_sorted_run(&store, elements).unwrap()
            })
            .collect();

        let merged = merge_runs(&store, runs, 5).unwrap();
        let keys: Vec<Key> = read_all(&store, merged).iter().map(|e| e.key).collect();
        assert_eq!(keys, (0..200).collect::<Vec<_>>());
    }
}
