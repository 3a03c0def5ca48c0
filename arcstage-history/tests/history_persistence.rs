// SPDX-License-Identifier: PMPL-1.0-or-later
//! End-to-end tests for the staged history: window maintenance across
//! mutations, save/reopen round-trips, branch persistence, detach/remap,
//! and recovery from a failed save.

use std::sync::Arc;

use arcstage_history::{History, HistoryError, SnapshotId};
use arcstage_store::{I32Io, Stage};
use tempfile::TempDir;

fn staged_history(dir: &TempDir, name: &str) -> (Arc<Stage>, History<i32, I32Io>) {
    let stage = Arc::new(Stage::open(dir.path().join(name), true).unwrap());
    let history = History::new(0, Some(Arc::clone(&stage)), Some(I32Io));
    (stage, history)
}

/// Walk the undo chain to the root, returning payloads from the current
/// snapshot backwards (inclusive).
fn payloads_back_to_root(history: &mut History<i32, I32Io>) -> Vec<i32> {
    let mut payloads = vec![*history.current_state()];
    while history.current_stratum() > 0 {
        history.undo().unwrap();
        payloads.push(*history.current_state());
    }
    payloads
}

/// Assert the radius-1 window invariant around the current snapshot: the
/// direct parent (if any) is cached, anything two strata back is elided
/// with a chunk ID, and no cached descendant chain runs deeper than one
/// stratum.
fn assert_radius_one(history: &History<i32, I32Io>) {
    let current = history.current_snapshot();

    let parent = history.parent_of(current).unwrap();
    if history.current_stratum() > 0 {
        assert!(
            parent.snapshot.is_some() || parent.chunk_id.is_some(),
            "parent of the current snapshot is unreachable"
        );
    }
    if let Some(parent_snapshot) = parent.snapshot {
        let grandparent = history.parent_of(parent_snapshot).unwrap();
        if grandparent.snapshot.is_some() {
            panic!("snapshot at distance 2 is still cached");
        }
        if history.stratum_of(parent_snapshot).unwrap() > 0 {
            assert!(grandparent.chunk_id.is_some(), "elided ancestor lost its chunk id");
        }
    }

    for child in history.children_of(current).unwrap() {
        if let Some(child_snapshot) = child.snapshot {
            for grandchild in history.children_of(child_snapshot).unwrap() {
                assert!(
                    grandchild.snapshot.is_none(),
                    "descendant at distance 2 is still cached"
                );
                assert!(grandchild.chunk_id.is_some());
            }
        }
    }
}

#[test]
fn linear_undo_redo_with_default_radius() {
    let dir = TempDir::new().unwrap();
    let (_stage, mut history) = staged_history(&dir, "linear.stage");

    for value in [10, 20, 30] {
        history.advance(value).unwrap();
        assert_radius_one(&history);
    }
    assert_eq!(history.current_stratum(), 3);
    assert_eq!(*history.current_state(), 30);

    history.undo().unwrap();
    assert_radius_one(&history);
    history.undo().unwrap();
    assert_radius_one(&history);
    assert_eq!(history.current_stratum(), 1);
    assert_eq!(*history.current_state(), 10);

    // Redo through the recorded chunk ID of the stratum-2 child.
    let children = history.children_of(history.current_snapshot()).unwrap();
    assert_eq!(children.len(), 1);
    let child_id = children[0]
        .chunk_id
        .expect("evicted child should carry a chunk id");
    history.redo(child_id).unwrap();
    assert_radius_one(&history);
    assert_eq!(history.current_stratum(), 2);
    assert_eq!(*history.current_state(), 20);
}

#[test]
fn undo_then_redo_restores_identity_in_memory() {
    let dir = TempDir::new().unwrap();
    let (_stage, mut history) = staged_history(&dir, "identity.stage");

    history.advance(10).unwrap();
    history.advance(20).unwrap();
    let tip = history.current_snapshot();

    history.undo().unwrap();
    // The tip stays cached at distance 1, so redo restores the very same
    // snapshot, not a copy.
    history.redo_to(tip).unwrap();
    assert_eq!(history.current_snapshot(), tip);
    assert_eq!(*history.current_state(), 20);
}

#[test]
fn save_and_reopen_reproduces_the_chain() {
    let dir = TempDir::new().unwrap();
    let (stage, mut history) = staged_history(&dir, "reopen.stage");

    for value in [10, 20, 30] {
        history.advance(value).unwrap();
    }
    history.save().unwrap();
    let saved = history.current_id().expect("save assigns the current id");

    let mut reopened: History<i32, I32Io> =
        History::open(Arc::clone(&stage), I32Io, saved, 1, true).unwrap();
    assert_eq!(reopened.current_stratum(), 3);
    assert_eq!(*reopened.current_state(), 30);
    assert_eq!(payloads_back_to_root(&mut reopened), vec![30, 20, 10, 0]);
}

#[test]
fn branches_survive_save_and_reopen() {
    let dir = TempDir::new().unwrap();
    let (stage, mut history) = staged_history(&dir, "branch.stage");

    // Build two branches out of stratum 1.
    history.advance(10).unwrap();
    history.advance(20).unwrap();
    history.undo().unwrap();
    history.advance(25).unwrap();
    assert_eq!(history.current_stratum(), 2);
    assert_eq!(*history.current_state(), 25);

    history.save().unwrap();
    let saved = history.current_id().unwrap();

    let mut reopened: History<i32, I32Io> =
        History::open(Arc::clone(&stage), I32Io, saved, 1, true).unwrap();
    assert_eq!(*reopened.current_state(), 25);

    // One undo exposes the fork: the branch we came down plus the flushed
    // sibling, both reachable.
    reopened.undo().unwrap();
    assert_eq!(reopened.current_stratum(), 1);
    let children = reopened.children_of(reopened.current_snapshot()).unwrap();
    assert_eq!(children.len(), 2);

    // The severed slot was reconnected to the snapshot we reopened from.
    let live: Vec<SnapshotId> = children.iter().filter_map(|c| c.snapshot).collect();
    assert_eq!(live.len(), 1);
    assert_eq!(*reopened.state_of(live[0]).unwrap(), 25);

    // The other branch redoes from its chunk.
    let flushed = children
        .iter()
        .find(|c| c.snapshot.is_none())
        .and_then(|c| c.chunk_id)
        .expect("sibling branch should be staged");
    reopened.redo(flushed).unwrap();
    assert_eq!(reopened.current_stratum(), 2);
    assert_eq!(*reopened.current_state(), 20);
}

#[test]
fn deep_advance_elides_early_snapshots() {
    let dir = TempDir::new().unwrap();
    let (_stage, mut history) = staged_history(&dir, "slide.stage");

    for value in [10, 20, 30, 40, 50] {
        history.advance(value).unwrap();
    }
    assert_radius_one(&history);

    // The parent is cached; its own parent is elided but addressable.
    let parent = history
        .parent_of(history.current_snapshot())
        .unwrap()
        .snapshot
        .expect("direct parent must stay cached");
    let grandparent = history.parent_of(parent).unwrap();
    assert!(grandparent.snapshot.is_none());
    assert!(grandparent.chunk_id.is_some());

    // Undoing all the way back faults every stratum in again.
    assert_eq!(
        payloads_back_to_root(&mut history),
        vec![50, 40, 30, 20, 10, 0]
    );
}

#[test]
fn detach_lift_and_restage() {
    let dir = TempDir::new().unwrap();
    let (_stage, mut history) = staged_history(&dir, "first.stage");

    history.advance(1).unwrap();
    history.advance(2).unwrap();

    // Lift the whole tree off the stage.
    history.set_stage(None).unwrap();
    assert!(!history.is_attached());
    assert_eq!(history.forward_tail(), -1);
    assert_eq!(history.backward_tail(), -1);

    // Mutate while detached; nothing is persisted.
    history.advance(3).unwrap();
    assert_eq!(history.current_id(), None);

    // Re-stage onto a different file: every node is written fresh.
    let other = Arc::new(Stage::open(dir.path().join("second.stage"), true).unwrap());
    history.set_stage(Some(Arc::clone(&other))).unwrap();
    assert!(history.is_attached());
    let saved = history.current_id().expect("restaging saves the tree");

    let mut reopened: History<i32, I32Io> =
        History::open(other, I32Io, saved, 1, true).unwrap();
    assert_eq!(payloads_back_to_root(&mut reopened), vec![3, 2, 1, 0]);
}

#[test]
fn remap_between_live_stages() {
    let dir = TempDir::new().unwrap();
    let (_first, mut history) = staged_history(&dir, "origin.stage");

    for value in [7, 8, 9] {
        history.advance(value).unwrap();
    }
    history.save().unwrap();

    let target = Arc::new(Stage::open(dir.path().join("target.stage"), true).unwrap());
    history.set_stage(Some(Arc::clone(&target))).unwrap();

    // The remapped tree lives entirely in the target stage.
    let saved = history.current_id().expect("remap reissues chunk ids");
    let mut reopened: History<i32, I32Io> =
        History::open(target, I32Io, saved, 1, true).unwrap();
    assert_eq!(payloads_back_to_root(&mut reopened), vec![9, 8, 7, 0]);
}

#[test]
fn lift_save_roundtrip_preserves_topology() {
    let dir = TempDir::new().unwrap();
    let (stage, mut history) = staged_history(&dir, "roundtrip.stage");

    history.advance(10).unwrap();
    history.advance(20).unwrap();
    history.undo().unwrap();
    history.advance(21).unwrap();
    history.save().unwrap();

    // Lift, then reattach to the same stage: fresh ids, same shape.
    history.set_stage(None).unwrap();
    history.set_stage(Some(Arc::clone(&stage))).unwrap();
    let saved = history.current_id().unwrap();

    let mut reopened: History<i32, I32Io> =
        History::open(stage, I32Io, saved, 1, true).unwrap();
    assert_eq!(*reopened.current_state(), 21);
    reopened.undo().unwrap();
    assert_eq!(
        reopened
            .children_of(reopened.current_snapshot())
            .unwrap()
            .len(),
        2
    );
    reopened.undo().unwrap();
    assert_eq!(reopened.current_stratum(), 0);
}

#[test]
fn failed_save_retries_without_duplicates() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("crash.stage");
    let stage = Arc::new(Stage::open(&path, true).unwrap());
    let mut history = History::new(0, Some(Arc::clone(&stage)), Some(I32Io));

    history.advance(10).unwrap();
    history.advance(20).unwrap();

    // Make the backing file unopenable: close the channel and plant a
    // directory at the path, so the reopen inside the next append fails.
    stage.close().unwrap();
    let hidden = dir.path().join("crash.stage.hidden");
    std::fs::rename(&path, &hidden).unwrap();
    std::fs::create_dir(&path).unwrap();

    let result = history.save();
    assert!(matches!(result, Err(HistoryError::Stage(_))));
    // The current snapshot never got its id assigned.
    assert_eq!(history.current_id(), None);

    // Restore the file and retry.
    std::fs::remove_dir(&path).unwrap();
    std::fs::rename(&hidden, &path).unwrap();

    history.save().unwrap();
    let saved = history.current_id().unwrap();

    // A further save writes nothing: every node is already persisted.
    let size = stage.size().unwrap();
    history.save().unwrap();
    assert_eq!(stage.size().unwrap(), size);

    let mut reopened: History<i32, I32Io> =
        History::open(stage, I32Io, saved, 1, true).unwrap();
    assert_eq!(payloads_back_to_root(&mut reopened), vec![20, 10, 0]);
}

#[test]
fn open_detached_lifts_the_tree() {
    let dir = TempDir::new().unwrap();
    let (stage, mut history) = staged_history(&dir, "detached.stage");

    for value in [5, 6] {
        history.advance(value).unwrap();
    }
    history.save().unwrap();
    let saved = history.current_id().unwrap();

    // attach = false lifts everything into memory and detaches.
    let mut lifted: History<i32, I32Io> =
        History::open(stage, I32Io, saved, 1, false).unwrap();
    assert!(!lifted.is_attached());
    assert_eq!(lifted.backward_tail(), -1);
    assert_eq!(payloads_back_to_root(&mut lifted), vec![6, 5, 0]);
}
