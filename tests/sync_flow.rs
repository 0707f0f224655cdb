//! End-to-end flows over two local trees: create, rescan, sync,
//! conflict backup, move inference, and merging unrelated trees.

use std::fs;
use std::path::Path;

use filetime::FileTime;
use rstest::rstest;

use snapsync::config::ConfigManager;
use snapsync::fs::{FileListing, LocalFs};
use snapsync::snapshot::{same_ancestor, Snapshot};
use snapsync::sync::{create_snapshot, merge_snapshots, sync_snapshots, SyncOptions};

fn touch(path: &Path, mtime: i64) {
    filetime::set_file_mtime(path, FileTime::from_unix_time(mtime, 0)).unwrap();
}

fn mtime_of(path: &Path) -> i64 {
    FileTime::from_last_modification_time(&fs::metadata(path).unwrap()).unix_seconds()
}

fn scan(root: &Path) -> FileListing {
    LocalFs::new()
        .enumerate(&root.to_string_lossy(), None)
        .unwrap()
}

fn load_snapshot(path: &Path) -> Snapshot {
    serde_json::from_slice(&fs::read(path).unwrap()).unwrap()
}

/// Identical starting trees on both sides, fixed mtimes throughout.
fn seed(root: &Path) {
    fs::write(root.join("x.txt"), b"x body").unwrap();
    fs::create_dir(root.join("sub")).unwrap();
    fs::write(root.join("sub").join("y.txt"), b"y body").unwrap();
    touch(&root.join("x.txt"), 1000);
    touch(&root.join("sub").join("y.txt"), 1100);
    touch(&root.join("sub"), 1050);
}

#[test]
fn create_sync_and_delete_round_trip() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    seed(a.path());
    seed(b.path());

    // snapshot of the left tree lives inside the tree it describes
    let snap_a = a.path().join("tree.json");
    let snap_b = state.path().join("b.json");
    create_snapshot(&snap_a.to_string_lossy(), &a.path().to_string_lossy()).unwrap();
    create_snapshot(&snap_b.to_string_lossy(), &b.path().to_string_lossy()).unwrap();

    let (sa, sb) = (load_snapshot(&snap_a), load_snapshot(&snap_b));
    assert!(same_ancestor(&sa.base.version, &sb.base.version));

    fs::write(a.path().join("new.txt"), b"fresh").unwrap();
    touch(&a.path().join("new.txt"), 2000);

    sync_snapshots(
        &snap_a.to_string_lossy(),
        &snap_b.to_string_lossy(),
        &SyncOptions::default(),
    )
    .unwrap();

    assert_eq!(fs::read(b.path().join("new.txt")).unwrap(), b"fresh");
    assert_eq!(mtime_of(&b.path().join("new.txt")), 2000);
    // the snapshot file itself must never cross over
    assert!(!b.path().join("tree.json").exists());

    let (sa, sb) = (load_snapshot(&snap_a), load_snapshot(&snap_b));
    assert_eq!(sa.base.files, sa.current.files);
    assert!(same_ancestor(&sa.base.version, &sb.base.version));
    assert!(sa.base.files.contains_key("new.txt"));

    // a deletion on the other side propagates back
    fs::remove_file(b.path().join("x.txt")).unwrap();
    sync_snapshots(
        &snap_a.to_string_lossy(),
        &snap_b.to_string_lossy(),
        &SyncOptions::default(),
    )
    .unwrap();
    assert!(!a.path().join("x.txt").exists());

    // and a third run has nothing left to move
    sync_snapshots(
        &snap_a.to_string_lossy(),
        &snap_b.to_string_lossy(),
        &SyncOptions::default(),
    )
    .unwrap();
    let mut left = scan(a.path());
    left.remove("tree.json");
    assert_eq!(left, scan(b.path()));
}

#[rstest]
#[case::edited_on_left(true)]
#[case::edited_on_right(false)]
fn one_sided_edit_propagates(#[case] edit_left: bool) {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    seed(a.path());
    seed(b.path());

    let snap_a = state.path().join("a.json");
    let snap_b = state.path().join("b.json");
    create_snapshot(&snap_a.to_string_lossy(), &a.path().to_string_lossy()).unwrap();
    create_snapshot(&snap_b.to_string_lossy(), &b.path().to_string_lossy()).unwrap();

    let edited = if edit_left { a.path() } else { b.path() };
    fs::write(edited.join("x.txt"), b"revised").unwrap();
    touch(&edited.join("x.txt"), 1500);

    sync_snapshots(
        &snap_a.to_string_lossy(),
        &snap_b.to_string_lossy(),
        &SyncOptions::default(),
    )
    .unwrap();

    for root in [a.path(), b.path()] {
        assert_eq!(fs::read(root.join("x.txt")).unwrap(), b"revised");
        assert_eq!(mtime_of(&root.join("x.txt")), 1500);
    }
}

#[test]
fn concurrent_edits_back_up_the_loser_before_overwriting() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    seed(a.path());
    seed(b.path());
    fs::write(a.path().join("clash.txt"), b"shared").unwrap();
    fs::write(b.path().join("clash.txt"), b"shared").unwrap();
    touch(&a.path().join("clash.txt"), 1000);
    touch(&b.path().join("clash.txt"), 1000);

    let snap_a = state.path().join("a.json");
    let snap_b = state.path().join("b.json");
    create_snapshot(&snap_a.to_string_lossy(), &a.path().to_string_lossy()).unwrap();
    create_snapshot(&snap_b.to_string_lossy(), &b.path().to_string_lossy()).unwrap();

    // unique content so the backup can be found among other runs
    let loser_body = format!("left-{}", std::process::id());
    fs::write(a.path().join("clash.txt"), &loser_body).unwrap();
    fs::write(b.path().join("clash.txt"), b"right wins").unwrap();
    touch(&a.path().join("clash.txt"), 1010);
    touch(&b.path().join("clash.txt"), 1020);

    sync_snapshots(
        &snap_a.to_string_lossy(),
        &snap_b.to_string_lossy(),
        &SyncOptions::default(),
    )
    .unwrap();

    // the newer right copy replaced both sides
    for root in [a.path(), b.path()] {
        assert_eq!(fs::read(root.join("clash.txt")).unwrap(), b"right wins");
        assert_eq!(mtime_of(&root.join("clash.txt")), 1020);
    }

    // the left copy survived, bytes and mtime intact, under the
    // conflicts root
    let conflicts = ConfigManager::conflicts_root().unwrap();
    let backup = walkdir::WalkDir::new(&conflicts)
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| {
            e.file_name().to_str() == Some("clash.left.txt")
                && fs::read(e.path()).map(|c| c == loser_body.as_bytes()).unwrap_or(false)
        })
        .expect("conflict backup not found");
    assert_eq!(mtime_of(backup.path()), 1010);
}

#[test]
fn dry_run_changes_nothing() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    seed(a.path());
    seed(b.path());

    let snap_a = state.path().join("a.json");
    let snap_b = state.path().join("b.json");
    create_snapshot(&snap_a.to_string_lossy(), &a.path().to_string_lossy()).unwrap();
    create_snapshot(&snap_b.to_string_lossy(), &b.path().to_string_lossy()).unwrap();

    fs::write(a.path().join("pending.txt"), b"not yet").unwrap();
    touch(&a.path().join("pending.txt"), 2000);

    sync_snapshots(
        &snap_a.to_string_lossy(),
        &snap_b.to_string_lossy(),
        &SyncOptions {
            dry_run: true,
            ..Default::default()
        },
    )
    .unwrap();

    assert!(!b.path().join("pending.txt").exists());
    // the ancestor is untouched, so a later real run still sees the change
    let sa = load_snapshot(&snap_a);
    assert!(!sa.base.files.contains_key("pending.txt"));
    assert!(sa.current.files.contains_key("pending.txt"));
}

#[test]
fn inferred_move_becomes_a_rename_and_stays_settled() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    for root in [a.path(), b.path()] {
        fs::create_dir(root.join("dir1")).unwrap();
        fs::write(root.join("dir1").join("photo.jpg"), b"jpeg bytes").unwrap();
        touch(&root.join("dir1").join("photo.jpg"), 500);
        touch(&root.join("dir1"), 400);
    }

    let snap_a = state.path().join("a.json");
    let snap_b = state.path().join("b.json");
    create_snapshot(&snap_a.to_string_lossy(), &a.path().to_string_lossy()).unwrap();
    create_snapshot(&snap_b.to_string_lossy(), &b.path().to_string_lossy()).unwrap();

    // relocate on the left; rename preserves the file's mtime
    fs::create_dir(a.path().join("dir2")).unwrap();
    fs::rename(
        a.path().join("dir1").join("photo.jpg"),
        a.path().join("dir2").join("photo.jpg"),
    )
    .unwrap();

    sync_snapshots(
        &snap_a.to_string_lossy(),
        &snap_b.to_string_lossy(),
        &SyncOptions {
            infer_moves: true,
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(
        fs::read(b.path().join("dir2").join("photo.jpg")).unwrap(),
        b"jpeg bytes"
    );
    assert_eq!(mtime_of(&b.path().join("dir2").join("photo.jpg")), 500);
    assert!(!b.path().join("dir1").join("photo.jpg").exists());

    // the locked ancestor must not remember the old path, or the next
    // run would re-delete the moved file
    let sa = load_snapshot(&snap_a);
    assert!(!sa.base.files.contains_key("dir1/photo.jpg"));
    assert_eq!(sa.base.files.get("dir2/photo.jpg"), Some(&500));

    sync_snapshots(
        &snap_a.to_string_lossy(),
        &snap_b.to_string_lossy(),
        &SyncOptions {
            infer_moves: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert!(b.path().join("dir2").join("photo.jpg").exists());
    assert!(a.path().join("dir2").join("photo.jpg").exists());
}

#[test]
fn merge_unions_two_unrelated_trees() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();

    fs::write(a.path().join("only-left.txt"), b"L").unwrap();
    fs::write(b.path().join("only-right.txt"), b"R").unwrap();
    fs::write(a.path().join("both.txt"), b"old").unwrap();
    fs::write(b.path().join("both.txt"), b"newer").unwrap();
    touch(&a.path().join("only-left.txt"), 100);
    touch(&b.path().join("only-right.txt"), 200);
    touch(&a.path().join("both.txt"), 300);
    touch(&b.path().join("both.txt"), 400);

    let snap_a = state.path().join("a.json");
    let snap_b = state.path().join("b.json");
    create_snapshot(&snap_a.to_string_lossy(), &a.path().to_string_lossy()).unwrap();
    create_snapshot(&snap_b.to_string_lossy(), &b.path().to_string_lossy()).unwrap();

    merge_snapshots(
        &snap_a.to_string_lossy(),
        &snap_b.to_string_lossy(),
        false,
        true, // auto-resolve collisions by mtime
    )
    .unwrap();

    for root in [a.path(), b.path()] {
        assert_eq!(fs::read(root.join("only-left.txt")).unwrap(), b"L");
        assert_eq!(fs::read(root.join("only-right.txt")).unwrap(), b"R");
        assert_eq!(fs::read(root.join("both.txt")).unwrap(), b"newer");
        assert_eq!(mtime_of(&root.join("both.txt")), 400);
    }

    // both snapshots now share an ancestor; a plain sync takes over
    let (sa, sb) = (load_snapshot(&snap_a), load_snapshot(&snap_b));
    assert!(same_ancestor(&sa.base.version, &sb.base.version));
    assert_eq!(scan(a.path()), scan(b.path()));
}
