//! High-level operations: snapshot creation, rescans, the two-snapshot
//! sync, and ancestor-free merging.
//!
//! Everything here works through snapshot stores and backends; nothing
//! below this layer knows two trees are being reconciled.

use anyhow::{bail, Context, Result};
use colored::Colorize;

use crate::apply::{apply_changes, preview_changes, Peer};
use crate::config::ConfigManager;
use crate::diff::{compare_new_to_old, compose_changes, ChangeSet};
use crate::fs::{Backend, FileListing};
use crate::location::Location;
use crate::logger::log_to_file;
use crate::snapshot::{
    hash_files, same_ancestor, version_hash, version_time, Snapshot, SnapshotStore,
};

/// Which snapshot's recorded ancestor to diff against when the two
/// sides disagree on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BaseSide {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Print the action table and change nothing.
    pub dry_run: bool,
    /// Resolve conflicts by mtime without backing up the loser.
    pub auto_resolve: bool,
    /// Collapse matching delete+add pairs into renames.
    pub infer_moves: bool,
    /// Ancestor selection override; defaults to the older recorded base.
    pub base: Option<BaseSide>,
}

/// Scan `root` and record it as a fresh snapshot at `snapshot_path`.
/// A relative root (`.`, `..`, `../x`) is resolved against the snapshot
/// file's own directory. Refuses to overwrite an existing snapshot file.
pub fn create_snapshot(snapshot_path: &str, root: &str) -> Result<()> {
    let mut store = SnapshotStore::open(snapshot_path)?;
    if store.exists()? {
        bail!("snapshot file already exists: {snapshot_path}");
    }

    let root_loc = Location::parse(&store.resolve_root_str(root))?;
    let mut backend = Backend::open(&root_loc)?;
    if !backend.exists(root_loc.path())? {
        bail!("root does not exist: {root}");
    }

    let mut files = backend
        .enumerate(root_loc.path(), None)
        .with_context(|| format!("scanning {root}"))?;
    exclude_self(&mut files, store.location(), &root_loc);

    // `.`-relative roots are stored verbatim so the snapshot stays valid
    // when the tree is carried to another machine or backend.
    let stored_root = if root == "." || root == ".." || root.starts_with("../") {
        root.to_string()
    } else {
        root_loc.to_string()
    };

    let count = files.len();
    store.rebuild(files, &stored_root)?;
    log_to_file(&format!("created {snapshot_path} over {stored_root} ({count} entries)")).ok();
    println!(
        "Created {} covering {} entries under {}.",
        snapshot_path.green(),
        count,
        stored_root
    );
    Ok(())
}

/// Rescan the tree and refresh the snapshot's `current` item. With a
/// `prefix`, only that subtree is rescanned and spliced in; everything
/// outside it keeps its recorded state.
pub fn update_snapshot(snapshot_path: &str, prefix: Option<&str>) -> Result<()> {
    let mut store = SnapshotStore::open(snapshot_path)?;
    let snap = store.load().with_context(|| format!("loading {snapshot_path}"))?;
    let root_str = store.resolved_root(&snap);
    let root_loc = Location::parse(&root_str)?;
    let mut backend = Backend::open(&root_loc)?;

    match prefix {
        None => {
            let mut files = backend
                .enumerate(root_loc.path(), Some(&snap.current.files))
                .with_context(|| format!("scanning {root_str}"))?;
            exclude_self(&mut files, store.location(), &root_loc);
            store.update(files)?;
        }
        Some(prefix) => {
            let prefix = prefix.trim_matches('/');
            if prefix.is_empty() {
                bail!("empty update prefix");
            }
            let sub_root = format!("{}/{prefix}", root_loc.path());
            if !backend.exists(&sub_root)? {
                bail!("no such subtree under the snapshot root: {prefix}");
            }

            // prior entries remapped into the subtree's own frame so the
            // unchanged-directory reuse still applies
            let marker = format!("{prefix}/");
            let prior: FileListing = snap
                .current
                .files
                .iter()
                .filter_map(|(k, v)| k.strip_prefix(&marker).map(|r| (r.to_string(), *v)))
                .filter(|(k, _)| !k.is_empty())
                .collect();

            let sub = backend
                .enumerate(&sub_root, Some(&prior))
                .with_context(|| format!("scanning {root_str}/{prefix}"))?;
            let mut files: FileListing = sub
                .into_iter()
                .map(|(k, v)| (format!("{marker}{k}"), v))
                .collect();
            // the subtree's own directory key is outside the partial scan;
            // carry the recorded stamp forward
            if let Some(&dir_mtime) = snap.current.files.get(&marker) {
                files.insert(marker.clone(), dir_mtime);
            }
            exclude_self(&mut files, store.location(), &root_loc);
            store.partial_update(files, prefix)?;
        }
    }

    log_to_file(&format!("updated {snapshot_path}")).ok();
    println!("Updated {}.", snapshot_path.green());
    Ok(())
}

/// Reconcile the two trees the snapshots describe, then lock both
/// snapshots to the merged result as their new common ancestor.
pub fn sync_snapshots(left_path: &str, right_path: &str, options: &SyncOptions) -> Result<()> {
    // rescan both sides so the diff works from the trees as they are now
    update_snapshot(left_path, None)?;
    update_snapshot(right_path, None)?;

    let mut store_l = SnapshotStore::open(left_path)?;
    let mut store_r = SnapshotStore::open(right_path)?;
    let snap_l = store_l.load()?;
    let snap_r = store_r.load()?;

    let current_hash = hash_files(&snap_l.current.files);
    if current_hash == hash_files(&snap_r.current.files) {
        println!("{}", "Both trees are identical.".green());
        // converge the recorded ancestors so the next diff starts here
        if version_hash(&snap_l.base.version) != current_hash
            || version_hash(&snap_r.base.version) != current_hash
        {
            store_l.lock(&snap_l.current.files)?;
            store_r.lock(&snap_l.current.files)?;
        }
        return Ok(());
    }

    let base = choose_base(&snap_l, &snap_r, options.base);
    let changes_l = compare_new_to_old(&snap_l.current.files, base);
    let changes_r = compare_new_to_old(&snap_r.current.files, base);
    let actions =
        compose_changes(&changes_l, &changes_r, options.auto_resolve, options.infer_moves);

    if options.dry_run {
        preview_changes(&actions);
        return Ok(());
    }
    if actions.is_empty() {
        println!("{}", "Already in sync, nothing to do.".green());
        return Ok(());
    }

    let root_l = store_l.resolved_root(&snap_l);
    let root_r = store_r.resolved_root(&snap_r);
    let loc_l = Location::parse(&root_l)?;
    let loc_r = Location::parse(&root_r)?;
    let mut backend_l = Backend::open(&loc_l)?;
    let mut backend_r = Backend::open(&loc_r)?;

    let backup_dir = ConfigManager::new_conflicts_dir()?;
    let report = apply_changes(
        &actions,
        base,
        Peer {
            backend: &mut backend_l,
            root: loc_l.path(),
            files: &snap_l.current.files,
        },
        Peer {
            backend: &mut backend_r,
            root: loc_r.path(),
            files: &snap_r.current.files,
        },
        &backup_dir,
    )?;

    // both snapshots only move to the new ancestor after every action
    // landed; an interrupted run re-diffs from the old ancestor instead
    store_l.lock(&report.merged)?;
    store_r.lock(&report.merged)?;

    log_to_file(&format!(
        "synced {left_path} <-> {right_path}: {} actions, {} conflicts",
        actions.len(),
        report.conflicts
    ))
    .ok();
    println!("\nApplied {} actions.", actions.len());
    if let Some(dir) = report.backup_dir {
        println!(
            "{}",
            format!(
                "{} conflicting files were backed up to {}",
                report.conflicts,
                dir.display()
            )
            .yellow()
        );
    }
    Ok(())
}

/// Merge two trees that never shared an ancestor: the union of both,
/// with same-key collisions treated as conflicts. Both snapshots are
/// locked to the union afterwards, so later runs can use `sync`.
pub fn merge_snapshots(
    left_path: &str,
    right_path: &str,
    dry_run: bool,
    auto_resolve: bool,
) -> Result<()> {
    update_snapshot(left_path, None)?;
    update_snapshot(right_path, None)?;

    let mut store_l = SnapshotStore::open(left_path)?;
    let mut store_r = SnapshotStore::open(right_path)?;
    let snap_l = store_l.load()?;
    let snap_r = store_r.load()?;

    // entries both sides agree on byte-for-byte in the listing sense
    // (same key, same mtime) form the working ancestor; everything else
    // is an addition on its own side
    let mut base = FileListing::new();
    let empty = FileListing::new();
    let mut changes_l: ChangeSet = compare_new_to_old(&snap_l.current.files, &empty);
    let mut changes_r: ChangeSet = compare_new_to_old(&snap_r.current.files, &empty);
    for (key, mtime) in &snap_l.current.files {
        if snap_r.current.files.get(key) == Some(mtime) {
            base.insert(key.clone(), *mtime);
            changes_l.remove(key);
            changes_r.remove(key);
        }
    }

    let actions = compose_changes(&changes_l, &changes_r, auto_resolve, false);

    if dry_run {
        preview_changes(&actions);
        return Ok(());
    }
    if actions.is_empty() {
        println!("{}", "Nothing to merge.".green());
        store_l.lock(&base)?;
        store_r.lock(&base)?;
        return Ok(());
    }

    let root_l = store_l.resolved_root(&snap_l);
    let root_r = store_r.resolved_root(&snap_r);
    let loc_l = Location::parse(&root_l)?;
    let loc_r = Location::parse(&root_r)?;
    let mut backend_l = Backend::open(&loc_l)?;
    let mut backend_r = Backend::open(&loc_r)?;

    let backup_dir = ConfigManager::new_conflicts_dir()?;
    let report = apply_changes(
        &actions,
        &base,
        Peer {
            backend: &mut backend_l,
            root: loc_l.path(),
            files: &snap_l.current.files,
        },
        Peer {
            backend: &mut backend_r,
            root: loc_r.path(),
            files: &snap_r.current.files,
        },
        &backup_dir,
    )?;

    store_l.lock(&report.merged)?;
    store_r.lock(&report.merged)?;

    log_to_file(&format!(
        "merged {left_path} <-> {right_path}: {} actions, {} conflicts",
        actions.len(),
        report.conflicts
    ))
    .ok();
    println!("\nMerged {} entries.", report.merged.len());
    if let Some(dir) = report.backup_dir {
        println!(
            "{}",
            format!(
                "{} colliding files were backed up to {}",
                report.conflicts,
                dir.display()
            )
            .yellow()
        );
    }
    Ok(())
}

/// The ancestor listing a sync diffs both sides against. Matching base
/// hashes mean both snapshots recorded the same ancestor and either
/// listing serves; diverged bases fall back to the older one, which is
/// the last state both sides could have seen.
fn choose_base<'a>(
    left: &'a Snapshot,
    right: &'a Snapshot,
    pick: Option<BaseSide>,
) -> &'a FileListing {
    if let Some(side) = pick {
        return match side {
            BaseSide::Left => &left.base.files,
            BaseSide::Right => &right.base.files,
        };
    }
    if same_ancestor(&left.base.version, &right.base.version) {
        return &left.base.files;
    }
    log::warn!("snapshot ancestors diverge; diffing against the older base");
    if version_time(&left.base.version) <= version_time(&right.base.version) {
        &left.base.files
    } else {
        &right.base.files
    }
}

/// Drop the snapshot file's own key from a listing when the snapshot
/// lives inside the tree it describes. The snapshot must never sync
/// itself: it changes on every run and the two sides' copies always
/// differ.
fn exclude_self(files: &mut FileListing, store_loc: &Location, root: &Location) {
    let same_backend = matches!(
        (store_loc, root),
        (Location::Local { .. }, Location::Local { .. })
    ) || match (store_loc, root) {
        (
            Location::Ftp { host: h1, port: p1, .. },
            Location::Ftp { host: h2, port: p2, .. },
        )
        | (
            Location::Agent { host: h1, port: p1, .. },
            Location::Agent { host: h2, port: p2, .. },
        ) => h1 == h2 && p1 == p2,
        _ => false,
    };
    if !same_backend {
        return;
    }
    let root_prefix = format!("{}/", root.path().trim_end_matches('/'));
    if let Some(key) = store_loc.path().strip_prefix(&root_prefix) {
        files.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(pairs: &[(&str, i64)]) -> FileListing {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn snap_with_base(version: &str, files: FileListing) -> Snapshot {
        Snapshot {
            root: "/data".into(),
            ignores: Vec::new(),
            base: crate::snapshot::SnapshotItem {
                version: version.into(),
                files,
            },
            current: crate::snapshot::SnapshotItem::new(FileListing::new()),
        }
    }

    #[test]
    fn matching_ancestors_use_the_left_base() {
        let l = snap_with_base("aa-100", listing(&[("x", 1)]));
        let r = snap_with_base("aa-200", listing(&[("y", 2)]));
        assert_eq!(choose_base(&l, &r, None), &l.base.files);
    }

    #[test]
    fn diverged_ancestors_fall_back_to_the_older_base() {
        let l = snap_with_base("aa-300", listing(&[("x", 1)]));
        let r = snap_with_base("bb-200", listing(&[("y", 2)]));
        assert_eq!(choose_base(&l, &r, None), &r.base.files);
    }

    #[test]
    fn explicit_base_side_overrides_the_heuristic() {
        let l = snap_with_base("aa-300", listing(&[("x", 1)]));
        let r = snap_with_base("bb-200", listing(&[("y", 2)]));
        assert_eq!(choose_base(&l, &r, Some(BaseSide::Left)), &l.base.files);
    }

    #[test]
    fn snapshot_inside_its_own_root_is_excluded() {
        let mut files = listing(&[("a.txt", 1), ("state.json", 2)]);
        let store_loc = Location::Local {
            path: "/data/docs/state.json".into(),
        };
        let root = Location::Local {
            path: "/data/docs".into(),
        };
        exclude_self(&mut files, &store_loc, &root);
        assert!(!files.contains_key("state.json"));
        assert!(files.contains_key("a.txt"));
    }

    #[test]
    fn snapshot_outside_the_root_is_left_alone() {
        let mut files = listing(&[("state.json", 2)]);
        let store_loc = Location::Local {
            path: "/elsewhere/state.json".into(),
        };
        let root = Location::Local {
            path: "/data/docs".into(),
        };
        exclude_self(&mut files, &store_loc, &root);
        assert!(files.contains_key("state.json"));
    }

    #[test]
    fn remote_snapshot_does_not_shadow_a_local_key() {
        let mut files = listing(&[("state.json", 2)]);
        let store_loc = Location::Ftp {
            host: "h".into(),
            port: 21,
            path: "/data/docs/state.json".into(),
        };
        let root = Location::Local {
            path: "/data/docs".into(),
        };
        exclude_self(&mut files, &store_loc, &root);
        assert!(files.contains_key("state.json"));
    }
}
