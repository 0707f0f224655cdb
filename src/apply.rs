//! Executes a composed action list against the two peers: preview
//! table, conflict backups, whole-file transfers, renames, deletions,
//! and the merged-listing bookkeeping the post-sync lock is built from.
//!
//! There is no rollback. Each applied action leaves both trees and the
//! merged listing consistent with each other, so an interrupted run is
//! picked up by the next one: already-applied actions simply no longer
//! diff.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use colored::{ColoredString, Colorize};

use crate::diff::{ChangeAction, Movement};
use crate::error::SyncError;
use crate::fs::{transfer, Backend, FileListing, LocalFs};
use crate::location::parent_of;

/// One side of a sync run: its backend, tree root, and current listing.
/// The listing seeds directory memoization and supplies real mtimes for
/// conflict backups.
pub struct Peer<'a> {
    pub backend: &'a mut Backend,
    pub root: &'a str,
    pub files: &'a FileListing,
}

/// What a run did: the merged listing to lock both snapshots to, plus
/// conflict accounting for the final report.
pub struct ApplyReport {
    pub merged: FileListing,
    pub conflicts: usize,
    pub backup_dir: Option<PathBuf>,
}

/// Print the action table without touching either side.
pub fn preview_changes(actions: &[ChangeAction]) {
    if actions.is_empty() {
        println!("{}", "Already in sync, nothing to do.".green());
        return;
    }

    println!("{:>4}  {:<44} {:^4}  {}", "#", "left", "", "right");
    let mut counts: std::collections::BTreeMap<&'static str, usize> =
        std::collections::BTreeMap::new();
    for (index, action) in actions.iter().enumerate() {
        let (left, right) = columns(action);
        println!(
            "{:>4}  {:<44} {:^4}  {}",
            index + 1,
            left,
            action.movement.symbol(),
            right
        );
        *counts.entry(action.movement.symbol()).or_insert(0) += 1;
    }

    let summary = counts
        .iter()
        .map(|(symbol, n)| format!("{symbol} {n}"))
        .collect::<Vec<_>>()
        .join(", ");
    println!("\n{} actions ({summary})", actions.len());
}

/// Apply every action in order. `base` is the ancestor listing the
/// merged result starts from; `backup_dir` is an existing directory for
/// conflict copies, removed again at the end if no conflict used it.
///
/// A conflict-flagged action first copies the losing side's file (bytes
/// and mtime) into `backup_dir`, then applies as a plain update. A
/// failed backup aborts the whole run: the engine never overwrites a
/// file it could not preserve.
pub fn apply_changes<'a>(
    actions: &[ChangeAction],
    base: &FileListing,
    mut left: Peer<'a>,
    mut right: Peer<'a>,
    backup_dir: &Path,
) -> Result<ApplyReport> {
    let mut merged = base.clone();
    let mut left_dirs = seeded_dirs(left.files, left.root);
    let mut right_dirs = seeded_dirs(right.files, right.root);
    let mut conflicts = 0usize;

    for (index, action) in actions.iter().enumerate() {
        if action.movement.is_conflict() {
            let (loser, tag) = if action.movement == Movement::ConflictUpdateRight {
                (&mut right, "right")
            } else {
                (&mut left, "left")
            };
            backup_loser(loser, &action.key, tag, backup_dir).map_err(|e| {
                log::error!("backup of '{}' failed: {e}", action.key);
                SyncError::Conflict {
                    key: action.key.clone(),
                    backup_dir: backup_dir.to_path_buf(),
                }
            })?;
            conflicts += 1;
        }

        let movement = action.movement.resolved();
        let (col_l, col_r) = columns(action);
        println!(
            "{:>4}  {:<44} {:^4}  {}",
            index + 1,
            col_l,
            action.movement.symbol(),
            col_r
        );
        log::debug!("applying {} {}", movement.symbol(), action.key);

        if movement.is_toward_right() {
            execute(&mut left, &mut right, &mut right_dirs, action, movement, &mut merged)?;
        } else {
            execute(&mut right, &mut left, &mut left_dirs, action, movement, &mut merged)?;
        }
    }

    let backup_dir = finish_backup_dir(backup_dir, conflicts)?;
    Ok(ApplyReport {
        merged,
        conflicts,
        backup_dir,
    })
}

/// Run one resolved action from `src` toward `dst`.
fn execute(
    src: &mut Peer<'_>,
    dst: &mut Peer<'_>,
    dst_dirs: &mut HashSet<String>,
    action: &ChangeAction,
    movement: Movement,
    merged: &mut FileListing,
) -> Result<()> {
    use Movement::*;

    match movement {
        AddRight | UpdateRight | AddLeft | UpdateLeft => {
            if let Some(dir) = action.key.strip_suffix('/') {
                let abs = format!("{}/{dir}", dst.root);
                if dst_dirs.insert(abs.clone()) {
                    dst.backend.make_dirs(&abs)?;
                }
            } else {
                let from = format!("{}/{}", src.root, action.key);
                let to = format!("{}/{}", dst.root, action.key);
                ensure_parent(dst, dst_dirs, &to)?;
                transfer(src.backend, &from, dst.backend, &to, action.mtime)
                    .with_context(|| format!("transferring '{}'", action.key))?;
            }
            merged.insert(action.key.clone(), action.mtime);
        }
        DeleteRight | DeleteLeft => {
            // A directory deletion removes the subtree in one call; the
            // children's own delete actions then find nothing on disk and
            // only update the merged listing.
            let trimmed = action.key.trim_end_matches('/');
            let abs = format!("{}/{trimmed}", dst.root);
            if dst.backend.exists(&abs)? {
                if action.key.ends_with('/') {
                    // best-effort: a directory that picked up new entries
                    // since the scan should not sink the whole run
                    if let Err(e) = dst.backend.remove_dir(&abs) {
                        log::warn!("could not remove directory '{}': {e}", action.key);
                    }
                } else {
                    dst.backend.remove_file(&abs)?;
                }
            }
            merged.remove(&action.key);
        }
        MoveRight | MoveLeft => {
            let from_key = action
                .moved_from
                .as_deref()
                .ok_or_else(|| anyhow!("move action for '{}' lacks a source key", action.key))?;
            let from = format!("{}/{from_key}", dst.root);
            let to = format!("{}/{}", dst.root, action.key);
            ensure_parent(dst, dst_dirs, &to)?;
            dst.backend
                .move_file(&from, &to)
                .with_context(|| format!("moving '{from_key}' to '{}'", action.key))?;
            merged.remove(from_key);
            merged.insert(action.key.clone(), action.mtime);
        }
        ConflictUpdateRight | ConflictUpdateLeft => {
            unreachable!("conflicts are resolved before dispatch")
        }
    }
    Ok(())
}

/// Known-existing directories on one side, seeded from its current
/// listing so existing structure never costs a remote round trip.
fn seeded_dirs(files: &FileListing, root: &str) -> HashSet<String> {
    let mut dirs = HashSet::new();
    dirs.insert(root.trim_end_matches('/').to_string());
    for key in files.keys() {
        if let Some(dir) = key.strip_suffix('/') {
            dirs.insert(format!("{root}/{dir}"));
        }
    }
    dirs
}

fn ensure_parent(dst: &mut Peer<'_>, dst_dirs: &mut HashSet<String>, abs_file: &str) -> Result<()> {
    let dir = parent_of(abs_file);
    if dst_dirs.insert(dir.to_string()) {
        dst.backend.make_dirs(dir)?;
    }
    Ok(())
}

/// Copy the losing side's file (bytes and mtime) under `backup_dir`,
/// mirroring the key's relative path and tagging the name with the side
/// it came from.
fn backup_loser(
    loser: &mut Peer<'_>,
    key: &str,
    side: &str,
    backup_dir: &Path,
) -> crate::error::Result<()> {
    let dest = backup_dir.join(backup_name(key, side));
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let from = format!("{}/{key}", loser.root);
    let mtime = loser.files.get(key).copied().unwrap_or(0);
    let mut local = Backend::Local(LocalFs::new());
    transfer(loser.backend, &from, &mut local, &dest.to_string_lossy(), mtime)?;
    log::info!("conflict: backed up {side} copy of '{key}' to {}", dest.display());
    Ok(())
}

/// `sub/report.pdf` backed up from the right side becomes
/// `sub/report.right.pdf`.
fn backup_name(key: &str, side: &str) -> PathBuf {
    let (dir, name) = key.rsplit_once('/').unwrap_or(("", key));
    let tagged = match name.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}.{side}.{ext}"),
        None => format!("{name}.{side}"),
    };
    if dir.is_empty() {
        PathBuf::from(tagged)
    } else {
        Path::new(dir).join(tagged)
    }
}

/// Drop the backup directory again when nothing was backed up into it.
fn finish_backup_dir(dir: &Path, conflicts: usize) -> Result<Option<PathBuf>> {
    if conflicts == 0 {
        if dir.exists() && dir.read_dir()?.next().is_none() {
            std::fs::remove_dir(dir)?;
        }
        return Ok(None);
    }
    Ok(Some(dir.to_path_buf()))
}

fn columns(action: &ChangeAction) -> (ColoredString, ColoredString) {
    use Movement::*;
    let key = action.key.as_str();
    let from = action.moved_from.as_deref().unwrap_or("");
    match action.movement {
        AddRight => (key.green(), "<absent>".dimmed()),
        UpdateRight => (key.blue(), "<outdated>".dimmed()),
        DeleteRight => ("<deleted>".dimmed(), key.red()),
        MoveRight => (key.cyan(), from.dimmed()),
        AddLeft => ("<absent>".dimmed(), key.green()),
        UpdateLeft => ("<outdated>".dimmed(), key.blue()),
        DeleteLeft => (key.red(), "<deleted>".dimmed()),
        MoveLeft => (from.dimmed(), key.cyan()),
        ConflictUpdateRight => (key.yellow().bold(), key.yellow()),
        ConflictUpdateLeft => (key.yellow(), key.yellow().bold()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use std::fs;

    fn touch(path: &Path, mtime: i64) {
        filetime::set_file_mtime(path, FileTime::from_unix_time(mtime, 0)).unwrap();
    }

    fn mtime_of(path: &Path) -> i64 {
        FileTime::from_last_modification_time(&fs::metadata(path).unwrap()).unix_seconds()
    }

    fn local() -> Backend {
        Backend::Local(LocalFs::new())
    }

    fn scan(root: &Path) -> FileListing {
        LocalFs::new()
            .enumerate(&root.to_string_lossy(), None)
            .unwrap()
    }

    fn action(key: &str, movement: Movement, mtime: i64) -> ChangeAction {
        ChangeAction {
            key: key.into(),
            moved_from: None,
            movement,
            mtime,
        }
    }

    #[test]
    fn add_update_delete_toward_right() {
        let l = tempfile::tempdir().unwrap();
        let r = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();

        fs::write(l.path().join("new.txt"), b"new").unwrap();
        fs::write(l.path().join("edited.txt"), b"v2").unwrap();
        fs::write(r.path().join("edited.txt"), b"v1").unwrap();
        fs::write(r.path().join("gone.txt"), b"gone").unwrap();
        touch(&l.path().join("new.txt"), 100);
        touch(&l.path().join("edited.txt"), 200);

        let left_files = scan(l.path());
        let right_files = scan(r.path());
        let base: FileListing =
            [("edited.txt".to_string(), 150), ("gone.txt".to_string(), 50)]
                .into_iter()
                .collect();

        let actions = vec![
            action("new.txt", Movement::AddRight, 100),
            action("edited.txt", Movement::UpdateRight, 200),
            action("gone.txt", Movement::DeleteRight, 50),
        ];

        let (mut lb, mut rb) = (local(), local());
        let (lr, rr) = (
            l.path().to_string_lossy().into_owned(),
            r.path().to_string_lossy().into_owned(),
        );
        let report = apply_changes(
            &actions,
            &base,
            Peer { backend: &mut lb, root: &lr, files: &left_files },
            Peer { backend: &mut rb, root: &rr, files: &right_files },
            backups.path(),
        )
        .unwrap();

        assert_eq!(fs::read(r.path().join("new.txt")).unwrap(), b"new");
        assert_eq!(mtime_of(&r.path().join("new.txt")), 100);
        assert_eq!(fs::read(r.path().join("edited.txt")).unwrap(), b"v2");
        assert!(!r.path().join("gone.txt").exists());

        assert_eq!(report.conflicts, 0);
        assert_eq!(report.backup_dir, None);
        assert_eq!(report.merged.get("new.txt"), Some(&100));
        assert_eq!(report.merged.get("edited.txt"), Some(&200));
        assert!(!report.merged.contains_key("gone.txt"));
    }

    #[test]
    fn conflict_backs_up_the_loser_verbatim() {
        let l = tempfile::tempdir().unwrap();
        let r = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();

        fs::write(l.path().join("a.txt"), b"left words").unwrap();
        fs::write(r.path().join("a.txt"), b"right words").unwrap();
        touch(&l.path().join("a.txt"), 1010);
        touch(&r.path().join("a.txt"), 1020);

        let left_files = scan(l.path());
        let right_files = scan(r.path());
        let base: FileListing = [("a.txt".to_string(), 1000)].into_iter().collect();

        // right is newer: left's copy is backed up, then overwritten
        let actions = vec![action("a.txt", Movement::ConflictUpdateLeft, 1020)];

        let (mut lb, mut rb) = (local(), local());
        let (lr, rr) = (
            l.path().to_string_lossy().into_owned(),
            r.path().to_string_lossy().into_owned(),
        );
        let report = apply_changes(
            &actions,
            &base,
            Peer { backend: &mut lb, root: &lr, files: &left_files },
            Peer { backend: &mut rb, root: &rr, files: &right_files },
            backups.path(),
        )
        .unwrap();

        assert_eq!(report.conflicts, 1);
        assert_eq!(report.backup_dir.as_deref(), Some(backups.path()));

        let backup = backups.path().join("a.left.txt");
        assert_eq!(fs::read(&backup).unwrap(), b"left words");
        assert_eq!(mtime_of(&backup), 1010);

        assert_eq!(fs::read(l.path().join("a.txt")).unwrap(), b"right words");
        assert_eq!(mtime_of(&l.path().join("a.txt")), 1020);
        assert_eq!(report.merged.get("a.txt"), Some(&1020));
    }

    #[test]
    fn move_executes_as_a_rename_and_fixes_the_merged_listing() {
        let l = tempfile::tempdir().unwrap();
        let r = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();

        // left already has the new layout; right still has the old one
        fs::create_dir(l.path().join("dir2")).unwrap();
        fs::write(l.path().join("dir2").join("photo.jpg"), b"jpeg").unwrap();
        fs::create_dir(r.path().join("dir1")).unwrap();
        fs::write(r.path().join("dir1").join("photo.jpg"), b"jpeg").unwrap();
        touch(&r.path().join("dir1").join("photo.jpg"), 500);

        let left_files = scan(l.path());
        let right_files = scan(r.path());
        let base: FileListing = [
            ("dir1/".to_string(), 400),
            ("dir1/photo.jpg".to_string(), 500),
        ]
        .into_iter()
        .collect();

        let actions = vec![ChangeAction {
            key: "dir2/photo.jpg".into(),
            moved_from: Some("dir1/photo.jpg".into()),
            movement: Movement::MoveRight,
            mtime: 500,
        }];

        let (mut lb, mut rb) = (local(), local());
        let (lr, rr) = (
            l.path().to_string_lossy().into_owned(),
            r.path().to_string_lossy().into_owned(),
        );
        let report = apply_changes(
            &actions,
            &base,
            Peer { backend: &mut lb, root: &lr, files: &left_files },
            Peer { backend: &mut rb, root: &rr, files: &right_files },
            backups.path(),
        )
        .unwrap();

        assert_eq!(
            fs::read(r.path().join("dir2").join("photo.jpg")).unwrap(),
            b"jpeg"
        );
        assert!(!r.path().join("dir1").join("photo.jpg").exists());

        // the old key must leave the merged listing or the next run
        // would see a phantom deletion
        assert!(!report.merged.contains_key("dir1/photo.jpg"));
        assert_eq!(report.merged.get("dir2/photo.jpg"), Some(&500));
    }

    #[test]
    fn directory_key_creates_the_directory() {
        let l = tempfile::tempdir().unwrap();
        let r = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();

        fs::create_dir_all(l.path().join("sub")).unwrap();
        fs::write(l.path().join("sub").join("b.txt"), b"b").unwrap();
        touch(&l.path().join("sub").join("b.txt"), 200);

        let left_files = scan(l.path());
        let right_files = FileListing::new();

        let actions = vec![
            action("sub/", Movement::AddRight, 90),
            action("sub/b.txt", Movement::AddRight, 200),
        ];

        let (mut lb, mut rb) = (local(), local());
        let (lr, rr) = (
            l.path().to_string_lossy().into_owned(),
            r.path().to_string_lossy().into_owned(),
        );
        let report = apply_changes(
            &actions,
            &FileListing::new(),
            Peer { backend: &mut lb, root: &lr, files: &left_files },
            Peer { backend: &mut rb, root: &rr, files: &right_files },
            backups.path(),
        )
        .unwrap();

        assert!(r.path().join("sub").is_dir());
        assert_eq!(fs::read(r.path().join("sub").join("b.txt")).unwrap(), b"b");
        assert_eq!(report.merged.get("sub/"), Some(&90));
    }

    #[test]
    fn untouched_backup_dir_is_removed() {
        let l = tempfile::tempdir().unwrap();
        let r = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();
        let backup_path = backups.path().join("run");
        fs::create_dir(&backup_path).unwrap();

        let (mut lb, mut rb) = (local(), local());
        let (lr, rr) = (
            l.path().to_string_lossy().into_owned(),
            r.path().to_string_lossy().into_owned(),
        );
        let empty = FileListing::new();
        let report = apply_changes(
            &[],
            &empty,
            Peer { backend: &mut lb, root: &lr, files: &empty },
            Peer { backend: &mut rb, root: &rr, files: &empty },
            &backup_path,
        )
        .unwrap();

        assert!(!backup_path.exists());
        assert_eq!(report.backup_dir, None);
    }

    #[test]
    fn backup_names_keep_relative_paths_and_tag_the_side() {
        assert_eq!(
            backup_name("sub/report.pdf", "right"),
            PathBuf::from("sub/report.right.pdf")
        );
        assert_eq!(backup_name("README", "left"), PathBuf::from("README.left"));
    }
}
