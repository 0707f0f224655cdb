//! Three-way diff: single-sided change detection against the common
//! ancestor, composition of two independent change lists into one
//! ordered, conflict-flagged action list, and optional move inference.
//!
//! The engine is driven entirely by modification times. Content hashes
//! are only ever used for ancestor identity, never to classify changes.

use std::collections::{HashMap, HashSet};
use std::collections::BTreeMap;
use std::fmt;

use crate::fs::FileListing;
use crate::location::basename_of;

/// Directional classification of one key's change.
///
/// `Right`-suffixed movements propagate the left side's state toward the
/// right peer, and vice versa. The two `Conflict` variants exist only
/// between composition and application: the executor must back up the
/// losing side's file and then apply them as plain updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Movement {
    AddRight,
    UpdateRight,
    DeleteRight,
    MoveRight,
    AddLeft,
    UpdateLeft,
    DeleteLeft,
    MoveLeft,
    ConflictUpdateRight,
    ConflictUpdateLeft,
}

impl Movement {
    pub fn is_conflict(self) -> bool {
        matches!(
            self,
            Movement::ConflictUpdateRight | Movement::ConflictUpdateLeft
        )
    }

    /// The plain movement a conflict-flagged action turns into once the
    /// loser has been backed up.
    pub fn resolved(self) -> Self {
        match self {
            Movement::ConflictUpdateRight => Movement::UpdateRight,
            Movement::ConflictUpdateLeft => Movement::UpdateLeft,
            other => other,
        }
    }

    /// Whether the action mutates the right peer.
    pub fn is_toward_right(self) -> bool {
        matches!(
            self,
            Movement::AddRight
                | Movement::UpdateRight
                | Movement::DeleteRight
                | Movement::MoveRight
                | Movement::ConflictUpdateRight
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Movement::AddRight => "+>",
            Movement::UpdateRight => "=>",
            Movement::DeleteRight => "->",
            Movement::MoveRight => "~>",
            Movement::AddLeft => "<+",
            Movement::UpdateLeft => "<=",
            Movement::DeleteLeft => "<-",
            Movement::MoveLeft => "<~",
            Movement::ConflictUpdateRight => "=>?",
            Movement::ConflictUpdateLeft => "<=?",
        }
    }
}

impl fmt::Display for Movement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// One side's change for a single key, relative to the ancestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Added(i64),
    Updated(i64),
    Deleted(i64),
}

impl Change {
    pub fn time(self) -> i64 {
        match self {
            Change::Added(t) | Change::Updated(t) | Change::Deleted(t) => t,
        }
    }

    pub fn is_delete(self) -> bool {
        matches!(self, Change::Deleted(_))
    }
}

/// Key-sorted single-sided change list.
pub type ChangeSet = BTreeMap<String, Change>;

/// One composed, directional action. For moves, `moved_from` carries the
/// old relpath and `key` the new one; the move is executed as a rename on
/// the lagging side rather than a full re-transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeAction {
    pub key: String,
    pub moved_from: Option<String>,
    pub movement: Movement,
    pub mtime: i64,
}

impl ChangeAction {
    fn plain(key: &str, movement: Movement, mtime: i64) -> Self {
        ChangeAction {
            key: key.to_string(),
            moved_from: None,
            movement,
            mtime,
        }
    }
}

/// Compare a fresh scan against the ancestor listing.
///
/// A key present on both sides with a strictly greater mtime is an
/// update; with a strictly smaller mtime it is a clock regression —
/// logged and skipped, not classified as a change. Directory keys
/// regress routinely (their mtime tracks content churn), so they skip
/// silently.
pub fn compare_new_to_old(new: &FileListing, old: &FileListing) -> ChangeSet {
    let mut changes = ChangeSet::new();

    for (key, &time_new) in new {
        match old.get(key) {
            None => {
                changes.insert(key.clone(), Change::Added(time_new));
            }
            Some(&time_old) if time_new > time_old => {
                changes.insert(key.clone(), Change::Updated(time_new));
            }
            Some(&time_old) if time_new < time_old => {
                if !key.ends_with('/') {
                    log::warn!(
                        "clock regression on '{key}': rescanned mtime {time_new} \
                         predates recorded {time_old}; not treated as a change"
                    );
                }
            }
            _ => {}
        }
    }

    for (key, &time_old) in old {
        if !new.contains_key(key) {
            changes.insert(key.clone(), Change::Deleted(time_old));
        }
    }

    changes
}

/// Compose two independent change lists (left and right, both relative
/// to the same ancestor) into one ordered action list.
///
/// Rules, per key:
/// - changed on both sides, neither a delete: conflict. The greater
///   mtime wins, ties go to left. With `auto_resolve` the winner
///   propagates unconditionally; otherwise the action carries a conflict
///   flag and the loser must be backed up at apply time.
/// - one side edited, the other deleted: the live edit wins and the file
///   is re-added on the deleting side. A deletion never silently beats
///   an edit.
/// - deleted on both sides: already consistent, no action.
/// - changed on one side only: propagated toward the other side.
///
/// With `infer_moves`, a deletion and an addition on the same side that
/// agree on basename and mtime collapse into a single rename action —
/// but only when the match is unambiguous. Two same-named, same-mtime
/// deletion candidates stay ordinary add+delete pairs, since guessing
/// wrong would silently relocate the wrong file.
pub fn compose_changes(
    left: &ChangeSet,
    right: &ChangeSet,
    auto_resolve: bool,
    infer_moves: bool,
) -> Vec<ChangeAction> {
    let mut actions = Vec::new();
    let mut consumed: HashSet<String> = HashSet::new();

    if infer_moves {
        let (mut moves, used) = infer_side_moves(left, Movement::MoveRight);
        actions.append(&mut moves);
        consumed.extend(used);

        let (mut moves, used) = infer_side_moves(right, Movement::MoveLeft);
        actions.append(&mut moves);
        consumed.extend(used);
    }

    for (key, &change_l) in left {
        if consumed.contains(key) {
            continue;
        }
        match right.get(key) {
            Some(&change_r) => {
                match (change_l.is_delete(), change_r.is_delete()) {
                    (false, false) => {
                        let (tl, tr) = (change_l.time(), change_r.time());
                        // directory keys carry no content to lose; their
                        // stamp disagreements resolve without a backup
                        let resolve = auto_resolve || key.ends_with('/');
                        let movement = if tl >= tr {
                            if resolve {
                                Movement::UpdateRight
                            } else {
                                Movement::ConflictUpdateRight
                            }
                        } else if resolve {
                            Movement::UpdateLeft
                        } else {
                            Movement::ConflictUpdateLeft
                        };
                        actions.push(ChangeAction::plain(key, movement, tl.max(tr)));
                    }
                    (false, true) => {
                        // right deleted, left edited: resurrect on right
                        actions.push(ChangeAction::plain(
                            key,
                            Movement::AddRight,
                            change_l.time(),
                        ));
                    }
                    (true, false) => {
                        actions.push(ChangeAction::plain(
                            key,
                            Movement::AddLeft,
                            change_r.time(),
                        ));
                    }
                    (true, true) => {}
                }
            }
            None => {
                let movement = match change_l {
                    Change::Added(_) => Movement::AddRight,
                    Change::Updated(_) => Movement::UpdateRight,
                    Change::Deleted(_) => Movement::DeleteRight,
                };
                actions.push(ChangeAction::plain(key, movement, change_l.time()));
            }
        }
    }

    for (key, &change_r) in right {
        if consumed.contains(key) || left.contains_key(key) {
            continue;
        }
        let movement = match change_r {
            Change::Added(_) => Movement::AddLeft,
            Change::Updated(_) => Movement::UpdateLeft,
            Change::Deleted(_) => Movement::DeleteLeft,
        };
        actions.push(ChangeAction::plain(key, movement, change_r.time()));
    }

    actions
}

/// Pair up one side's deletions and additions into rename actions.
/// Deletions are grouped by `(basename, mtime)`; an addition matching
/// exactly one candidate becomes a move, anything ambiguous is left
/// alone. Returns the actions plus the keys they consumed.
fn infer_side_moves(
    changes: &ChangeSet,
    movement: Movement,
) -> (Vec<ChangeAction>, HashSet<String>) {
    let mut deletions: HashMap<(&str, i64), Vec<&String>> = HashMap::new();
    for (key, change) in changes {
        if key.ends_with('/') {
            continue; // directory keys never participate in move pairing
        }
        if let Change::Deleted(t) = change {
            deletions
                .entry((basename_of(key), *t))
                .or_default()
                .push(key);
        }
    }

    let mut moves = Vec::new();
    let mut consumed = HashSet::new();

    if deletions.is_empty() {
        return (moves, consumed);
    }

    for (key, change) in changes {
        if key.ends_with('/') {
            continue;
        }
        if let Change::Added(t) = change {
            if let Some(candidates) = deletions.get(&(basename_of(key), *t)) {
                if candidates.len() == 1 {
                    let old_key = candidates[0].clone();
                    consumed.insert(key.clone());
                    consumed.insert(old_key.clone());
                    moves.push(ChangeAction {
                        key: key.clone(),
                        moved_from: Some(old_key),
                        movement,
                        mtime: *t,
                    });
                }
            }
        }
    }

    (moves, consumed)
}
