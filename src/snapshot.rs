//! Snapshot data model, versioning, and the snapshot store.
//!
//! A snapshot file is a small JSON document describing one tree: the
//! `base` item is the last state both peers agreed on (the common
//! ancestor), `current` is the latest known scan. The file is path
//! independent — it can live inside the tree it describes, next to it,
//! or on a completely different backend.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::fs::{Backend, FileListing};
use crate::location::{normalize_slashes, parent_of, Location};

/// One recorded state of a tree: a content-addressed version string and
/// the flat file listing it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotItem {
    /// `<md5-hex>-<unix-time>`: hash of the canonical key-sorted JSON of
    /// `files`, plus the moment this item was recorded.
    pub version: String,
    pub files: FileListing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Path or backend URL of the tree this snapshot describes.
    pub root: String,
    /// Ignore patterns. Reserved for future use; not yet enforced.
    #[serde(default)]
    pub ignores: Vec<String>,
    pub base: SnapshotItem,
    pub current: SnapshotItem,
}

/// MD5 over the canonical JSON rendering of a listing. The `BTreeMap`
/// serializes key-sorted, so the hash is independent of the order any
/// backend discovered entries in.
pub fn hash_files(files: &FileListing) -> String {
    // string keys and integer values cannot fail to serialize
    let canonical = serde_json::to_vec(files).unwrap_or_default();
    format!("{:x}", md5::compute(canonical))
}

pub fn make_version(files: &FileListing) -> String {
    format!("{}-{}", hash_files(files), chrono::Utc::now().timestamp())
}

/// Hash segment of a version string.
pub fn version_hash(version: &str) -> &str {
    version.split('-').next().unwrap_or(version)
}

/// Timestamp segment of a version string (0 when malformed).
pub fn version_time(version: &str) -> i64 {
    version
        .rsplit('-')
        .next()
        .and_then(|t| t.parse().ok())
        .unwrap_or(0)
}

/// Two versions denote the same ancestor iff their hash segments match,
/// regardless of when each side recorded it.
pub fn same_ancestor(a: &str, b: &str) -> bool {
    version_hash(a) == version_hash(b)
}

impl SnapshotItem {
    pub fn new(files: FileListing) -> Self {
        SnapshotItem {
            version: make_version(&files),
            files,
        }
    }
}

/// Loads and saves one snapshot file, wherever it lives.
///
/// The snapshot record may be local even when the tree it describes is
/// remote, and vice versa: the store's backend follows the snapshot
/// file's location, not the tree's.
pub struct SnapshotStore {
    location: Location,
    backend: Backend,
}

impl SnapshotStore {
    pub fn open(raw: &str) -> Result<Self> {
        if !raw.ends_with(".json") {
            return Err(SyncError::Snapshot(format!(
                "snapshot file must end with .json: {raw}"
            )));
        }
        let location = Location::parse(raw)?;
        let backend = Backend::open(&location)?;
        Ok(SnapshotStore { location, backend })
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Path of the snapshot file inside its backend's address space.
    pub fn file_path(&self) -> &str {
        self.location.path()
    }

    pub fn exists(&mut self) -> Result<bool> {
        let path = self.location.path().to_string();
        self.backend.exists(&path)
    }

    pub fn load(&mut self) -> Result<Snapshot> {
        let path = self.location.path().to_string();
        self.backend.load_json(&path)
    }

    pub fn save(&mut self, snapshot: &Snapshot) -> Result<()> {
        let path = self.location.path().to_string();
        self.backend.dump_json(snapshot, &path)
    }

    /// The snapshot's root with any relative form (`.`, `..`, `../x`)
    /// resolved against the snapshot file's parent directory.
    pub fn resolved_root(&self, snapshot: &Snapshot) -> String {
        self.resolve_root_str(&snapshot.root)
    }

    /// Resolve a root string the way [`Self::resolved_root`] does.
    /// Relative roots stay on the snapshot file's own backend.
    pub fn resolve_root_str(&self, root: &str) -> String {
        if root == "." || root == ".." || root.starts_with("../") {
            let joined = format!("{}/{}", parent_of(self.location.path()), root);
            self.location
                .with_path(&collapse_dots(&normalize_slashes(&joined)))
        } else {
            root.to_string()
        }
    }

    /// Reset the snapshot to a freshly scanned state: base and current
    /// both become the given listing under one new version.
    pub fn rebuild(&mut self, files: FileListing, root: &str) -> Result<()> {
        let item = SnapshotItem::new(files);
        let snapshot = Snapshot {
            root: root.to_string(),
            ignores: Vec::new(),
            base: item.clone(),
            current: item,
        };
        self.save(&snapshot)
    }

    /// Replace `current` only. A rescan that produced the exact same
    /// listing (equal hash) is a no-op: the file is not rewritten and the
    /// recorded version keeps its original timestamp.
    pub fn update(&mut self, files: FileListing) -> Result<()> {
        let mut snapshot = self.load()?;
        if hash_files(&files) == version_hash(&snapshot.current.version) {
            log::debug!("current listing unchanged, skipping snapshot write");
            return Ok(());
        }
        snapshot.current = SnapshotItem::new(files);
        self.save(&snapshot)
    }

    /// Replace only the subset of `current` under `prefix` (a relpath,
    /// normalized to end with `/` so `sub` can never capture
    /// `subzero.txt`), leaving the rest of the listing untouched.
    pub fn partial_update(&mut self, files: FileListing, prefix: &str) -> Result<()> {
        let prefix = if prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{prefix}/")
        };

        let mut snapshot = self.load()?;
        let mut merged: FileListing = snapshot
            .current
            .files
            .iter()
            .filter(|(k, _)| !k.starts_with(&prefix) && **k != prefix[..prefix.len() - 1])
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        merged.extend(files);

        snapshot.current = SnapshotItem::new(merged);
        self.save(&snapshot)
    }

    /// Write the merged post-sync listing as the new common ancestor:
    /// base and current become one identical item. Root and ignores are
    /// preserved.
    pub fn lock(&mut self, files: &FileListing) -> Result<()> {
        let mut snapshot = self.load()?;
        let item = SnapshotItem::new(files.clone());
        snapshot.base = item.clone();
        snapshot.current = item;
        self.save(&snapshot)
    }
}

/// Collapse `.` and `..` components of an already slash-normalized path.
fn collapse_dots(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}
