//! Local disk backend.

use std::path::Path;

use filetime::FileTime;
use walkdir::WalkDir;

use crate::error::Result;
use crate::fs::FileListing;
use crate::location::normalize_slashes;

/// Local filesystem backend. Paths are `/`-separated strings, the form
/// all snapshot roots and keys use regardless of platform.
pub struct LocalFs;

impl LocalFs {
    pub fn new() -> Self {
        LocalFs
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        Ok(Path::new(path).exists())
    }

    pub fn load(&self, path: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(path)?)
    }

    pub fn dump(&self, data: &[u8], path: &str) -> Result<()> {
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Walk `root`, producing relpath → mtime pairs for files and
    /// directories (directory keys end with `/`). When `prior` is given
    /// and a directory's mtime matches its prior entry, the prior keys
    /// under that prefix are reused and the subtree is not descended.
    pub fn enumerate(&self, root: &str, prior: Option<&FileListing>) -> Result<FileListing> {
        let mut out = FileListing::new();
        let base = Path::new(root);

        let mut walker = WalkDir::new(base)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = entry.map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::Other, format!("scan {root}: {e}"))
            })?;
            let rel = relpath_of(entry.path(), base);
            let meta = entry.metadata().map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::Other, format!("stat {rel}: {e}"))
            })?;
            let mtime = FileTime::from_last_modification_time(&meta).unix_seconds();

            if entry.file_type().is_dir() {
                let key = format!("{rel}/");
                if let Some(prior) = prior {
                    if prior.get(&key) == Some(&mtime) {
                        reuse_subtree(prior, &key, &mut out);
                        walker.skip_current_dir();
                        continue;
                    }
                }
                out.insert(key, mtime);
            } else if entry.file_type().is_file() {
                out.insert(rel, mtime);
            }
            // symlinks and other node types are not part of the contract
        }

        Ok(out)
    }

    pub fn make_dirs(&self, path: &str) -> Result<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    pub fn remove_file(&self, path: &str) -> Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }

    pub fn remove_dir(&self, path: &str) -> Result<()> {
        std::fs::remove_dir_all(path)?;
        Ok(())
    }

    pub fn move_file(&self, from: &str, to: &str) -> Result<()> {
        std::fs::rename(from, to)?;
        Ok(())
    }

    pub fn set_mtime(&self, path: &str, mtime: i64) -> Result<()> {
        filetime::set_file_mtime(path, FileTime::from_unix_time(mtime, 0))?;
        Ok(())
    }
}

impl Default for LocalFs {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy every prior key under `prefix` (the directory key itself
/// included) into `out`.
fn reuse_subtree(prior: &FileListing, prefix: &str, out: &mut FileListing) {
    for (k, v) in prior.range(prefix.to_string()..) {
        if !k.starts_with(prefix) {
            break;
        }
        out.insert(k.clone(), *v);
    }
}

fn relpath_of(path: &Path, base: &Path) -> String {
    let rel = path.strip_prefix(base).unwrap_or(path);
    normalize_slashes(&rel.to_string_lossy())
}
