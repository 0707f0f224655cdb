//! The filesystem backend contract shared by local disk, FTP, and the
//! remote filesystem agent.
//!
//! The backend kind is decided once, from the location's scheme prefix;
//! after construction every call site works through [`Backend`]'s uniform
//! capability set and never inspects which storage it is driving.

pub mod agent;
pub mod ftp;
pub mod local;

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::location::Location;

pub use agent::AgentFs;
pub use ftp::FtpFs;
pub use local::LocalFs;

/// Flat relpath → epoch-seconds mtime listing of a tree.
///
/// Keys ending in `/` are directory entries carrying the directory's own
/// mtime; all other keys are files. Hierarchy is implicit in key prefixes.
/// The sorted map makes enumeration, serialization, and hashing
/// deterministic regardless of the order a backend discovered entries in.
pub type FileListing = BTreeMap<String, i64>;

/// One concrete storage backend satisfying the capability contract.
pub enum Backend {
    Local(LocalFs),
    Ftp(FtpFs),
    Agent(AgentFs),
}

impl Backend {
    /// Open the backend a location lives on. Local backends are free to
    /// construct; FTP and agent backends connect eagerly so a bad address
    /// fails before any work starts.
    pub fn open(location: &Location) -> Result<Self> {
        match location {
            Location::Local { .. } => Ok(Backend::Local(LocalFs::new())),
            Location::Ftp { host, port, .. } => Ok(Backend::Ftp(FtpFs::connect(host, *port)?)),
            Location::Agent { host, port, .. } => {
                Ok(Backend::Agent(AgentFs::connect(host, *port)?))
            }
        }
    }

    pub fn exists(&mut self, path: &str) -> Result<bool> {
        match self {
            Backend::Local(fs) => fs.exists(path),
            Backend::Ftp(fs) => fs.exists(path),
            Backend::Agent(fs) => fs.exists(path),
        }
    }

    pub fn load(&mut self, path: &str) -> Result<Vec<u8>> {
        match self {
            Backend::Local(fs) => fs.load(path),
            Backend::Ftp(fs) => fs.load(path),
            Backend::Agent(fs) => fs.load(path),
        }
    }

    pub fn dump(&mut self, data: &[u8], path: &str) -> Result<()> {
        match self {
            Backend::Local(fs) => fs.dump(data, path),
            Backend::Ftp(fs) => fs.dump(data, path),
            Backend::Agent(fs) => fs.dump(data, path),
        }
    }

    /// Load structured data persisted as JSON.
    pub fn load_json<T: DeserializeOwned>(&mut self, path: &str) -> Result<T> {
        let bytes = self.load(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Serialize structured data to canonical JSON and write it out.
    pub fn dump_json<T: Serialize>(&mut self, value: &T, path: &str) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.dump(&bytes, path)
    }

    /// Recursively enumerate files and directories under `root` as a
    /// [`FileListing`]. When `prior` is given, subtrees whose directory
    /// mtime is unchanged are copied from it instead of being rescanned
    /// (correct as long as a directory's mtime changes whenever its
    /// immediate contents change).
    pub fn enumerate(&mut self, root: &str, prior: Option<&FileListing>) -> Result<FileListing> {
        match self {
            Backend::Local(fs) => fs.enumerate(root, prior),
            Backend::Ftp(fs) => fs.enumerate(root, prior),
            Backend::Agent(fs) => fs.enumerate(root),
        }
    }

    pub fn make_dirs(&mut self, path: &str) -> Result<()> {
        match self {
            Backend::Local(fs) => fs.make_dirs(path),
            Backend::Ftp(fs) => fs.make_dirs(path),
            Backend::Agent(fs) => fs.make_dirs(path),
        }
    }

    pub fn remove_file(&mut self, path: &str) -> Result<()> {
        match self {
            Backend::Local(fs) => fs.remove_file(path),
            Backend::Ftp(fs) => fs.remove_file(path),
            Backend::Agent(fs) => fs.remove_file(path),
        }
    }

    pub fn remove_dir(&mut self, path: &str) -> Result<()> {
        match self {
            Backend::Local(fs) => fs.remove_dir(path),
            Backend::Ftp(fs) => fs.remove_dir(path),
            Backend::Agent(fs) => fs.remove_dir(path),
        }
    }

    /// Rename within one backend. Used for inferred moves so a relocation
    /// costs one rename instead of a full re-transfer.
    pub fn move_file(&mut self, from: &str, to: &str) -> Result<()> {
        match self {
            Backend::Local(fs) => fs.move_file(from, to),
            Backend::Ftp(fs) => fs.move_file(from, to),
            Backend::Agent(fs) => fs.move_file(from, to),
        }
    }

    pub fn set_mtime(&mut self, path: &str, mtime: i64) -> Result<()> {
        match self {
            Backend::Local(fs) => fs.set_mtime(path, mtime),
            Backend::Ftp(fs) => fs.set_mtime(path, mtime),
            Backend::Agent(fs) => fs.set_mtime(path, mtime),
        }
    }
}

/// Copy one file across backends and stamp the destination with exactly
/// `mtime`. Mtime fidelity is load-bearing: the diff algorithm is driven
/// by mtimes, not content hashes.
pub fn transfer(
    src: &mut Backend,
    from: &str,
    dst: &mut Backend,
    to: &str,
    mtime: i64,
) -> Result<()> {
    let data = src.load(from)?;
    dst.dump(&data, to)?;
    dst.set_mtime(to, mtime)
}
