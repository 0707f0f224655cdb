use std::path::Path;

use crate::error::{Result, SyncError};

/// Device-storage root that all `air://` paths must live under. The agent
/// process serves exactly this subtree of its host's filesystem.
pub const AGENT_DEVICE_ROOT: &str = "/storage/emulated/0";

/// A parsed path-or-URL location.
///
/// The scheme prefix is inspected exactly once, here; everything past this
/// point works against the [`crate::fs::Backend`] capability contract and
/// never asks which kind of storage it is talking to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Unprefixed path on the local filesystem (absolutized, `/`-separated).
    Local { path: String },
    /// `ftp://host:port/path`
    Ftp { host: String, port: u16, path: String },
    /// `air://host:port/path` — remote filesystem agent.
    Agent { host: String, port: u16, path: String },
}

impl Location {
    /// Parse a location string. Unprefixed inputs are treated as local
    /// paths and absolutized against the current directory.
    pub fn parse(raw: &str) -> Result<Self> {
        if let Some(rest) = raw.strip_prefix("ftp://") {
            let (host, port, path) = split_authority(raw, rest)?;
            Ok(Location::Ftp { host, port, path })
        } else if let Some(rest) = raw.strip_prefix("air://") {
            let (host, port, path) = split_authority(raw, rest)?;
            if !path.starts_with(AGENT_DEVICE_ROOT) {
                return Err(SyncError::Location(format!(
                    "{raw}: agent paths must live under {AGENT_DEVICE_ROOT}"
                )));
            }
            Ok(Location::Agent { host, port, path })
        } else if raw.contains("://") {
            Err(SyncError::Location(raw.to_string()))
        } else {
            Ok(Location::Local {
                path: absolutize(raw)?,
            })
        }
    }

    /// The path portion inside the backend's address space.
    pub fn path(&self) -> &str {
        match self {
            Location::Local { path } => path,
            Location::Ftp { path, .. } => path,
            Location::Agent { path, .. } => path,
        }
    }

    /// Rebuild the full location string for a different path on the same
    /// backend (used when persisting a snapshot's `root`).
    pub fn with_path(&self, path: &str) -> String {
        match self {
            Location::Local { .. } => path.to_string(),
            Location::Ftp { host, port, .. } => format!("ftp://{host}:{port}{path}"),
            Location::Agent { host, port, .. } => format!("air://{host}:{port}{path}"),
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.with_path(self.path()))
    }
}

/// Split `host:port/path...` into its parts. The path keeps a leading `/`.
fn split_authority(raw: &str, rest: &str) -> Result<(String, u16, String)> {
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let (host, port) = authority
        .split_once(':')
        .ok_or_else(|| SyncError::Location(raw.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| SyncError::Location(raw.to_string()))?;
    if host.is_empty() {
        return Err(SyncError::Location(raw.to_string()));
    }
    Ok((host.to_string(), port, path.to_string()))
}

/// Absolutize a local path and normalize separators to `/`, the form all
/// snapshot keys and roots use regardless of platform.
pub fn absolutize(path: &str) -> Result<String> {
    let p = Path::new(path);
    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()?.join(p)
    };
    Ok(normalize_slashes(&abs.to_string_lossy()))
}

pub fn normalize_slashes(path: &str) -> String {
    let s = path.replace('\\', "/");
    match s.strip_suffix('/') {
        Some(stripped) if !stripped.is_empty() && !stripped.ends_with(':') => {
            stripped.to_string()
        }
        _ => s,
    }
}

/// Parent directory of a `/`-separated path string.
pub fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => "",
    }
}

/// Final component of a `/`-separated path string.
pub fn basename_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
