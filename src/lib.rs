//! snapsync: bidirectional directory tree synchronization.
//!
//! A snapshot file records two states of one tree: the last state both
//! peers agreed on and the latest scan. Syncing two snapshots diffs each
//! side against the shared ancestor, composes the two change lists into
//! one directional action list (with conflict detection, backup before
//! overwrite, and optional move inference), applies it, and locks both
//! snapshots to the merged result.
//!
//! Trees can live on local disk, an FTP server, or a remote filesystem
//! agent; every combination syncs the same way.

pub mod apply;
pub mod config;
pub mod diff;
pub mod error;
pub mod fs;
pub mod location;
pub mod logger;
pub mod snapshot;
pub mod sync;

pub use error::{Result, SyncError};
