//! FTP backend.
//!
//! Three server quirks shape this module:
//!
//! 1. Standard listings omit dot-prefixed entries, so hidden files and
//!    directories are discovered separately through a verbose `LIST -a`
//!    parsed with a fixed-format regex.
//! 2. `STOR` does not truncate an existing file: writing shorter content
//!    onto a longer file leaves a trailing remnant of old bytes. Every
//!    overwrite is therefore an explicit delete-then-store.
//! 3. Entry names containing `[` or `]` collide with the terminal
//!    formatting this engine uses for progress output; such directories
//!    are traversed under a scoped rename that is undone on every exit
//!    path, including failure.
//!
//! The server reports modification times in UTC. A configurable offset
//! (`SNAPSYNC_FTP_UTC_OFFSET` in hours, defaulting to the host's local
//! UTC offset) is added when reading times and subtracted when writing
//! them back through `MFMT`, so remote timestamps stay comparable to
//! local clock readings.

use std::io::Cursor;

use chrono::{DateTime, Utc};
use regex::Regex;
use suppaftp::list::File as ListEntry;
use suppaftp::types::FileType;
use suppaftp::{FtpStream, Status};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::fs::FileListing;
use crate::location::{basename_of, parent_of};

/// Characters in entry names that clash with the engine's progress
/// formatting and trip up some servers' machine listings.
const RESERVED_CHARS: [char; 2] = ['[', ']'];

pub struct FtpFs {
    stream: FtpStream,
    /// Seconds added to server-reported (UTC) times on read, subtracted
    /// again when stamping times on write.
    time_shift: i64,
    hidden_line: Regex,
}

impl FtpFs {
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let mut stream = FtpStream::connect((host, port))
            .map_err(|e| SyncError::Transport(format!("ftp connect {host}:{port}: {e}")))?;
        stream.login("anonymous", "anonymous")?;
        stream.transfer_type(FileType::Binary)?;

        // permission flag, link count, owner, group, size, date, name
        let hidden_line = Regex::new(
            r"^([-d])[rwxsStT-]{9}\s+\d+\s+\S+\s+\S+\s+\d+\s+\w+\s+\d+\s+(?:\d{1,2}:\d{2}|\d{4})\s+(.+)$",
        )
        .expect("hidden listing pattern is valid");

        Ok(FtpFs {
            stream,
            time_shift: configured_time_shift(),
            hidden_line,
        })
    }

    pub fn exists(&mut self, path: &str) -> Result<bool> {
        if path == "/" || path.is_empty() {
            return Ok(true);
        }
        let dir = parent_of(path);
        let name = basename_of(path);
        if name.starts_with('.') {
            for (hidden, _) in self.hidden_entries(dir)? {
                if hidden == name {
                    return Ok(true);
                }
            }
            Ok(false)
        } else {
            let names = match self.stream.nlst(Some(dir)) {
                Ok(names) => names,
                // Servers answer 550 for a missing directory; treat the
                // whole path as absent in that case.
                Err(suppaftp::FtpError::UnexpectedResponse(_)) => return Ok(false),
                Err(e) => return Err(e.into()),
            };
            Ok(names.iter().any(|n| basename_of(n) == name))
        }
    }

    pub fn load(&mut self, path: &str) -> Result<Vec<u8>> {
        Ok(self.stream.retr_as_buffer(path)?.into_inner())
    }

    /// Delete-then-store: see the module note on `STOR` truncation.
    pub fn dump(&mut self, data: &[u8], path: &str) -> Result<()> {
        if self.exists(path)? {
            self.stream.rm(path)?;
        }
        self.stream.put_file(path, &mut Cursor::new(data))?;
        Ok(())
    }

    pub fn enumerate(&mut self, root: &str, prior: Option<&FileListing>) -> Result<FileListing> {
        let mut out = FileListing::new();
        self.walk(root, "", prior, &mut out)?;
        Ok(out)
    }

    pub fn make_dirs(&mut self, path: &str) -> Result<()> {
        let mut built = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            built.push('/');
            built.push_str(part);
            if !self.exists(&built)? {
                self.stream.mkdir(&built)?;
            }
        }
        Ok(())
    }

    pub fn remove_file(&mut self, path: &str) -> Result<()> {
        Ok(self.stream.rm(path)?)
    }

    pub fn remove_dir(&mut self, path: &str) -> Result<()> {
        Ok(self.stream.rmdir(path)?)
    }

    pub fn move_file(&mut self, from: &str, to: &str) -> Result<()> {
        Ok(self.stream.rename(from, to)?)
    }

    /// Stamp a remote file's modification time via `MFMT`, converting
    /// back from the local-comparable reading to server UTC.
    pub fn set_mtime(&mut self, path: &str, mtime: i64) -> Result<()> {
        let utc = DateTime::<Utc>::from_timestamp(mtime - self.time_shift, 0)
            .ok_or_else(|| SyncError::Transport(format!("mtime {mtime} out of range")))?;
        let stamp = utc.format("%Y%m%d%H%M%S");
        self.stream
            .custom_command(format!("MFMT {stamp} {path}"), &[Status::File])?;
        Ok(())
    }

    // ------------------------------------------------------------------

    fn walk(
        &mut self,
        dir: &str,
        rel_prefix: &str,
        prior: Option<&FileListing>,
        out: &mut FileListing,
    ) -> Result<()> {
        let mut files: Vec<(String, i64)> = Vec::new();
        let mut dirs: Vec<(String, i64)> = Vec::new();

        for line in self.stream.list(Some(dir))? {
            let entry = match ListEntry::try_from(line.as_str()) {
                Ok(entry) => entry,
                Err(e) => {
                    log::debug!("unparsable LIST line in {dir}: {line:?} ({e})");
                    continue;
                }
            };
            let name = entry.name().to_string();
            if name == "." || name == ".." || name.starts_with('.') {
                continue; // dot entries are collected from LIST -a below
            }
            let mtime = epoch_seconds(entry.modified()) + self.time_shift;
            if entry.is_directory() {
                dirs.push((name, mtime));
            } else {
                files.push((name, mtime));
            }
        }

        for (name, is_dir) in self.hidden_entries(dir)? {
            if is_dir {
                // No machine-readable mtime for hidden directories; a zero
                // stamp just disables the reuse optimization for them.
                dirs.push((name, 0));
            } else {
                let mtime = self.modify_time(&format!("{dir}/{name}"))?;
                files.push((name, mtime));
            }
        }

        files.sort();
        dirs.sort();

        for (name, mtime) in files {
            out.insert(format!("{rel_prefix}{name}"), mtime);
        }

        for (name, mtime) in dirs {
            let key = format!("{rel_prefix}{name}/");
            if mtime != 0 {
                if let Some(prior) = prior {
                    if prior.get(&key) == Some(&mtime) {
                        for (k, v) in prior.range(key.clone()..) {
                            if !k.starts_with(&key) {
                                break;
                            }
                            out.insert(k.clone(), *v);
                        }
                        continue;
                    }
                }
            }
            out.insert(key.clone(), mtime);

            let child = format!("{dir}/{name}");
            if name.contains(RESERVED_CHARS) {
                self.with_temp_rename(&child, |fs, temp| fs.walk(temp, &key, prior, out))?;
            } else {
                self.walk(&child, &key, prior, out)?;
            }
        }

        Ok(())
    }

    /// Dot-prefixed entries of `dir` as `(name, is_dir)`, parsed from a
    /// verbose `LIST -a`.
    fn hidden_entries(&mut self, dir: &str) -> Result<Vec<(String, bool)>> {
        let lines = self.stream.list(Some(&format!("-a {dir}")))?;
        let mut out = Vec::new();
        for line in lines {
            let Some(caps) = self.hidden_line.captures(&line) else {
                log::debug!("unparsable LIST -a line in {dir}: {line:?}");
                continue;
            };
            let name = caps[2].to_string();
            if name == "." || name == ".." || !name.starts_with('.') {
                continue;
            }
            out.push((name, &caps[1] == "d"));
        }
        Ok(out)
    }

    /// Modification time of one file via `MDTM`, shifted into the
    /// local-comparable frame.
    fn modify_time(&mut self, path: &str) -> Result<i64> {
        let dt = self.stream.mdtm(path)?;
        Ok(dt.and_utc().timestamp() + self.time_shift)
    }

    /// Rename `path` to a private temporary name, run `op` against the
    /// temporary path, then rename back — on success and on failure both.
    /// An operation error wins over a restore error; a restore error on an
    /// otherwise successful operation is still reported.
    fn with_temp_rename<T>(
        &mut self,
        path: &str,
        op: impl FnOnce(&mut Self, &str) -> Result<T>,
    ) -> Result<T> {
        let temp = format!(
            "{}/.snapsync-tmp-{}",
            parent_of(path),
            Uuid::new_v4().simple()
        );
        self.stream.rename(path, &temp)?;
        let outcome = op(self, &temp);
        let restore = self.stream.rename(temp.as_str(), path);
        match (outcome, restore) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e.into()),
        }
    }
}

fn epoch_seconds(t: std::time::SystemTime) -> i64 {
    match t.duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// Offset applied to server UTC times, in seconds. Overridable through
/// `SNAPSYNC_FTP_UTC_OFFSET` (whole hours); defaults to the host's own
/// UTC offset so local and remote readings line up out of the box.
fn configured_time_shift() -> i64 {
    if let Some(hours) = std::env::var("SNAPSYNC_FTP_UTC_OFFSET")
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
    {
        return hours * 3600;
    }
    chrono::Local::now().offset().local_minus_utc() as i64
}
