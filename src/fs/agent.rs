//! Remote filesystem agent backend.
//!
//! The agent exposes the same capability contract as the local backend
//! over an opaque RPC channel: newline-delimited JSON requests and
//! responses on a single TCP connection, with binary payloads carried as
//! base64. Every call crosses the network and can fail independently of
//! local I/O, so every failure here maps to the distinct
//! [`SyncError::Transport`] kind.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Result, SyncError};
use crate::fs::FileListing;

pub struct AgentFs {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
    peer: String,
    next_id: u64,
}

#[derive(Deserialize)]
struct AgentResponse {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

impl AgentFs {
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let peer = format!("{host}:{port}");
        let writer = TcpStream::connect((host, port))
            .map_err(|e| SyncError::Transport(format!("agent connect {peer}: {e}")))?;
        let reader = BufReader::new(
            writer
                .try_clone()
                .map_err(|e| SyncError::Transport(format!("agent {peer}: {e}")))?,
        );
        Ok(AgentFs {
            writer,
            reader,
            peer,
            next_id: 1,
        })
    }

    pub fn exists(&mut self, path: &str) -> Result<bool> {
        let v = self.call("exists", json!({ "path": path }))?;
        v.as_bool()
            .ok_or_else(|| self.protocol_error("exists", &v))
    }

    pub fn load(&mut self, path: &str) -> Result<Vec<u8>> {
        let v = self.call("load", json!({ "path": path }))?;
        let encoded = v.as_str().ok_or_else(|| self.protocol_error("load", &v))?;
        BASE64
            .decode(encoded)
            .map_err(|e| SyncError::Transport(format!("agent {}: bad payload: {e}", self.peer)))
    }

    pub fn dump(&mut self, data: &[u8], path: &str) -> Result<()> {
        self.call(
            "dump",
            json!({ "path": path, "data": BASE64.encode(data) }),
        )?;
        Ok(())
    }

    /// Enumeration happens agent-side in one round trip; the per-directory
    /// reuse optimization is not worth shipping the prior listing across
    /// the wire.
    pub fn enumerate(&mut self, root: &str) -> Result<FileListing> {
        let v = self.call("enumerate", json!({ "root": root }))?;
        let map = v
            .as_object()
            .ok_or_else(|| self.protocol_error("enumerate", &v))?;
        let mut out = FileListing::new();
        for (key, val) in map {
            let mtime = val
                .as_i64()
                .ok_or_else(|| self.protocol_error("enumerate", val))?;
            out.insert(key.clone(), mtime);
        }
        Ok(out)
    }

    pub fn make_dirs(&mut self, path: &str) -> Result<()> {
        self.call("make_dirs", json!({ "path": path }))?;
        Ok(())
    }

    pub fn remove_file(&mut self, path: &str) -> Result<()> {
        self.call("remove_file", json!({ "path": path }))?;
        Ok(())
    }

    pub fn remove_dir(&mut self, path: &str) -> Result<()> {
        self.call("remove_dir", json!({ "path": path }))?;
        Ok(())
    }

    pub fn move_file(&mut self, from: &str, to: &str) -> Result<()> {
        self.call("move_file", json!({ "from": from, "to": to }))?;
        Ok(())
    }

    pub fn set_mtime(&mut self, path: &str, mtime: i64) -> Result<()> {
        self.call("set_mtime", json!({ "path": path, "mtime": mtime }))?;
        Ok(())
    }

    // ------------------------------------------------------------------

    fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;

        let request = json!({ "id": id, "method": method, "params": params });
        let mut line = serde_json::to_vec(&request)
            .map_err(|e| SyncError::Transport(format!("agent {}: encode: {e}", self.peer)))?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .and_then(|_| self.writer.flush())
            .map_err(|e| SyncError::Transport(format!("agent {}: send {method}: {e}", self.peer)))?;

        let mut buf = String::new();
        let n = self
            .reader
            .read_line(&mut buf)
            .map_err(|e| SyncError::Transport(format!("agent {}: recv {method}: {e}", self.peer)))?;
        if n == 0 {
            return Err(SyncError::Transport(format!(
                "agent {}: connection closed during {method}",
                self.peer
            )));
        }

        let response: AgentResponse = serde_json::from_str(&buf)
            .map_err(|e| SyncError::Transport(format!("agent {}: decode: {e}", self.peer)))?;
        if response.id != id {
            return Err(SyncError::Transport(format!(
                "agent {}: response id {} does not match request {id}",
                self.peer, response.id
            )));
        }
        if let Some(message) = response.error {
            return Err(SyncError::Transport(format!(
                "agent {}: {method}: {message}",
                self.peer
            )));
        }
        response.result.ok_or_else(|| {
            SyncError::Transport(format!("agent {}: {method}: empty response", self.peer))
        })
    }

    fn protocol_error(&self, method: &str, got: &Value) -> SyncError {
        SyncError::Transport(format!(
            "agent {}: {method}: unexpected response shape: {got}",
            self.peer
        ))
    }
}
