//! Text wire protocol shared by the session front-end and the anti-entropy
//! client, so both ends of a connection agree byte-for-byte.
//!
//! One request per TCP connection. Requests are whitespace-separated tokens;
//! keys and values therefore cannot contain whitespace, and the `;`-joined
//! list replies additionally rule out `;` in keys. Replies end when the
//! server closes the socket.

use crate::merkle::Path;
use crate::types::Timestamp;
use anyhow::{anyhow, Context, Result};

/// Request buffer and GET-style reply limit.
pub const MAX_REPLY: usize = 1024;
/// `GET_ALL` reply limit.
pub const MAX_GET_ALL_REPLY: usize = 8 * 1024;
/// `GET_PATHS` reply limit.
pub const MAX_PATHS_REPLY: usize = 16 * 1024;

pub const OK: &str = "OK";
pub const EMPTY_ROOT: &str = "EMPTY";
pub const INVALID_COMMAND: &str = "Invalid command";
pub const ERR_STALE_SET: &str = "ERROR: Outdated timestamp";
pub const ERR_STALE_DEL: &str = "ERROR: Key not found or outdated timestamp";

/// A parsed request. `PROPAGATE` variants carry the origin's timestamp;
/// plain `SET`/`DEL` are stamped by the receiving node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Get { key: String },
    Set { key: String, value: String },
    Del { key: String },
    GetAll,
    PropagateSet {
        key: String,
        value: String,
        timestamp: Timestamp,
    },
    PropagateDel { key: String, timestamp: Timestamp },
    GetMerkleRoot,
    GetPaths { keys: Vec<String> },
}

/// Parses one request line. `None` means the caller should answer with
/// [`INVALID_COMMAND`]. Trailing tokens beyond a verb's arity are ignored,
/// matching the lenient token scanning of the protocol.
pub fn parse_request(raw: &str) -> Option<Request> {
    let mut tokens = raw.split_whitespace();
    let first = tokens.next()?;
    let (propagated, verb) = if first == "PROPAGATE" {
        (true, tokens.next()?)
    } else {
        (false, first)
    };

    match (verb, propagated) {
        ("GET", false) => Some(Request::Get {
            key: tokens.next()?.to_string(),
        }),
        ("SET", false) => Some(Request::Set {
            key: tokens.next()?.to_string(),
            value: tokens.next()?.to_string(),
        }),
        ("DEL", false) => Some(Request::Del {
            key: tokens.next()?.to_string(),
        }),
        ("GET_ALL", false) => Some(Request::GetAll),
        ("GET_MERKLE_ROOT", false) => Some(Request::GetMerkleRoot),
        ("GET_PATHS", false) => {
            let keys = tokens
                .next()
                .unwrap_or("")
                .split(';')
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
            Some(Request::GetPaths { keys })
        }
        ("SET", true) => Some(Request::PropagateSet {
            key: tokens.next()?.to_string(),
            value: tokens.next()?.to_string(),
            timestamp: tokens.next()?.parse().ok()?,
        }),
        ("DEL", true) => {
            // A deleted record's last value rides along for symmetry with
            // PROPAGATE SET, but only key and timestamp matter. Tolerate the
            // value token being absent.
            let rest: Vec<&str> = tokens.collect();
            match rest.as_slice() {
                [key, _, ts] | [key, ts] => Some(Request::PropagateDel {
                    key: (*key).to_string(),
                    timestamp: ts.parse().ok()?,
                }),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Renders the `GET_ALL` reply: `k1:t1;k2:t2;...;` with a trailing
/// semicolon, empty for an empty store.
pub fn render_key_timestamps<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a String, &'a Timestamp)>,
{
    let mut out = String::new();
    for (key, timestamp) in entries {
        out.push_str(key);
        out.push(':');
        out.push_str(&timestamp.to_string());
        out.push(';');
    }
    out
}

/// Parses a `GET_ALL` reply, preserving reply order. The timestamp sits
/// after the last `:` so keys containing `:` survive.
pub fn parse_key_timestamps(raw: &str) -> Result<Vec<(String, Timestamp)>> {
    let mut entries = Vec::new();
    for part in raw.split(';').filter(|p| !p.is_empty()) {
        let (key, ts) = part
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("malformed key:timestamp entry: {part:?}"))?;
        if key.is_empty() {
            anyhow::bail!("empty key in entry: {part:?}");
        }
        let ts: Timestamp = ts
            .parse()
            .with_context(|| format!("bad timestamp in entry: {part:?}"))?;
        entries.push((key.to_string(), ts));
    }
    Ok(entries)
}

/// Renders the `GET_PATHS` reply: `k1,hex1;k2,hex2;...;`.
pub fn render_paths(pairs: &[(String, Path)]) -> String {
    let mut out = String::new();
    for (key, path) in pairs {
        out.push_str(key);
        out.push(',');
        out.push_str(&path.to_hex());
        out.push(';');
    }
    out
}

/// Parses a `GET_PATHS` reply back into (key, path) pairs.
pub fn parse_paths(raw: &str) -> Result<Vec<(String, Path)>> {
    let mut pairs = Vec::new();
    for part in raw.split(';').filter(|p| !p.is_empty()) {
        let (key, hex_path) = part
            .split_once(',')
            .ok_or_else(|| anyhow!("malformed key,path entry: {part:?}"))?;
        let path = Path::from_hex(hex_path)
            .with_context(|| format!("bad path for key {key:?}"))?;
        pairs.push((key.to_string(), path));
    }
    Ok(pairs)
}

/// `PROPAGATE SET` line for a locally accepted write.
pub fn propagate_set_command(key: &str, value: &str, timestamp: Timestamp) -> String {
    format!("PROPAGATE SET {key} {value} {timestamp}")
}

/// `PROPAGATE DEL` line for a locally accepted delete. `last_value` is the
/// value the record held before removal.
pub fn propagate_del_command(key: &str, last_value: &str, timestamp: Timestamp) -> String {
    if last_value.is_empty() {
        format!("PROPAGATE DEL {key} {timestamp}")
    } else {
        format!("PROPAGATE DEL {key} {last_value} {timestamp}")
    }
}
