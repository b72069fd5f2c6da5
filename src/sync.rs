//! Background anti-entropy: every five seconds, compare Merkle summaries
//! with the peer and pull whatever differs.
//!
//! The cycle is initiator-pull: keys that exist only on this side reach the
//! peer through foreground propagation, the full-state fallback, or the
//! peer's own cycle. Any transport or parse failure aborts the Merkle path
//! and falls back to one full-state exchange before the next sleep.

use crate::merkle::Hash;
use crate::node::Node;
use crate::proto::{self, parse_key_timestamps, parse_paths, propagate_set_command};
use crate::types::now_millis;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

pub const SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// The reconciliation engine for one node and its configured peer.
pub struct AntiEntropy {
    node: Arc<Node>,
    peer_addr: String,
}

impl AntiEntropy {
    pub fn new(node: Arc<Node>, peer_addr: impl Into<String>) -> Self {
        Self {
            node,
            peer_addr: peer_addr.into(),
        }
    }

    /// Spawns the periodic sync loop. A failed cycle is logged and the loop
    /// continues; nothing escapes the task.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(SYNC_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(err) = self.run_cycle().await {
                    warn!(peer = %self.peer_addr, "anti-entropy cycle failed: {err:#}");
                }
            }
        })
    }

    /// One reconciliation cycle. Public so tests (and embedders) can drive
    /// cycles without waiting out the ticker.
    #[tracing::instrument(skip(self), fields(peer = %self.peer_addr))]
    pub async fn run_cycle(&self) -> Result<()> {
        if self.node.index().is_empty() {
            debug!("local index empty; running full state exchange");
            return self.full_state_exchange().await;
        }
        match self.merkle_sync().await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("merkle sync failed, falling back to full exchange: {err:#}");
                self.full_state_exchange().await
            }
        }
    }

    async fn merkle_sync(&self) -> Result<()> {
        let local_root = self.node.index().root();

        let peer_root = self.request("GET_MERKLE_ROOT", proto::MAX_REPLY).await?;
        if peer_root == proto::EMPTY_ROOT || peer_root == Hash::ZERO.to_hex() {
            debug!("peer index empty; running full state exchange");
            return self.full_state_exchange().await;
        }
        if peer_root == local_root.to_hex() {
            debug!("merkle roots match; nothing to sync");
            return Ok(());
        }

        // Narrow down the divergence: fetch the peer's key list, then its
        // authentication paths, and verify each path against the local root.
        let reply = self.request("GET_ALL", proto::MAX_GET_ALL_REPLY).await?;
        let peer_entries = parse_key_timestamps(&reply).context("bad GET_ALL reply")?;
        if peer_entries.is_empty() {
            debug!("peer reported no keys despite a non-empty root");
            return Ok(());
        }

        let keys: Vec<&str> = peer_entries.iter().map(|(key, _)| key.as_str()).collect();
        let command = format!("GET_PATHS {}", keys.join(";"));
        let reply = self.request(&command, proto::MAX_PATHS_REPLY).await?;
        let remote_paths = parse_paths(&reply).context("bad GET_PATHS reply")?;

        let differing = self.node.index().find_differences(&remote_paths);
        for key in &differing {
            self.pull_key(key, now_millis()).await?;
        }
        info!("merkle sync pulled {} differing keys", differing.len());
        Ok(())
    }

    /// Classical N-key reconciliation, used when either summary is missing
    /// or the Merkle path failed: pull everything locally missing or older,
    /// push everything locally newer or absent on the peer.
    async fn full_state_exchange(&self) -> Result<()> {
        let reply = self.request("GET_ALL", proto::MAX_GET_ALL_REPLY).await?;
        let peer_entries = parse_key_timestamps(&reply).context("bad GET_ALL reply")?;
        let peer: HashMap<_, _> = peer_entries.into_iter().collect();
        let local = self.node.store().key_timestamps();
        if peer.is_empty() && local.is_empty() {
            return Ok(());
        }

        let mut pulled = 0usize;
        for (key, peer_ts) in &peer {
            let stale = match local.get(key) {
                Some(local_ts) => peer_ts > local_ts,
                None => true,
            };
            if stale {
                self.pull_key(key, now_millis()).await?;
                pulled += 1;
            }
        }

        let mut pushed = 0usize;
        for (key, local_ts) in &local {
            let ahead = match peer.get(key) {
                Some(peer_ts) => local_ts > peer_ts,
                None => true,
            };
            if ahead {
                let (value, timestamp) = self.node.store().get_with_ts(key);
                if timestamp == 0 {
                    continue; // deleted since the map was taken
                }
                self.send(&propagate_set_command(key, &value, timestamp))
                    .await?;
                pushed += 1;
            }
        }

        info!(pulled, pushed, "full state exchange complete");
        Ok(())
    }

    /// Fetches one key's value from the peer and applies it locally with the
    /// supplied timestamp. The peer is presumed authoritative for the key;
    /// if it later gets an even newer value the next cycle re-converges.
    /// Applied unconditionally: an empty reply is a legal value, not absence.
    async fn pull_key(&self, key: &str, timestamp: u64) -> Result<()> {
        let value = self
            .request(&format!("GET {key}"), proto::MAX_REPLY)
            .await?;
        self.node.store().set(key, &value, timestamp);
        debug!(key, value, "pulled key from peer");
        Ok(())
    }

    /// One request/reply round trip on a fresh connection, reading the reply
    /// to EOF bounded by `limit`.
    async fn request(&self, command: &str, limit: usize) -> Result<String> {
        let mut stream = self.connect().await?;
        stream
            .write_all(command.as_bytes())
            .await
            .context("failed to write request to peer")?;
        stream
            .shutdown()
            .await
            .context("failed to flush request to peer")?;

        let mut reply = Vec::new();
        let mut bounded = stream.take(limit as u64);
        bounded
            .read_to_end(&mut reply)
            .await
            .context("failed to read reply from peer")?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    /// Fire-and-forget send; no reply is read.
    async fn send(&self, command: &str) -> Result<()> {
        let mut stream = self.connect().await?;
        stream
            .write_all(command.as_bytes())
            .await
            .context("failed to write to peer")?;
        stream.shutdown().await.context("failed to flush to peer")?;
        Ok(())
    }

    async fn connect(&self) -> Result<TcpStream> {
        TcpStream::connect(&self.peer_addr)
            .await
            .with_context(|| format!("failed to connect to peer {}", self.peer_addr))
    }
}
