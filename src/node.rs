//! TCP session front-end and foreground replication.
//!
//! The node owns the store and the Merkle index. Every accepted connection is
//! a one-shot session: read one request, dispatch, write the reply, close.
//! Locally accepted writes are additionally pushed to the configured peer on
//! a detached task with exponential backoff; a push that exhausts its retries
//! is dropped and left for anti-entropy to repair.

use crate::merkle::MerkleIndex;
use crate::proto::{
    self, parse_request, propagate_del_command, propagate_set_command, render_key_timestamps,
    render_paths, Request,
};
use crate::store::KvStore;
use crate::types::now_millis;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

const PROPAGATE_ATTEMPTS: u32 = 5;
const PROPAGATE_INITIAL_DELAY: Duration = Duration::from_millis(100);

/// One replica: store, Merkle index, and the (at most one) configured peer.
pub struct Node {
    store: Arc<KvStore>,
    index: Arc<MerkleIndex>,
    peer_addr: Option<String>,
}

impl Node {
    /// Creates a node with a fresh store and an attached, empty index.
    /// `peer_addr` is the peer to replicate to, e.g. `"127.0.0.1:7001"`;
    /// `None` disables propagation.
    pub fn new(peer_addr: Option<String>) -> Arc<Self> {
        let store = Arc::new(KvStore::new());
        let index = Arc::new(MerkleIndex::new());
        store.attach_index(index.clone());
        Arc::new(Self {
            store,
            index,
            peer_addr,
        })
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<MerkleIndex> {
        &self.index
    }

    pub fn peer_addr(&self) -> Option<&str> {
        self.peer_addr.as_deref()
    }

    /// Accept loop. Each connection is served on its own task so a slow
    /// client cannot block new accepts.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .context("failed to accept connection")?;
            let node = self.clone();
            tokio::spawn(async move {
                if let Err(err) = node.handle_session(stream).await {
                    warn!(%peer, "session error: {err:#}");
                }
            });
        }
    }

    async fn handle_session(&self, mut stream: TcpStream) -> Result<()> {
        let mut buf = vec![0u8; proto::MAX_REPLY];
        let n = stream.read(&mut buf).await.context("failed to read request")?;
        let request = String::from_utf8_lossy(&buf[..n]);
        let response = self.process_command(&request);
        stream
            .write_all(response.as_bytes())
            .await
            .context("failed to write response")?;
        Ok(())
    }

    /// Dispatches one request line and returns the reply to send back.
    pub fn process_command(&self, raw: &str) -> String {
        debug!(request = raw.trim(), "processing command");
        let Some(request) = parse_request(raw) else {
            return proto::INVALID_COMMAND.to_string();
        };

        match request {
            Request::Get { key } => self.store.get(&key),
            Request::Set { key, value } => {
                let timestamp = now_millis();
                if self.store.set(&key, &value, timestamp) {
                    self.spawn_propagate(propagate_set_command(&key, &value, timestamp));
                    proto::OK.to_string()
                } else {
                    proto::ERR_STALE_SET.to_string()
                }
            }
            Request::Del { key } => {
                let timestamp = now_millis();
                let (last_value, _) = self.store.get_with_ts(&key);
                if self.store.delete(&key, timestamp) {
                    self.spawn_propagate(propagate_del_command(&key, &last_value, timestamp));
                    proto::OK.to_string()
                } else {
                    proto::ERR_STALE_DEL.to_string()
                }
            }
            Request::GetAll => render_key_timestamps(&self.store.key_timestamps()),
            // Replayed writes carry the origin's timestamp and are never
            // re-propagated. The sender does not read the reply.
            Request::PropagateSet {
                key,
                value,
                timestamp,
            } => {
                self.store.set(&key, &value, timestamp);
                proto::OK.to_string()
            }
            Request::PropagateDel { key, timestamp } => {
                self.store.delete(&key, timestamp);
                proto::OK.to_string()
            }
            Request::GetMerkleRoot => {
                if self.index.is_empty() {
                    proto::EMPTY_ROOT.to_string()
                } else {
                    self.index.root().to_hex()
                }
            }
            Request::GetPaths { keys } => render_paths(&self.index.paths(&keys)),
        }
    }

    fn spawn_propagate(&self, command: String) {
        let Some(addr) = self.peer_addr.clone() else {
            return;
        };
        tokio::spawn(async move {
            propagate_with_backoff(&addr, &command).await;
        });
    }
}

/// Pushes one command to the peer, sleeping 100/200/400/800/1600 ms before
/// the successive attempts. On exhaustion the update is dropped; the next
/// anti-entropy cycle reconciles it.
async fn propagate_with_backoff(addr: &str, command: &str) {
    for attempt in 0..PROPAGATE_ATTEMPTS {
        let delay = PROPAGATE_INITIAL_DELAY * 2u32.pow(attempt);
        tokio::time::sleep(delay).await;
        match send_command(addr, command).await {
            Ok(()) => {
                debug!(addr, command, "propagated update to peer");
                return;
            }
            Err(err) => {
                warn!(
                    addr,
                    "propagation attempt {}/{} failed: {err:#}",
                    attempt + 1,
                    PROPAGATE_ATTEMPTS
                );
            }
        }
    }
    warn!(addr, command, "dropping propagation after {PROPAGATE_ATTEMPTS} attempts");
}

async fn send_command(addr: &str, command: &str) -> Result<()> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to peer {addr}"))?;
    stream
        .write_all(command.as_bytes())
        .await
        .context("failed to write to peer")?;
    stream.shutdown().await.context("failed to flush to peer")?;
    Ok(())
}
