//! DriftKV - an eventually consistent, two-peer, in-memory key-value store
//! with Merkle-tree anti-entropy.
//!
//! DriftKV keeps a last-write-wins key-value map on each node and repairs
//! divergence between the two peers in the background. Instead of shipping the
//! whole key space on every reconciliation, each replica summarizes its state
//! as a Merkle tree; peers compare roots and authentication paths so that the
//! bandwidth spent is proportional to the number of differing keys.
//!
//! # Key Features
//!
//! - **Last-write-wins conflict resolution**: millisecond timestamps, equal
//!   timestamps accept (idempotent replay)
//! - **Foreground propagation**: local writes are pushed to the peer with
//!   exponential backoff, independent of anti-entropy
//! - **Merkle anti-entropy**: a 5-second background cycle compares roots,
//!   narrows differences via authentication paths, and pulls only what differs
//! - **Plain TCP text protocol**: one request per connection, no framing
//! - **In-memory**: state does not survive a restart; peers re-converge
//!
//! # Quick Start
//!
//! ```rust
//! use driftkv::merkle::MerkleIndex;
//! use driftkv::store::KvStore;
//! use std::sync::Arc;
//!
//! let store = KvStore::new();
//! let index = Arc::new(MerkleIndex::new());
//! store.attach_index(index.clone());
//!
//! assert!(store.set("fruit", "apple", 1));
//! assert_eq!(store.get("fruit"), "apple");
//! assert_eq!(index.len(), 1);
//! ```
//!
//! # Architecture
//!
//! The core types you'll work with:
//! - [`store::KvStore`] - the timestamped key-value map
//! - [`merkle::MerkleIndex`] - Merkle tree plus key-to-leaf positions
//! - [`node::Node`] - TCP session front-end and foreground replication
//! - [`sync::AntiEntropy`] - the background reconciliation engine
//!
//! # Non-goals
//!
//! DriftKV intentionally does NOT provide:
//! - Strong consistency, linearizability, or transactions
//! - Persistence across restarts
//! - Authentication, authorization, or TLS
//! - More than one configured peer per node

pub mod merkle;
pub mod node;
pub mod proto;
pub mod store;
pub mod sync;
pub mod types;

pub use node::Node;
pub use store::KvStore;
