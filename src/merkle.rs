//! Merkle summary of the store: leaf hashing, the append-ordered tree,
//! authentication paths, and the key-to-leaf index used by anti-entropy.
//!
//! Both peers must agree byte-for-byte on every hash here, otherwise identical
//! stores would report different roots and the sync cycle would never settle.

use crate::types::{SnapshotEntry, Timestamp};
use anyhow::{bail, Result};
use sha2::compress256;
use sha2::digest::generic_array::{typenum::U64, GenericArray};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

pub const HASH_SIZE: usize = 32;

/// SHA-256 initial state; the compression primitive is applied to a single
/// 64-byte block with no length padding.
const SHA256_IV: [u32; 8] = [
    0x6a09_e667,
    0xbb67_ae85,
    0x3c6e_f372,
    0xa54f_f53a,
    0x510e_527f,
    0x9b05_688c,
    0x1f83_d9ab,
    0x5be0_cd19,
];

/// 32-byte digest. `Hash::ZERO` doubles as the root of the empty tree.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash(pub [u8; HASH_SIZE]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; HASH_SIZE]);

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)?;
        if bytes.len() != HASH_SIZE {
            bail!("expected {} hash bytes, got {}", HASH_SIZE, bytes.len());
        }
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(&bytes);
        Ok(Hash(out))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

/// Compress two child digests into their parent with one application of the
/// raw SHA-256 compression function.
pub fn compress(left: &Hash, right: &Hash) -> Hash {
    let mut block = [0u8; 64];
    block[..HASH_SIZE].copy_from_slice(&left.0);
    block[HASH_SIZE..].copy_from_slice(&right.0);
    let block: GenericArray<u8, U64> = GenericArray::clone_from_slice(&block);

    let mut state = SHA256_IV;
    compress256(&mut state, std::slice::from_ref(&block));

    let mut out = [0u8; HASH_SIZE];
    for (chunk, word) in out.chunks_exact_mut(4).zip(state) {
        chunk.copy_from_slice(&word.to_be_bytes());
    }
    Hash(out)
}

/// Leaf digest for a (key, value, timestamp) record.
///
/// The first 32 bytes of `key:value:timestamp` (zero-padded when shorter) are
/// compressed against a zero right half. Truncation collisions are tolerated:
/// a false mismatch only costs a redundant value pull.
pub fn leaf_hash(key: &str, value: &str, timestamp: Timestamp) -> Hash {
    let combined = format!("{key}:{value}:{timestamp}");
    let bytes = combined.as_bytes();
    let mut block = [0u8; HASH_SIZE];
    let len = bytes.len().min(HASH_SIZE);
    block[..len].copy_from_slice(&bytes[..len]);
    compress(&Hash(block), &Hash::ZERO)
}

/// Which side of the running hash a path step's sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// One step of an authentication path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStep {
    pub side: Side,
    pub sibling: Hash,
}

/// Authentication path of one leaf: the leaf digest plus the sibling hashes
/// from leaf to root. Levels where the node was promoted without a partner
/// contribute no step.
///
/// Serialized form: the 32-byte leaf, then per step one side byte
/// (`0` = sibling on the left, `1` = on the right) followed by the 32-byte
/// sibling. The wire carries the lowercase hex of those bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    pub leaf: Hash,
    pub steps: Vec<PathStep>,
}

impl Path {
    /// Folds the leaf through the sibling steps and compares against `root`.
    pub fn verify(&self, root: &Hash) -> bool {
        let mut acc = self.leaf;
        for step in &self.steps {
            acc = match step.side {
                Side::Left => compress(&step.sibling, &acc),
                Side::Right => compress(&acc, &step.sibling),
            };
        }
        acc == *root
    }

    pub fn to_hex(&self) -> String {
        let mut bytes = Vec::with_capacity(HASH_SIZE + self.steps.len() * (1 + HASH_SIZE));
        bytes.extend_from_slice(&self.leaf.0);
        for step in &self.steps {
            bytes.push(match step.side {
                Side::Left => 0,
                Side::Right => 1,
            });
            bytes.extend_from_slice(&step.sibling.0);
        }
        hex::encode(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)?;
        if bytes.len() < HASH_SIZE || (bytes.len() - HASH_SIZE) % (1 + HASH_SIZE) != 0 {
            bail!("malformed path: {} bytes", bytes.len());
        }
        let mut leaf = [0u8; HASH_SIZE];
        leaf.copy_from_slice(&bytes[..HASH_SIZE]);

        let mut steps = Vec::new();
        for chunk in bytes[HASH_SIZE..].chunks_exact(1 + HASH_SIZE) {
            let side = match chunk[0] {
                0 => Side::Left,
                1 => Side::Right,
                other => bail!("malformed path: side byte {other}"),
            };
            let mut sibling = [0u8; HASH_SIZE];
            sibling.copy_from_slice(&chunk[1..]);
            steps.push(PathStep {
                side,
                sibling: Hash(sibling),
            });
        }
        Ok(Path {
            leaf: Hash(leaf),
            steps,
        })
    }
}

/// Binary Merkle tree over the leaf sequence in insertion order.
///
/// Levels are built by pairing adjacent nodes; an odd node at the end of a
/// level is promoted unchanged to the next level.
#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
    leaves: Vec<Hash>,
}

impl MerkleTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, leaf: Hash) {
        self.leaves.push(leaf);
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Root digest; `Hash::ZERO` for the empty tree.
    pub fn root(&self) -> Hash {
        if self.leaves.is_empty() {
            return Hash::ZERO;
        }
        let mut level = self.leaves.clone();
        while level.len() > 1 {
            level = fold_level(&level);
        }
        level[0]
    }

    /// Authentication path for the leaf at `index`, or `None` out of range.
    pub fn path(&self, index: usize) -> Option<Path> {
        if index >= self.leaves.len() {
            return None;
        }
        let mut steps = Vec::new();
        let mut level = self.leaves.clone();
        let mut pos = index;
        while level.len() > 1 {
            if pos % 2 == 0 {
                if pos + 1 < level.len() {
                    steps.push(PathStep {
                        side: Side::Right,
                        sibling: level[pos + 1],
                    });
                }
                // else: unpaired node, promoted as-is
            } else {
                steps.push(PathStep {
                    side: Side::Left,
                    sibling: level[pos - 1],
                });
            }
            pos /= 2;
            level = fold_level(&level);
        }
        Some(Path {
            leaf: self.leaves[index],
            steps,
        })
    }
}

fn fold_level(level: &[Hash]) -> Vec<Hash> {
    let mut next = Vec::with_capacity(level.len().div_ceil(2));
    let mut i = 0;
    while i < level.len() {
        if i + 1 < level.len() {
            next.push(compress(&level[i], &level[i + 1]));
        } else {
            next.push(level[i]);
        }
        i += 2;
    }
    next
}

struct IndexState {
    tree: MerkleTree,
    positions: HashMap<String, usize>,
}

/// Merkle tree plus the key-to-leaf-position map, rebuilt together from a
/// store snapshot. Readers and the rebuild path serialize on the index's own
/// lock; the index never calls back into the store.
pub struct MerkleIndex {
    state: Mutex<IndexState>,
}

impl Default for MerkleIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl MerkleIndex {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IndexState {
                tree: MerkleTree::new(),
                positions: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().expect("Failed to lock merkle index")
    }

    /// Discards the tree and rebuilds one leaf per snapshot entry, assigning
    /// sequential positions in snapshot order.
    pub fn rebuild(&self, snapshot: &[SnapshotEntry]) {
        let mut state = self.lock();
        state.tree = MerkleTree::new();
        state.positions.clear();
        for (pos, (key, value, timestamp)) in snapshot.iter().enumerate() {
            state.tree.insert(leaf_hash(key, value, *timestamp));
            state.positions.insert(key.clone(), pos);
        }
        debug!("rebuilt merkle index with {} leaves", state.tree.len());
    }

    pub fn root(&self) -> Hash {
        self.lock().tree.root()
    }

    /// Authentication paths for `keys`, in input order, paired with their
    /// keys. Keys unknown to the index are omitted.
    pub fn paths(&self, keys: &[String]) -> Vec<(String, Path)> {
        let state = self.lock();
        keys.iter()
            .filter_map(|key| {
                let pos = *state.positions.get(key)?;
                let path = state.tree.path(pos)?;
                Some((key.clone(), path))
            })
            .collect()
    }

    /// Keys whose remote-supplied path fails to reconstruct the local root.
    ///
    /// A failing path means the peer's leaf for that key differs from ours
    /// (or we don't hold the key at all). When the local tree is empty every
    /// queried key differs.
    pub fn find_differences(&self, remote: &[(String, Path)]) -> Vec<String> {
        let state = self.lock();
        if state.tree.is_empty() {
            return remote.iter().map(|(key, _)| key.clone()).collect();
        }
        let root = state.tree.root();
        remote
            .iter()
            .filter(|(_, path)| !path.verify(&root))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().tree.is_empty()
    }
}
