// Copyright © Poet Contributors
// SPDX-License-Identifier: Apache-2.0

//! Keyed hash primitives used by the membership tree and the proof tree.
//!
//! Both hashes are keyed by a round's [`Statement`] so that labels and
//! internal nodes computed for one round's sequential-work tree can never
//! collide with another round's, even if the underlying leaf bytes match.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const HASH_LEN: usize = 32;

/// Domain separation tags. A label and an internal node are never hashed
/// under the same prefix, even though both ultimately feed a binary tree.
const LABEL_TAG: u8 = 0x00;
const NODE_TAG: u8 = 0x01;
const FIAT_SHAMIR_TAG: u8 = 0x02;
const MEMBERSHIP_LEAF_TAG: u8 = 0x03;

/// The 32-byte root of the round's membership tree. Every label and node
/// hash in the proof tree is keyed by this value.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Statement(pub [u8; HASH_LEN]);

impl Statement {
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl From<[u8; HASH_LEN]> for Statement {
    fn from(bytes: [u8; HASH_LEN]) -> Self {
        Statement(bytes)
    }
}

impl AsRef<[u8]> for Statement {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// `H_L(statement, index, dependencies)`: the label hash for leaf `index`
/// of the sequential-work tree. `dependencies` is the ordered list of
/// already-computed sibling values visible on the path to this leaf;
/// binding them in gives the tree its sequential-work property, since
/// leaf `index` cannot be computed before every dependency has been.
pub fn label_hash(statement: &Statement, index: u64, dependencies: &[[u8; HASH_LEN]]) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update([LABEL_TAG]);
    hasher.update(statement.as_ref());
    hasher.update(index.to_be_bytes());
    for dep in dependencies {
        hasher.update(dep);
    }
    let digest = hasher.finalize();
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&digest);
    out
}

/// `H_N(statement, left, right)`: the internal-node hash shared by the
/// membership tree and the proof tree.
pub fn node_hash(statement: &Statement, left: &[u8; HASH_LEN], right: &[u8; HASH_LEN]) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update([NODE_TAG]);
    hasher.update(statement.as_ref());
    hasher.update(left);
    hasher.update(right);
    let digest = hasher.finalize();
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&digest);
    out
}

/// The root of an empty membership tree: `H_N(statement, 0^32, 0^32)`.
/// Pinned here since the distilled spec leaves this choice open; see
/// `SPEC_FULL.md` section 9.
pub fn empty_tree_root(statement: &Statement) -> [u8; HASH_LEN] {
    node_hash(statement, &[0u8; HASH_LEN], &[0u8; HASH_LEN])
}

/// A generic domain-separated hash used only for Fiat-Shamir index
/// derivation (`H(root || j [|| d])` in `poet-prover`). Kept here so the
/// prover and any future verifier derive indices identically without
/// duplicating the tag convention.
pub fn fiat_shamir_hash(parts: &[&[u8]]) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update([FIAT_SHAMIR_TAG]);
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&digest);
    out
}

/// Reduces an opaque, variable-length challenge to a fixed 32-byte leaf
/// value for the membership tree. Domain-separated from `label_hash` and
/// `node_hash` so a crafted challenge can never be mistaken for an internal
/// tree node.
pub fn membership_leaf_hash(challenge: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update([MEMBERSHIP_LEAF_TAG]);
    hasher.update(challenge);
    let digest = hasher.finalize();
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&digest);
    out
}
