// Copyright © Poet Contributors
// SPDX-License-Identifier: Apache-2.0

//! The sequential-work proof tree: a binary hash tree grown one leaf at a
//! time, each leaf binding in the already-completed structure to its left.
//!
//! `ProofTree` is the in-memory "right spine" of the tree — the frontier of
//! nodes still waiting for a sibling — paired with a [`crate::cache::TreeCacheWriter`]
//! that durably records every completed node. It has no notion of a
//! deadline or of Fiat–Shamir sampling; those live in `poet-prover`, which
//! drives this type leaf by leaf.

use poet_hash::{label_hash, node_hash, Statement, HASH_LEN};

use crate::cache::{TreeCacheError, TreeCacheWriter};

/// Incremental binary-counter state for a proof tree in progress.
pub struct ProofTree {
    pending: Vec<Option<[u8; HASH_LEN]>>,
    num_leaves: u64,
}

impl ProofTree {
    /// A fresh tree with no leaves yet.
    pub fn new() -> Self {
        ProofTree { pending: Vec::new(), num_leaves: 0 }
    }

    /// Resumes a tree that had already grown to `num_leaves` leaves, with
    /// `parked_nodes` as its right-spine frontier. `parked_nodes` must be
    /// ordered ascending by layer among the layers whose bit is set in
    /// `num_leaves` — exactly what [`ProofTree::parked_nodes`] produces.
    pub fn resume(num_leaves: u64, parked_nodes: &[[u8; HASH_LEN]]) -> Result<Self, TreeCacheError> {
        let mut pending = Vec::new();
        let mut iter = parked_nodes.iter();
        for level in 0..64u32 {
            if (num_leaves >> level) & 1 == 1 {
                let value = *iter.next().ok_or(TreeCacheError::ParkedNodesMismatch)?;
                while pending.len() <= level as usize {
                    pending.push(None);
                }
                pending[level as usize] = Some(value);
            }
        }
        if iter.next().is_some() {
            return Err(TreeCacheError::ParkedNodesMismatch);
        }
        Ok(ProofTree { pending, num_leaves })
    }

    pub fn num_leaves(&self) -> u64 {
        self.num_leaves
    }

    /// Appends the next leaf (index `num_leaves`), keyed by `statement` and
    /// by the current parked nodes — the already-computed siblings on its
    /// path — giving the tree its sequential-work property: leaf `i` cannot
    /// be computed before every node it depends on has been. Cascades any
    /// newly-completed internal nodes into `cache`.
    pub fn add_next_leaf(&mut self, statement: &Statement, cache: &mut TreeCacheWriter) -> Result<(), TreeCacheError> {
        let index = self.num_leaves;
        let dependencies: Vec<[u8; HASH_LEN]> = self.pending.iter().flatten().copied().collect();
        let mut carry = label_hash(statement, index, &dependencies);
        cache.append(0, &carry)?;

        let mut level = 0usize;
        loop {
            if level == self.pending.len() {
                self.pending.push(None);
            }
            match self.pending[level].take() {
                Some(left) => {
                    carry = node_hash(statement, &left, &carry);
                    level += 1;
                    cache.append(level as u32, &carry)?;
                }
                None => {
                    self.pending[level] = Some(carry);
                    break;
                }
            }
        }
        self.num_leaves += 1;
        Ok(())
    }

    /// Snapshots the current parked nodes (the right-spine frontier)
    /// ascending by layer, reusing `buf`'s allocation — the Rust analogue
    /// of the Go original's `tree.GetParkedNodes(buf[:0])` buffer reuse.
    pub fn parked_nodes(&self, buf: &mut Vec<[u8; HASH_LEN]>) {
        buf.clear();
        buf.extend(self.pending.iter().flatten().copied());
    }
}

impl Default for ProofTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TreeCacheWriter;
    use tempfile::tempdir;

    fn statement() -> Statement {
        Statement([9u8; HASH_LEN])
    }

    #[test]
    fn resume_reproduces_fresh_run_root() {
        let dir_fresh = tempdir().unwrap();
        let mut fresh_cache = TreeCacheWriter::create(dir_fresh.path(), 0, 4096).unwrap();
        let mut fresh_tree = ProofTree::new();
        for _ in 0..6 {
            fresh_tree.add_next_leaf(&statement(), &mut fresh_cache).unwrap();
        }
        let mut fresh_parked = Vec::new();
        fresh_tree.parked_nodes(&mut fresh_parked);

        // Split: run 4 leaves, snapshot, then resume and add 2 more.
        let dir_split = tempdir().unwrap();
        let mut split_cache = TreeCacheWriter::create(dir_split.path(), 0, 4096).unwrap();
        let mut split_tree = ProofTree::new();
        for _ in 0..4 {
            split_tree.add_next_leaf(&statement(), &mut split_cache).unwrap();
        }
        let mut parked_at_4 = Vec::new();
        split_tree.parked_nodes(&mut parked_at_4);
        let num_leaves_at_4 = split_tree.num_leaves();

        let mut recovered_cache = TreeCacheWriter::open_for_recovery(dir_split.path(), 4096, num_leaves_at_4).unwrap();
        let mut recovered_tree = ProofTree::resume(num_leaves_at_4, &parked_at_4).unwrap();
        for _ in 0..2 {
            recovered_tree
                .add_next_leaf(&statement(), &mut recovered_cache)
                .unwrap();
        }
        let mut recovered_parked = Vec::new();
        recovered_tree.parked_nodes(&mut recovered_parked);

        assert_eq!(recovered_tree.num_leaves(), fresh_tree.num_leaves());
        assert_eq!(recovered_parked, fresh_parked);
    }

    #[test]
    fn resume_rejects_mismatched_parked_node_count() {
        // num_leaves = 3 (0b11) needs exactly two parked nodes.
        let err = ProofTree::resume(3, &[[0u8; HASH_LEN]]).unwrap_err();
        assert!(matches!(err, TreeCacheError::ParkedNodesMismatch));
    }

    #[test]
    fn leaf_zero_has_no_dependencies_leaf_one_depends_on_it() {
        let dir = tempdir().unwrap();
        let mut cache = TreeCacheWriter::create(dir.path(), 0, 4096).unwrap();
        let mut tree = ProofTree::new();
        tree.add_next_leaf(&statement(), &mut cache).unwrap();

        let leaf0 = label_hash(&statement(), 0, &[]);
        let mut parked = Vec::new();
        tree.parked_nodes(&mut parked);
        assert_eq!(parked, vec![leaf0]);

        tree.add_next_leaf(&statement(), &mut cache).unwrap();
        let leaf1_given_leaf0 = label_hash(&statement(), 1, &[leaf0]);
        let expected_root = node_hash(&statement(), &leaf0, &leaf1_given_leaf0);
        let mut parked_after = Vec::new();
        tree.parked_nodes(&mut parked_after);
        assert_eq!(parked_after, vec![expected_root]);
    }
}
