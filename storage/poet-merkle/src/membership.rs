// Copyright © Poet Contributors
// SPDX-License-Identifier: Apache-2.0

//! Streaming membership-tree builder.
//!
//! Mirrors `original_source/service/round.go::calcMembersAndStatement`'s use
//! of `merkle.NewTreeBuilder()`: challenges are streamed in, one per leaf,
//! in the challenge store's iteration order, and folded into a single root
//! without ever materializing a full tree. This builder is transient — it
//! lives only for the duration of one `calc_members_and_statement` call and
//! never touches disk, unlike the proof tree in [`crate::tree`].

use poet_hash::{empty_tree_root, membership_leaf_hash, node_hash, Statement, HASH_LEN};

use crate::peaks::fold_peaks;

/// The membership tree's own internal hashing cannot be keyed by the
/// round's real `Statement`, since that value does not exist until the
/// tree finishes (the `Statement` *is* the tree's root). Every `H_N` call
/// this builder makes is keyed by this fixed seed instead; the real
/// `Statement` only comes into play afterwards, keying the proof tree and
/// the prover ([`crate::tree`]).
pub const MEMBERSHIP_TREE_SEED: Statement = Statement([0u8; HASH_LEN]);

/// Streaming binary Merkle builder over opaque challenge bytes.
///
/// Internally this is a binary counter: `pending[l]` holds the completed
/// node at layer `l` that is still waiting for a sibling, and is `Some`
/// exactly when bit `l` of the current leaf count is set. Adding a leaf is
/// the familiar carry-ripple of incrementing that counter by one.
#[derive(Default)]
pub struct MembershipTreeBuilder {
    members: Vec<Vec<u8>>,
    pending: Vec<Option<[u8; HASH_LEN]>>,
}

impl MembershipTreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one challenge as the next leaf, in store-iteration order.
    /// `challenge` becomes `Members`' next entry verbatim.
    pub fn add_leaf(&mut self, challenge: Vec<u8>) {
        let mut carry = membership_leaf_hash(&challenge);
        let mut level = 0usize;
        loop {
            if level == self.pending.len() {
                self.pending.push(None);
            }
            match self.pending[level].take() {
                Some(left) => {
                    carry = node_hash(&MEMBERSHIP_TREE_SEED, &left, &carry);
                    level += 1;
                }
                None => {
                    self.pending[level] = Some(carry);
                    break;
                }
            }
        }
        self.members.push(challenge);
    }

    /// Consumes the builder, returning the frozen `Members` list (in
    /// insertion order) and the round's `Statement`. An empty tree's root
    /// is the pinned `H_N(seed, 0^32, 0^32)` value, documented in
    /// `SPEC_FULL.md` section 9.
    pub fn finish(self) -> (Vec<Vec<u8>>, Statement) {
        if self.members.is_empty() {
            return (self.members, Statement(empty_tree_root(&MEMBERSHIP_TREE_SEED)));
        }
        // Peaks bag from the tallest (leftmost, earliest leaves) down to
        // the shortest (rightmost, most recent leaves), matching
        // `peaks::fold_peaks`'s ordering convention.
        let peak_values: Vec<[u8; HASH_LEN]> = self.pending.into_iter().rev().flatten().collect();
        let root = fold_peaks(&MEMBERSHIP_TREE_SEED, &peak_values);
        (self.members, Statement(root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tree_root_is_pinned_value() {
        let builder = MembershipTreeBuilder::new();
        let (members, statement) = builder.finish();
        assert!(members.is_empty());
        assert_eq!(statement.0, empty_tree_root(&MEMBERSHIP_TREE_SEED));
    }

    #[test]
    fn single_leaf_statement_is_its_own_hash() {
        let mut builder = MembershipTreeBuilder::new();
        builder.add_leaf(b"c1".to_vec());
        let (members, statement) = builder.finish();
        assert_eq!(members, vec![b"c1".to_vec()]);
        let expected = membership_leaf_hash(b"c1");
        assert_eq!(statement.0, expected);
    }

    #[test]
    fn members_preserve_insertion_order() {
        let mut builder = MembershipTreeBuilder::new();
        for c in [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()] {
            builder.add_leaf(c);
        }
        let (members, _) = builder.finish();
        assert_eq!(members, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn statement_is_order_sensitive() {
        let mut a = MembershipTreeBuilder::new();
        a.add_leaf(b"x".to_vec());
        a.add_leaf(b"y".to_vec());
        let (_, statement_a) = a.finish();

        let mut b = MembershipTreeBuilder::new();
        b.add_leaf(b"y".to_vec());
        b.add_leaf(b"x".to_vec());
        let (_, statement_b) = b.finish();

        assert_ne!(statement_a.0, statement_b.0);
    }

    #[test]
    fn four_leaf_statement_matches_manual_pairing() {
        let mut builder = MembershipTreeBuilder::new();
        for c in [b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()] {
            builder.add_leaf(c);
        }
        let (_, statement) = builder.finish();

        let la = membership_leaf_hash(b"a");
        let lb = membership_leaf_hash(b"b");
        let lc = membership_leaf_hash(b"c");
        let ld = membership_leaf_hash(b"d");
        let left = node_hash(&MEMBERSHIP_TREE_SEED, &la, &lb);
        let right = node_hash(&MEMBERSHIP_TREE_SEED, &lc, &ld);
        let expected = node_hash(&MEMBERSHIP_TREE_SEED, &left, &right);
        assert_eq!(statement.0, expected);
    }
}
