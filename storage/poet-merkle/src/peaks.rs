// Copyright © Poet Contributors
// SPDX-License-Identifier: Apache-2.0

//! Peak decomposition for an append-only binary accumulator.
//!
//! Both the membership tree and the proof tree are built leaf-by-leaf
//! without knowing the final leaf count in advance. Rather than padding to
//! a power of two, a partially-filled tree is represented as a sequence of
//! complete (perfect) binary subtrees — "peaks" — one per set bit of
//! `num_leaves`, ordered left to right from the largest to the smallest.
//! This is the same accumulator shape `storage/accumulator` in the teacher
//! repo uses for its append-only ledger history; see `DESIGN.md`.
//!
//! A peak's root is never recomputed once its subtree is full, so the
//! "parked nodes" the round engine persists are exactly these peak roots:
//! the frontier of subtrees still waiting for a sibling to complete them.

use poet_hash::{node_hash, Statement, HASH_LEN};

/// A single complete subtree covering `2^height` consecutive leaves
/// starting at `offset`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Peak {
    pub offset: u64,
    pub height: u32,
}

impl Peak {
    pub fn size(&self) -> u64 {
        1u64 << self.height
    }
}

/// Decomposes `num_leaves` into its peaks, left to right, largest first.
/// This is exactly the set bits of `num_leaves` read from the most to the
/// least significant.
pub fn peaks_for(num_leaves: u64) -> Vec<Peak> {
    let mut peaks = Vec::with_capacity(num_leaves.count_ones() as usize);
    let mut offset = 0u64;
    for bit in (0..64).rev() {
        if (num_leaves >> bit) & 1 == 1 {
            peaks.push(Peak { offset, height: bit });
            offset += 1u64 << bit;
        }
    }
    peaks
}

/// Locates which peak a leaf belongs to, and its index local to that
/// peak's subtree.
pub fn locate_leaf(peaks: &[Peak], leaf_index: u64) -> (usize, u64) {
    for (i, peak) in peaks.iter().enumerate() {
        if leaf_index >= peak.offset && leaf_index < peak.offset + peak.size() {
            return (i, leaf_index - peak.offset);
        }
    }
    panic!("leaf_index {leaf_index} out of range for {} peaks", peaks.len());
}

/// How many of layer `level`'s entries belong to peaks before `peak_index`.
/// Only peaks tall enough to reach `level` contribute; a peak of height
/// `h` owns `2^(h - level)` of layer `level`'s entries.
pub fn earlier_contribution_at_level(peaks: &[Peak], peak_index: usize, level: u32) -> u64 {
    peaks[..peak_index]
        .iter()
        .filter(|p| p.height >= level)
        .map(|p| 1u64 << (p.height - level))
        .sum()
}

/// The global index, within layer `peak.height`, of `peak`'s own root.
pub fn peak_root_global_index(peaks: &[Peak], peak_index: usize) -> u64 {
    earlier_contribution_at_level(peaks, peak_index, peaks[peak_index].height)
}

/// One step of a leaf's bottom-up authentication path within its own peak.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Side {
    Left,
    Right,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProofStep {
    pub layer: u32,
    pub global_index: u64,
    /// The side the *sibling* sits on, relative to the node being proved.
    pub sibling_side: Side,
}

/// The bottom-up sibling path from a leaf up to its own peak's root.
/// Does not include the cross-peak folding step — see [`fold_peaks`].
pub fn within_peak_path(peaks: &[Peak], leaf_index: u64) -> (usize, Vec<ProofStep>) {
    let (peak_index, local) = locate_leaf(peaks, leaf_index);
    let height = peaks[peak_index].height;
    let mut steps = Vec::with_capacity(height as usize);
    let mut local_at_level = local;
    for level in 0..height {
        let sibling_local = local_at_level ^ 1;
        let sibling_side = if local_at_level % 2 == 1 { Side::Left } else { Side::Right };
        let global_index = earlier_contribution_at_level(peaks, peak_index, level) + sibling_local;
        steps.push(ProofStep { layer: level, global_index, sibling_side });
        local_at_level >>= 1;
    }
    (peak_index, steps)
}

/// Folds peak values left to right into a single root: `peaks[0]` seeds
/// the accumulator and every subsequent peak combines on the right.
/// `peak_values` must be non-empty; callers with zero leaves must use
/// [`poet_hash::empty_tree_root`] instead.
pub fn fold_peaks(statement: &Statement, peak_values: &[[u8; HASH_LEN]]) -> [u8; HASH_LEN] {
    let mut iter = peak_values.iter();
    let mut acc = *iter.next().expect("fold_peaks requires at least one peak");
    for value in iter {
        acc = node_hash(statement, &acc, value);
    }
    acc
}
