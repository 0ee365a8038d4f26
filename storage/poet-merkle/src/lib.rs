// Copyright © Poet Contributors
// SPDX-License-Identifier: Apache-2.0

//! Membership tree builder and sequential-work proof tree.
//!
//! This crate owns two distinct Merkle structures that share only their
//! node-hashing primitive (`poet_hash::node_hash`):
//!
//! - [`membership`]: a transient, all-in-memory builder that folds submitted
//!   challenges into the round's `Statement` and its frozen `Members` list.
//! - [`cache`] + [`tree`]: the disk/memory-hybrid proof tree the prover
//!   grows leaf by leaf up to a wall-clock deadline, with periodic
//!   checkpointing and crash recovery.

pub mod cache;
pub mod membership;
pub mod peaks;
pub mod tree;

pub use membership::MembershipTreeBuilder;
pub use tree::ProofTree;
