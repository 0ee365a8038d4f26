// Copyright © Poet Contributors
// SPDX-License-Identifier: Apache-2.0

//! The round state machine.
//!
//! Owns one epoch's directory, durable `RoundState`, challenge store, and
//! execution state, and drives the sequential-work prover from open
//! through execution to a published proof. Directly grounded on
//! `original_source/service/round.go`'s `round` type — `submit`,
//! `execute`, `persistExecution`, `recoverExecution`, `loadState`,
//! `saveState`, and `teardown` are each a close Rust translation of the
//! like-named Go method, generalized where the distilled spec calls for
//! it (see `DESIGN.md`).

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use poet_challenge_store::{ChallengeStore, ChallengeStoreError};
use poet_hash::{Statement, HASH_LEN};
use poet_merkle::cache::{TreeCacheError, TreeCacheWriter};
use poet_merkle::tree::ProofTree;
use poet_merkle::MembershipTreeBuilder;
use poet_metrics::{RegisteredRoundMetrics, RoundMetrics};
use poet_prover::{
    generate_proof, generate_proof_recovery, CancellationToken, MerkleProof, ProverError, RecoveryTreeConfig,
    TreeConfig,
};

const STATE_FILE_NAME: &str = "state.bin";
const CHALLENGES_DIR_NAME: &str = "challenges";

/// A completed NIP, ready to hand to the (out-of-scope) proofs archive.
#[derive(Clone, Debug)]
pub struct ExecutedProof {
    pub epoch: u32,
    pub statement: Statement,
    pub members: Vec<Vec<u8>>,
    pub nip: MerkleProof,
    pub num_leaves: u64,
}

/// Semantic error taxonomy for the round engine (`SPEC_FULL.md` §4.8, §7).
#[derive(Debug, Error)]
pub enum RoundError {
    #[error("round is not open")]
    RoundIsNotOpen,
    #[error("maximum number of round members reached")]
    MaxMembersReached,
    #[error("challenge already submitted for key {}", hex(key))]
    ChallengeAlreadySubmitted { key: Vec<u8> },
    #[error("security param config mismatch: configured {configured}, persisted {persisted}")]
    SecurityParamConfigMismatch { configured: u8, persisted: u8 },
    #[error("round state is corrupt: {0}")]
    StateCorrupt(String),
    #[error("round state not found at {0}")]
    StateNotFound(PathBuf),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("challenge store error: {0}")]
    ChallengeStore(#[from] ChallengeStoreError),
    #[error("tree cache error: {0}")]
    Cache(#[from] TreeCacheError),
    #[error("proof generation failed: {0}")]
    ProofGeneration(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("round was cancelled")]
    Cancelled,
    #[error("failed to publish completed proof: the archive receiver is gone")]
    PublishFailed,
}

impl RoundError {
    fn io(path: PathBuf, source: std::io::Error) -> Self {
        RoundError::Io { path, source }
    }
}

impl From<ProverError> for RoundError {
    fn from(err: ProverError) -> Self {
        match err {
            ProverError::Cancelled => RoundError::Cancelled,
            other => RoundError::ProofGeneration(Box::new(other)),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Monotonic wall-clock instant as nanoseconds since the Unix epoch,
/// serializable unlike `std::time::SystemTime`. Zero is the distinguished
/// "not started" value the distilled spec's `ExecutionStarted == zero`
/// invariant refers to, mirroring `time.Time{}`'s Go zero value.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
struct Timestamp(u64);

impl Timestamp {
    fn now() -> Self {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("system clock is after the Unix epoch")
            .as_nanos();
        Timestamp(nanos as u64)
    }

    fn zero() -> Self {
        Timestamp(0)
    }

    fn is_zero(self) -> bool {
        self.0 == 0
    }
}

/// The mutable execution state a running round journals on every advance.
/// Mirrors `original_source/service/round.go`'s `executionState`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ExecutionState {
    security_param: u8,
    members: Option<Vec<Vec<u8>>>,
    statement: Option<[u8; HASH_LEN]>,
    parked_nodes: Vec<[u8; HASH_LEN]>,
    num_leaves: u64,
    nip: Option<MerkleProof>,
}

/// On-disk encoding of a round's durable state, written atomically to
/// `<datadir>/<epoch>/state.bin`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct RoundState {
    execution_started: Timestamp,
    execution: ExecutionState,
    members: u64,
}

/// The in-memory mirror of `RoundState`'s mutable parts, behind a single
/// mutex. `members` lives outside this lock as an `Arc<AtomicU64>` so
/// `members_count`/the metrics collector can read it without contending
/// with the executor (sound only because submissions are externally
/// serialized per round — see `SPEC_FULL.md` §5).
struct RoundCore {
    execution_started: Timestamp,
    execution: ExecutionState,
}

/// A single epoch's round: durable challenge intake, Merkle membership
/// commitment, and the sequential-work prover, from open through a
/// published proof.
pub struct Round {
    epoch: u32,
    id: String,
    datadir: PathBuf,
    challenges: ChallengeStore,
    members: Arc<AtomicU64>,
    max_members: u64,
    core: Mutex<RoundCore>,
    metrics: Mutex<Option<RegisteredRoundMetrics>>,
    proof_sender: crossbeam_channel::Sender<ExecutedProof>,
}

impl Round {
    /// Creates a round's data directory and opens its challenge store.
    /// On failure to open the store, the partial directory is removed,
    /// mirroring `newRound`'s `os.RemoveAll(datadir)` on a `leveldb.OpenFile`
    /// error.
    pub fn new(
        datadir: &Path,
        epoch: u32,
        max_members: u64,
        security_param: u8,
        metrics_registry: &prometheus::Registry,
        proof_sender: crossbeam_channel::Sender<ExecutedProof>,
    ) -> Result<Round, RoundError> {
        let id = epoch.to_string();
        let round_dir = datadir.join(&id);
        fs::create_dir_all(&round_dir).map_err(|source| RoundError::io(round_dir.clone(), source))?;

        let challenges = match ChallengeStore::open(&round_dir.join(CHALLENGES_DIR_NAME)) {
            Ok(store) => store,
            Err(err) => {
                let _ = fs::remove_dir_all(&round_dir);
                return Err(RoundError::ChallengeStore(err));
            }
        };

        let members = Arc::new(AtomicU64::new(0));
        let metrics = RoundMetrics::new(epoch, members.clone()).register(metrics_registry);

        Ok(Round {
            epoch,
            id,
            datadir: round_dir,
            challenges,
            members,
            max_members,
            core: Mutex::new(RoundCore {
                execution_started: Timestamp::zero(),
                execution: ExecutionState { security_param, ..Default::default() },
            }),
            metrics: Mutex::new(metrics),
            proof_sender,
        })
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn members_count(&self) -> u64 {
        self.members.load(Ordering::Relaxed)
    }

    /// Accepts one challenge. Preconditions are checked in this exact
    /// order, matching `original_source/service/round.go::submit`: the
    /// round must be open, the per-round cap must not be reached, and the
    /// key must not already have a challenge on file. Callers must
    /// serialize concurrent `submit` calls for the same round themselves
    /// (`SPEC_FULL.md` §5) — this method takes `&self`, not `&mut self`.
    pub fn submit(&self, key: &[u8], challenge: &[u8]) -> Result<(), RoundError> {
        if !self.core.lock().execution_started.is_zero() {
            return Err(RoundError::RoundIsNotOpen);
        }
        if self.members.load(Ordering::Relaxed) >= self.max_members {
            return Err(RoundError::MaxMembersReached);
        }
        if self.challenges.has(key)? {
            return Err(RoundError::ChallengeAlreadySubmitted { key: key.to_vec() });
        }
        self.challenges.put(key, challenge)?;
        self.members.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Transitions Open -> Executing -> Executed: marks execution started,
    /// computes and freezes `Members`/`Statement`, runs the prover to
    /// `deadline`, and publishes the resulting NIP. On `Cancelled`, state
    /// is left at the last successful `persist_execution` checkpoint for a
    /// later `recover`.
    pub fn execute(
        &self,
        cancel: CancellationToken,
        deadline: SystemTime,
        min_memory_layer: u32,
        file_writer_buf_size: usize,
    ) -> Result<(), RoundError> {
        self.core.lock().execution_started = Timestamp::now();
        self.save_state()?;

        let (members, statement) = self.calc_members_and_statement()?;
        {
            let mut core = self.core.lock();
            core.execution.members = Some(members.clone());
            core.execution.statement = Some(*statement.as_bytes());
        }
        tracing::info!(round = %self.id, ?deadline, members = members.len(), "executing round");
        self.save_state()?;

        let security_param = self.core.lock().execution.security_param;
        let config = TreeConfig { datadir: self.datadir.clone(), min_memory_layer, file_writer_buf_size };
        let (num_leaves, nip) = generate_proof(&cancel, config, &statement, deadline, security_param, |tree, cache, n| {
            self.persist_execution(tree, cache, n)
                .map_err(|err| Box::new(err) as Box<dyn std::error::Error + Send + Sync>)
        })?;

        {
            let mut core = self.core.lock();
            core.execution.num_leaves = num_leaves;
            core.execution.nip = Some(nip.clone());
        }
        self.save_state()?;
        tracing::info!(round = %self.id, root = %hex(&nip.root), num_leaves, "execution ended");
        self.publish()
    }

    /// Resumes an execution that had started but not finished at restart.
    /// Recomputes `Members`/`Statement` only if they were never persisted
    /// (the challenge store is the source of truth, and `submit` is closed
    /// once execution has started, so recomputation is idempotent).
    pub fn recover(
        &self,
        cancel: CancellationToken,
        deadline: SystemTime,
        file_writer_buf_size: usize,
    ) -> Result<(), RoundError> {
        let (members_set, statement_opt, num_leaves, parked_nodes, security_param) = {
            let core = self.core.lock();
            (
                core.execution.members.is_some(),
                core.execution.statement,
                core.execution.num_leaves,
                core.execution.parked_nodes.clone(),
                core.execution.security_param,
            )
        };

        let statement = if !members_set || statement_opt.is_none() {
            tracing::debug!(round = %self.id, "calculating members and statement during recovery");
            let (members, statement) = self.calc_members_and_statement()?;
            {
                let mut core = self.core.lock();
                core.execution.members = Some(members);
                core.execution.statement = Some(*statement.as_bytes());
            }
            self.save_state()?;
            statement
        } else {
            Statement::from(statement_opt.expect("checked above"))
        };

        tracing::info!(round = %self.id, ?deadline, num_leaves, "recovering execution");
        let config = RecoveryTreeConfig { datadir: self.datadir.clone(), file_writer_buf_size };
        let (num_leaves, nip) = generate_proof_recovery(
            &cancel,
            config,
            &statement,
            deadline,
            security_param,
            num_leaves,
            &parked_nodes,
            |tree, cache, n| {
                self.persist_execution(tree, cache, n)
                    .map_err(|err| Box::new(err) as Box<dyn std::error::Error + Send + Sync>)
            },
        )?;

        {
            let mut core = self.core.lock();
            core.execution.num_leaves = num_leaves;
            core.execution.nip = Some(nip.clone());
        }
        self.save_state()?;
        tracing::info!(round = %self.id, root = %hex(&nip.root), num_leaves, "finished round recovered execution");
        self.publish()
    }

    /// The prover's periodic checkpoint callback: flushes and validates
    /// the cache, snapshots `NumLeaves`/`ParkedNodes`, and durably saves
    /// state. After this returns, `(on-disk layers, NumLeaves,
    /// ParkedNodes)` is a valid restart point.
    fn persist_execution(&self, tree: &ProofTree, cache: &mut TreeCacheWriter, num_leaves: u64) -> Result<(), RoundError> {
        tracing::debug!(round = %self.id, num_leaves, "persisting execution state");
        cache.checkpoint(num_leaves)?;
        {
            let mut core = self.core.lock();
            core.execution.num_leaves = num_leaves;
            tree.parked_nodes(&mut core.execution.parked_nodes);
        }
        self.save_state()
    }

    /// Loads persisted state from disk, rejecting a `SecurityParam`
    /// mismatch against this round's configured value before overwriting
    /// anything in memory. Takes `&mut self`: unlike `submit`/`execute`,
    /// this is only ever called by a single owner during startup
    /// recovery, before the round is shared.
    pub fn load_state(&mut self) -> Result<(), RoundError> {
        let path = self.state_path();
        if !path.exists() {
            return Err(RoundError::StateNotFound(path));
        }
        let bytes = fs::read(&path).map_err(|source| RoundError::io(path.clone(), source))?;
        let state: RoundState = bcs::from_bytes(&bytes).map_err(|err| RoundError::StateCorrupt(err.to_string()))?;

        let core = self.core.get_mut();
        if state.execution.security_param != core.execution.security_param {
            return Err(RoundError::SecurityParamConfigMismatch {
                configured: core.execution.security_param,
                persisted: state.execution.security_param,
            });
        }
        core.execution_started = state.execution_started;
        core.execution = state.execution;
        self.members.store(state.members, Ordering::Relaxed);
        Ok(())
    }

    /// Atomically rewrites `state.bin`: write a temp file in the same
    /// directory, `fsync` it, rename over the target, then `fsync` the
    /// directory. This is the only sequence under which the crash-recovery
    /// law in `SPEC_FULL.md` §8 holds.
    fn save_state(&self) -> Result<(), RoundError> {
        let state = {
            let core = self.core.lock();
            RoundState {
                execution_started: core.execution_started,
                execution: core.execution.clone(),
                members: self.members.load(Ordering::Relaxed),
            }
        };
        let bytes = bcs::to_bytes(&state).expect("RoundState is always serializable");

        let path = self.state_path();
        let mut tmp = tempfile::NamedTempFile::new_in(&self.datadir)
            .map_err(|source| RoundError::io(self.datadir.clone(), source))?;
        tmp.write_all(&bytes).map_err(|source| RoundError::io(path.clone(), source))?;
        tmp.as_file().sync_all().map_err(|source| RoundError::io(path.clone(), source))?;
        tmp.persist(&path)
            .map_err(|err| RoundError::io(path.clone(), err.error))?;

        let dir = File::open(&self.datadir).map_err(|source| RoundError::io(self.datadir.clone(), source))?;
        dir.sync_all().map_err(|source| RoundError::io(self.datadir.clone(), source))?;
        Ok(())
    }

    /// Unregisters the metrics collector, closes the challenge store, and
    /// either removes the round directory (`cleanup`) or takes a final
    /// state snapshot.
    pub fn teardown(mut self, cleanup: bool) -> Result<(), RoundError> {
        let started = std::time::Instant::now();
        tracing::info!(round = %self.id, cleanup, "tearing down round");

        if let Some(handle) = self.metrics.lock().take() {
            handle.unregister();
        }
        self.challenges.close()?;

        let result = if cleanup {
            fs::remove_dir_all(&self.datadir).map_err(|source| RoundError::io(self.datadir.clone(), source))
        } else {
            self.save_state()
        };

        tracing::info!(round = %self.id, duration = ?started.elapsed(), "finished tearing down round");
        result
    }

    fn state_path(&self) -> PathBuf {
        self.datadir.join(STATE_FILE_NAME)
    }

    /// Streams the challenge store's iterator into a membership tree,
    /// producing `Members` in store order and the round `Statement`.
    fn calc_members_and_statement(&self) -> Result<(Vec<Vec<u8>>, Statement), RoundError> {
        let mut builder = MembershipTreeBuilder::new();
        for item in self.challenges.iter()? {
            let (_key, value) = item?;
            builder.add_leaf(value.to_vec());
        }
        Ok(builder.finish())
    }

    fn publish(&self) -> Result<(), RoundError> {
        let (statement, members, nip, num_leaves) = {
            let core = self.core.lock();
            (
                Statement::from(core.execution.statement.expect("statement is set before publish")),
                core.execution.members.clone().expect("members are set before publish"),
                core.execution.nip.clone().expect("NIP is set before publish"),
                core.execution.num_leaves,
            )
        };
        self.proof_sender
            .send(ExecutedProof { epoch: self.epoch, statement, members, nip, num_leaves })
            .map_err(|_| RoundError::PublishFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poet_merkle::membership::MEMBERSHIP_TREE_SEED;
    use poet_prover::verify;
    use std::time::Duration;
    use tempfile::tempdir;

    fn new_round(dir: &Path, epoch: u32, max_members: u64, security_param: u8) -> (Round, crossbeam_channel::Receiver<ExecutedProof>) {
        let registry = prometheus::Registry::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        let round = Round::new(dir, epoch, max_members, security_param, &registry, tx).unwrap();
        (round, rx)
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let dir = tempdir().unwrap();
        let (round, _rx) = new_round(dir.path(), 1, 10, 4);
        round.submit(b"k1", b"c1").unwrap();
        let err = round.submit(b"k1", b"c2").unwrap_err();
        assert!(matches!(err, RoundError::ChallengeAlreadySubmitted { .. }));
    }

    #[test]
    fn max_members_is_enforced_in_submission_order() {
        let dir = tempdir().unwrap();
        let (round, _rx) = new_round(dir.path(), 1, 2, 4);
        round.submit(b"k1", b"c1").unwrap();
        round.submit(b"k2", b"c2").unwrap();
        let err = round.submit(b"k3", b"c3").unwrap_err();
        assert!(matches!(err, RoundError::MaxMembersReached));
        assert_eq!(round.members_count(), 2);
    }

    #[test]
    fn zero_max_members_rejects_the_first_submission() {
        let dir = tempdir().unwrap();
        let (round, _rx) = new_round(dir.path(), 1, 0, 4);
        let err = round.submit(b"k1", b"c1").unwrap_err();
        assert!(matches!(err, RoundError::MaxMembersReached));
    }

    #[test]
    fn one_max_member_allows_exactly_one_submission() {
        let dir = tempdir().unwrap();
        let (round, _rx) = new_round(dir.path(), 1, 1, 4);
        round.submit(b"k1", b"c1").unwrap();
        let err = round.submit(b"k2", b"c2").unwrap_err();
        assert!(matches!(err, RoundError::MaxMembersReached));
        assert_eq!(round.members_count(), 1);
    }

    #[test]
    fn submit_after_execution_started_is_rejected() {
        let dir = tempdir().unwrap();
        let (round, _rx) = new_round(dir.path(), 1, 10, 4);
        round.core.lock().execution_started = Timestamp::now();
        let err = round.submit(b"k1", b"c1").unwrap_err();
        assert!(matches!(err, RoundError::RoundIsNotOpen));
    }

    #[test]
    fn save_state_then_load_state_is_the_identity() {
        let dir = tempdir().unwrap();
        let (round, _rx) = new_round(dir.path(), 9, 10, 4);
        round.submit(b"k1", b"c1").unwrap();
        round.core.lock().execution_started = Timestamp::now();
        round.core.lock().execution.num_leaves = 42;
        round.save_state().unwrap();
        drop(round); // release the challenge store's lock before reopening

        let (mut reloaded, _rx2) = new_round(dir.path(), 9, 10, 4);
        reloaded.load_state().unwrap();
        assert_eq!(reloaded.members_count(), 1);
        assert_eq!(reloaded.core.lock().execution.num_leaves, 42);
        assert!(!reloaded.core.lock().execution_started.is_zero());
    }

    #[test]
    fn security_param_mismatch_is_rejected_on_load() {
        let dir = tempdir().unwrap();
        let (round, _rx) = new_round(dir.path(), 2, 10, 150);
        round.save_state().unwrap();
        drop(round); // release the challenge store's lock before reopening

        let (mut reloaded, _rx2) = new_round(dir.path(), 2, 10, 151);
        let err = reloaded.load_state().unwrap_err();
        assert!(matches!(
            err,
            RoundError::SecurityParamConfigMismatch { configured: 151, persisted: 150 }
        ));
    }

    #[test]
    fn load_state_without_a_prior_save_is_not_found() {
        let dir = tempdir().unwrap();
        let (mut round, _rx) = new_round(dir.path(), 4, 10, 4);
        assert!(matches!(round.load_state().unwrap_err(), RoundError::StateNotFound(_)));
    }

    #[test]
    fn execute_empty_round_pins_the_empty_tree_statement_and_publishes() {
        let dir = tempdir().unwrap();
        let (round, rx) = new_round(dir.path(), 7, 4, 4);

        let cancel = CancellationToken::new();
        // A deadline already in the past: the prover loop runs zero
        // leaves, deterministically, regardless of scheduling jitter.
        let deadline = SystemTime::now();
        round.execute(cancel, deadline, 0, 4096).unwrap();

        assert_eq!(round.members_count(), 0);
        let proof = rx.try_recv().expect("execute publishes on success");
        assert_eq!(proof.epoch, 7);
        assert!(proof.members.is_empty());
        assert_eq!(proof.num_leaves, 0);
        assert_eq!(proof.statement.as_bytes(), &poet_hash::empty_tree_root(&MEMBERSHIP_TREE_SEED));
        assert!(verify(&proof.statement, proof.num_leaves, 4, &proof.nip).unwrap());
    }

    #[test]
    fn cancelled_execution_can_be_recovered_and_then_publishes() {
        let dir = tempdir().unwrap();
        let (round, rx) = new_round(dir.path(), 11, 10, 4);
        round.submit(b"k1", b"c1").unwrap();
        round.submit(b"k2", b"c2").unwrap();
        round.submit(b"k3", b"c3").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let far_future = SystemTime::now() + Duration::from_secs(3600);
        let err = round.execute(cancel, far_future, 0, 4096).unwrap_err();
        assert!(matches!(err, RoundError::Cancelled));
        assert!(rx.try_recv().is_err(), "a cancelled execution must not publish");

        // Submits are closed once execution has started, cancelled or not.
        assert!(matches!(round.submit(b"k4", b"c4").unwrap_err(), RoundError::RoundIsNotOpen));

        let recovery_cancel = CancellationToken::new();
        let already_due = SystemTime::now();
        round.recover(recovery_cancel, already_due, 4096).unwrap();

        let proof = rx.try_recv().expect("recover publishes on success");
        assert_eq!(proof.members.len(), 3);
        assert!(verify(&proof.statement, proof.num_leaves, 4, &proof.nip).unwrap());
    }

    #[test]
    fn teardown_with_cleanup_removes_the_round_directory() {
        let dir = tempdir().unwrap();
        let (round, _rx) = new_round(dir.path(), 1, 4, 4);
        let round_dir = round.datadir.clone();
        round.teardown(true).unwrap();
        assert!(!round_dir.exists());
    }

    #[test]
    fn teardown_without_cleanup_leaves_a_final_state_snapshot() {
        let dir = tempdir().unwrap();
        let (round, _rx) = new_round(dir.path(), 1, 4, 4);
        let state_path = round.state_path();
        round.teardown(false).unwrap();
        assert!(state_path.exists());
    }
}
