// Copyright © Poet Contributors
// SPDX-License-Identifier: Apache-2.0

//! Durable, ordered key-value store for a single round's submitted
//! challenges.
//!
//! One store is opened per round at `<datadir>/<epoch>/challenges` and
//! closed exactly once, on teardown. Iteration order is RocksDB's default
//! lexicographic byte order over keys — this is the "total, deterministic
//! order" the round engine's membership order is defined by; callers must
//! not assume insertion order.

use std::path::{Path, PathBuf};

use rocksdb::{IteratorMode, Options, WriteOptions, DB};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChallengeStoreError {
    #[error("opening challenge store at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rocksdb::Error,
    },
    #[error("reading challenge store: {0}")]
    Read(#[source] rocksdb::Error),
    #[error("writing challenge store: {0}")]
    Write(#[source] rocksdb::Error),
    #[error("challenge store already closed")]
    AlreadyClosed,
}

pub type Result<T> = std::result::Result<T, ChallengeStoreError>;

/// Ordered key-value store backed by RocksDB, scoped to one round.
pub struct ChallengeStore {
    // `None` once `close` has been called; every other method rejects
    // use-after-close with `AlreadyClosed` rather than panicking.
    db: Option<DB>,
}

impl ChallengeStore {
    /// Opens (creating if absent) the store at `path`. The caller is
    /// responsible for removing `path`'s parent directory on failure —
    /// this mirrors `original_source/service/round.go::newRound`, which
    /// removes the partial `<epoch>` directory when `leveldb.OpenFile`
    /// fails.
    pub fn open(path: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path).map_err(|source| ChallengeStoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "opened challenge store");
        Ok(ChallengeStore { db: Some(db) })
    }

    fn db(&self) -> Result<&DB> {
        self.db.as_ref().ok_or(ChallengeStoreError::AlreadyClosed)
    }

    /// Point lookup: does `key` already have a challenge on file?
    pub fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.db()?.get_pinned(key).map_err(ChallengeStoreError::Read)?.is_some())
    }

    /// Durable write: the value must reach stable storage before this
    /// returns `Ok`. `submit`'s caller relies on this to serialize the
    /// member counter update after the write, not before.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db()?
            .put_opt(key, value, &write_opts)
            .map_err(ChallengeStoreError::Write)
    }

    /// Iterates all `(key, challenge)` pairs in the store's total key
    /// order. This order defines member order for the membership tree. A
    /// mid-iteration rocksdb error is surfaced per-item rather than
    /// dropped, so a caller folding this into a Merkle tree cannot end up
    /// with a silently truncated `Members` list.
    pub fn iter(&self) -> Result<impl Iterator<Item = Result<(Box<[u8]>, Box<[u8]>)>> + '_> {
        Ok(self
            .db()?
            .iterator(IteratorMode::Start)
            .map(|item| item.map_err(ChallengeStoreError::Read)))
    }

    /// Closes the underlying database. Idempotent calls after the first
    /// return `AlreadyClosed` rather than panicking, since `teardown` is
    /// the only caller and always calls this exactly once.
    pub fn close(&mut self) -> Result<()> {
        self.db.take().ok_or(ChallengeStoreError::AlreadyClosed)?;
        Ok(())
    }
}
