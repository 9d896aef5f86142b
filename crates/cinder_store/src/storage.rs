//! Storage engine: a fjall keyspace split into column-family partitions,
//! fronted by the WAL.
//!
//! Commits hold a single write lock and run WAL append -> fjall batch ->
//! publish, so "snapshot at sequence S0" and "WAL from S0 + 1" compose
//! without a gap: snapshots are taken under the same lock and capture the
//! fjall instant together with the WAL sequence.

use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};

use crate::wal::{decode_ops, ColumnFamily, Wal, WalIter, WalOp};

pub struct Storage {
    keyspace: Keyspace,
    metadata: PartitionHandle,
    subkey: PartitionHandle,
    zset_score: PartitionHandle,
    stream: PartitionHandle,
    wal: Wal,
    commit_lock: Mutex<()>,
    last_version: AtomicU64,
    open_snapshots: Arc<AtomicUsize>,
}

impl Storage {
    pub fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).context("create data dir")?;
        let keyspace = fjall::Config::new(dir.join("storage"))
            .open()
            .context("open fjall keyspace")?;

        let open = |name: &str| {
            keyspace
                .open_partition(name, PartitionCreateOptions::default())
                .with_context(|| format!("open partition {name}"))
        };
        let metadata = open(ColumnFamily::Metadata.partition_name())?;
        let subkey = open(ColumnFamily::Subkey.partition_name())?;
        let zset_score = open(ColumnFamily::ZsetScore.partition_name())?;
        let stream = open(ColumnFamily::Stream.partition_name())?;

        let wal = Wal::open_dir(dir.join("wal"))?;

        Ok(Self {
            keyspace,
            metadata,
            subkey,
            zset_score,
            stream,
            wal,
            commit_lock: Mutex::new(()),
            last_version: AtomicU64::new(unix_time_ms() << 16),
            open_snapshots: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn partition(&self, cf: ColumnFamily) -> &PartitionHandle {
        match cf {
            ColumnFamily::Metadata => &self.metadata,
            ColumnFamily::Subkey => &self.subkey,
            ColumnFamily::ZsetScore => &self.zset_score,
            ColumnFamily::Stream => &self.stream,
        }
    }

    /// Open an auxiliary partition outside the data column families (used by
    /// the cluster layer for its persisted topology).
    pub fn open_extra_partition(&self, name: &str) -> anyhow::Result<PartitionHandle> {
        self.keyspace
            .open_partition(name, PartitionCreateOptions::default())
            .with_context(|| format!("open partition {name}"))
    }

    /// Commit one batch: WAL append, then the fjall batch, under the write
    /// lock. Returns the first WAL sequence of the batch.
    pub fn write_batch(&self, ops: Vec<WalOp>) -> anyhow::Result<u64> {
        anyhow::ensure!(!ops.is_empty(), "empty storage batch");
        let _guard = self
            .commit_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("storage commit lock poisoned"))?;
        let first_seq = self.wal.append(&ops)?;

        let mut batch = self.keyspace.batch();
        for op in ops {
            match op {
                WalOp::Put { cf, key, value } => batch.insert(self.partition(cf), key, value),
                WalOp::Delete { cf, key } => batch.remove(self.partition(cf), key),
                WalOp::LogData { .. } => {}
            }
        }
        batch.commit().context("commit storage batch")?;
        Ok(first_seq)
    }

    /// Apply an opaque batch received from a peer (raw-KV import path). The
    /// ops re-enter the local WAL with fresh sequences.
    pub fn apply_encoded_batch(&self, bytes: &[u8]) -> anyhow::Result<u64> {
        let ops = decode_ops(bytes)?;
        self.write_batch(ops)
    }

    pub fn get(&self, cf: ColumnFamily, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.partition(cf).get(key)?.map(|slice| slice.to_vec()))
    }

    /// Live prefix scan (current state, not snapshot-bound).
    pub fn prefix(
        &self,
        cf: ColumnFamily,
        prefix: Vec<u8>,
    ) -> impl Iterator<Item = anyhow::Result<(Vec<u8>, Vec<u8>)>> + '_ {
        self.partition(cf).prefix(prefix).map(|item| {
            item.map(|(k, v)| (k.to_vec(), v.to_vec()))
                .map_err(anyhow::Error::from)
        })
    }

    /// Take a point-in-time read view pinned at the current WAL sequence.
    pub fn snapshot(&self) -> anyhow::Result<EngineSnapshot> {
        // Holding the commit lock means no batch lands between the four
        // per-partition snapshots, so they observe one consistent instant.
        let _guard = self
            .commit_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("storage commit lock poisoned"))?;
        let wal_seq = self.wal.latest_sequence();
        self.open_snapshots.fetch_add(1, Ordering::SeqCst);
        Ok(EngineSnapshot {
            wal_seq,
            metadata: self.metadata.snapshot(),
            subkey: self.subkey.snapshot(),
            zset_score: self.zset_score.snapshot(),
            stream: self.stream.snapshot(),
            pins: Arc::clone(&self.open_snapshots),
            released: false,
        })
    }

    /// Number of snapshots currently pinned.
    pub fn open_snapshot_count(&self) -> usize {
        self.open_snapshots.load(Ordering::SeqCst)
    }

    pub fn latest_sequence(&self) -> u64 {
        self.wal.latest_sequence()
    }

    pub fn wal_iter_from(&self, start_seq: u64) -> anyhow::Result<WalIter> {
        self.wal.iter_from(start_seq)
    }

    /// Generate a container version: time-prefixed and strictly monotonic
    /// within the process even if the clock steps backwards.
    pub fn generate_version(&self) -> u64 {
        let candidate = unix_time_ms() << 16;
        let mut prev = self.last_version.load(Ordering::Relaxed);
        loop {
            let next = prev.max(candidate) + 1;
            match self.last_version.compare_exchange_weak(
                prev,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => prev = observed,
            }
        }
    }
}

/// Immutable read view of all column families at one WAL sequence.
///
/// The view pins storage resources until released; release happens exactly
/// once (explicitly or on drop).
pub struct EngineSnapshot {
    pub wal_seq: u64,
    metadata: fjall::Snapshot,
    subkey: fjall::Snapshot,
    zset_score: fjall::Snapshot,
    stream: fjall::Snapshot,
    pins: Arc<AtomicUsize>,
    released: bool,
}

impl EngineSnapshot {
    fn view(&self, cf: ColumnFamily) -> &fjall::Snapshot {
        match cf {
            ColumnFamily::Metadata => &self.metadata,
            ColumnFamily::Subkey => &self.subkey,
            ColumnFamily::ZsetScore => &self.zset_score,
            ColumnFamily::Stream => &self.stream,
        }
    }

    pub fn get(&self, cf: ColumnFamily, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.view(cf).get(key)?.map(|slice| slice.to_vec()))
    }

    pub fn prefix(
        &self,
        cf: ColumnFamily,
        prefix: Vec<u8>,
    ) -> impl Iterator<Item = anyhow::Result<(Vec<u8>, Vec<u8>)>> + '_ {
        self.view(cf).prefix(prefix).map(|item| {
            item.map(|(k, v)| (k.to_vec(), v.to_vec()))
                .map_err(anyhow::Error::from)
        })
    }

    /// Release the pin. Idempotent with drop.
    pub fn release(mut self) {
        self.release_pin();
    }

    fn release_pin(&mut self) {
        if !self.released {
            self.released = true;
            self.pins.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for EngineSnapshot {
    fn drop(&mut self) {
        self.release_pin();
    }
}

pub(crate) fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
