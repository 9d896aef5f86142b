//! Live slot migration engine.
//!
//! One dedicated worker owns the whole transfer: it pins a storage snapshot,
//! streams every slot-scoped record to the destination, chases the WAL tail
//! until the gap is small, freezes writes to the slot for one final drain,
//! and finishes the import handshake. Stages run as a small state machine:
//! Start -> Snapshot -> WAL -> Success -> Clean, any failure dropping into
//! Failed -> Clean. Cancellation is a cooperative flag polled at every inner
//! loop head and pipeline boundary.

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tokio::sync::oneshot;

use crate::batch_extractor::extract_commands;
use crate::batch_sender::BatchSender;
use crate::cluster::Cluster;
use crate::config::MigrationType;
use crate::metadata::{
    compose_subkey_prefix, decode_score, decode_stream_entry, format_score, Metadata,
    ParsedInternalKey, RedisType, StreamEntryId, StreamMetadata, string_payload,
};
use crate::resp::{encode_command, read_replies};
use crate::slot::{compose_slot_prefix, split_metadata_key, SlotId};
use crate::storage::{unix_time_ms, EngineSnapshot, Storage};
use crate::wal::{ColumnFamily, WalOp, WriteBatchLogData};

pub const ERR_MIGRATION_CANCELED: &str = "key migration stopped due to a task cancellation";
const ERR_SEND_COMMANDS: &str = "failed to send commands to restore a key";
const ERR_SET_IMPORT_STATUS: &str = "failed to set import status on destination node";

/// Elements per variadic restore command before it is cut.
const MAX_ITEMS_IN_COMMAND: usize = 100;
/// Catch-up epochs before the forbidden flip happens regardless of gap.
const MAX_LOOP_TIMES: u32 = 10;

pub const DEFAULT_PIPELINE_SIZE: u64 = 16;
pub const DEFAULT_SEQUENCE_GAP: u64 = 10_000;

const IMPORT_START: u8 = 0;
const IMPORT_SUCCESS: u8 = 1;
const IMPORT_FAILED: u8 = 2;

/// Observable migration state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationState {
    None,
    Started,
    Success,
    Failed,
}

impl MigrationState {
    fn as_u8(self) -> u8 {
        match self {
            MigrationState::None => 0,
            MigrationState::Started => 1,
            MigrationState::Success => 2,
            MigrationState::Failed => 3,
        }
    }

    fn from_u8(tag: u8) -> Self {
        match tag {
            1 => MigrationState::Started,
            2 => MigrationState::Success,
            3 => MigrationState::Failed,
            _ => MigrationState::None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MigrationState::None => "none",
            MigrationState::Started => "start",
            MigrationState::Success => "success",
            MigrationState::Failed => "fail",
        }
    }
}

/// Immutable request record created on submission.
#[derive(Clone, Debug)]
pub struct MigrationJob {
    pub slot: SlotId,
    pub dst_ip: String,
    pub dst_port: u16,
    pub max_speed: u64,
    pub max_pipeline_size: u64,
    pub seq_gap_limit: u64,
    pub migration_type: MigrationType,
    pub batch_max_bytes: usize,
    pub batch_bytes_per_sec: u64,
}

pub type MigrateResult = Result<(), String>;

/// Cross-thread migration state. The engine thread is the only writer of
/// everything except `stop`; the control API and the server's write path
/// only read (or flip `stop`).
pub struct MigrateShared {
    migrating_slot: AtomicI32,
    forbidden_slot: AtomicI32,
    failed_slot: AtomicI32,
    state: AtomicU8,
    stop: AtomicBool,
    dst_node: Mutex<String>,
}

impl MigrateShared {
    fn new() -> Self {
        Self {
            migrating_slot: AtomicI32::new(-1),
            forbidden_slot: AtomicI32::new(-1),
            failed_slot: AtomicI32::new(-1),
            state: AtomicU8::new(MigrationState::None.as_u8()),
            stop: AtomicBool::new(false),
            dst_node: Mutex::new(String::new()),
        }
    }

    fn slot_of(atomic: &AtomicI32) -> Option<SlotId> {
        let value = atomic.load(Ordering::SeqCst);
        (value >= 0).then_some(value as SlotId)
    }

    pub fn migrating_slot(&self) -> Option<SlotId> {
        Self::slot_of(&self.migrating_slot)
    }

    pub fn forbidden_slot(&self) -> Option<SlotId> {
        Self::slot_of(&self.forbidden_slot)
    }

    pub fn failed_slot(&self) -> Option<SlotId> {
        Self::slot_of(&self.failed_slot)
    }

    pub fn state(&self) -> MigrationState {
        MigrationState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn dst_node(&self) -> String {
        self.dst_node.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Drop the forbidden flag. After a successful transfer the moved rule
    /// owns the refusal, so the cluster layer may release the flag once the
    /// topology is settled.
    pub fn release_forbidden_slot(&self) {
        self.forbidden_slot.store(-1, Ordering::SeqCst);
    }
}

/// Dependencies handed to the engine worker.
pub struct MigrateContext {
    pub storage: Arc<Storage>,
    pub cluster: Arc<Cluster>,
    pub namespace: Vec<u8>,
    /// Server-wide exclusive-write guard: the write path holds the shared
    /// side while executing a command; the engine takes the exclusive side
    /// for the sub-microsecond forbidden flip.
    pub exclusive: Arc<RwLock<()>>,
    pub password: Option<String>,
}

struct QueuedJob {
    job: MigrationJob,
    blocking: Option<oneshot::Sender<MigrateResult>>,
}

/// Public control surface: submit, cancel, observe.
pub struct SlotMigrator {
    shared: Arc<MigrateShared>,
    cluster: Arc<Cluster>,
    job_tx: mpsc::Sender<QueuedJob>,
}

impl SlotMigrator {
    pub fn spawn(ctx: MigrateContext) -> anyhow::Result<Self> {
        let shared = Arc::new(MigrateShared::new());
        let cluster = ctx.cluster.clone();
        let (job_tx, job_rx) = mpsc::channel();
        let worker_shared = shared.clone();
        thread::Builder::new()
            .name("slot-migrate".to_string())
            .spawn(move || worker_loop(ctx, worker_shared, job_rx))
            .context("spawn slot migration thread")?;
        Ok(Self {
            shared,
            cluster,
            job_tx,
        })
    }

    pub fn shared(&self) -> Arc<MigrateShared> {
        self.shared.clone()
    }

    /// Claim the single migration slot and queue the job. The optional
    /// `blocking` sender is resumed exactly once with the terminal outcome.
    pub fn submit(
        &self,
        job: MigrationJob,
        blocking: Option<oneshot::Sender<MigrateResult>>,
    ) -> anyhow::Result<()> {
        let slot = job.slot;
        if self
            .shared
            .migrating_slot
            .compare_exchange(-1, slot as i32, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            anyhow::bail!("There is already a migrating slot");
        }

        if self.shared.forbidden_slot() == Some(slot) || self.cluster.is_migrated(slot) {
            self.shared.migrating_slot.store(-1, Ordering::SeqCst);
            anyhow::bail!("Can't migrate slot which has been migrated");
        }

        self.shared
            .state
            .store(MigrationState::Started.as_u8(), Ordering::SeqCst);
        if let Ok(mut dst) = self.shared.dst_node.lock() {
            *dst = format!("{}:{}", job.dst_ip, job.dst_port);
        }

        let dst_ip = job.dst_ip.clone();
        let dst_port = job.dst_port;
        if self.job_tx.send(QueuedJob { job, blocking }).is_err() {
            self.shared.migrating_slot.store(-1, Ordering::SeqCst);
            self.shared
                .state
                .store(MigrationState::None.as_u8(), Ordering::SeqCst);
            anyhow::bail!("migration worker is not running");
        }

        tracing::info!(slot, %dst_ip, dst_port, "start migrating slot");
        Ok(())
    }

    /// Cooperative cancellation; observed at loop heads and before sends.
    pub fn cancel(&self) {
        if self.shared.migrating_slot().is_some() {
            self.shared.stop.store(true, Ordering::SeqCst);
        }
    }

    /// Text status: `migrating_slot`, `destination_node`, `migrating_state`.
    pub fn status_text(&self) -> String {
        let state = self.shared.state();
        let slot: i32 = match state {
            MigrationState::None => -1,
            MigrationState::Started => {
                self.shared.migrating_slot().map(i32::from).unwrap_or(-1)
            }
            MigrationState::Success => {
                self.shared.forbidden_slot().map(i32::from).unwrap_or(-1)
            }
            MigrationState::Failed => self.shared.failed_slot().map(i32::from).unwrap_or(-1),
        };
        format!(
            "migrating_slot: {}\r\ndestination_node: {}\r\nmigrating_state: {}\r\n",
            slot,
            self.shared.dst_node(),
            state.as_str()
        )
    }
}

fn worker_loop(ctx: MigrateContext, shared: Arc<MigrateShared>, job_rx: mpsc::Receiver<QueuedJob>) {
    while let Ok(queued) = job_rx.recv() {
        tracing::info!(
            slot = queued.job.slot,
            dst_ip = %queued.job.dst_ip,
            dst_port = queued.job.dst_port,
            max_speed = queued.job.max_speed,
            max_pipeline_size = queued.job.max_pipeline_size,
            "migrating slot"
        );
        let mut task = MigrationTask {
            ctx: &ctx,
            shared: &shared,
            job: queued.job,
            blocking: queued.blocking,
            snapshot: None,
            stream: None,
            wal_begin_seq: 0,
            pipeline: Vec::new(),
            pipeline_size: 0,
            last_send_us: 0,
        };
        task.run();
    }
}

enum Stage {
    Start,
    Snapshot,
    Wal,
    Success,
    Failed,
    Clean,
}

enum KeyMigrationResult {
    Migrated,
    Expired,
    UnderlyingStructEmpty,
}

struct MigrationTask<'a> {
    ctx: &'a MigrateContext,
    shared: &'a MigrateShared,
    job: MigrationJob,
    blocking: Option<oneshot::Sender<MigrateResult>>,
    snapshot: Option<EngineSnapshot>,
    stream: Option<TcpStream>,
    wal_begin_seq: u64,
    pipeline: Vec<u8>,
    pipeline_size: u64,
    last_send_us: u64,
}

impl MigrationTask<'_> {
    fn run(&mut self) {
        let slot = self.job.slot;
        let mut stage = Stage::Start;
        loop {
            match stage {
                Stage::Start => match self.start_migration() {
                    Ok(()) => {
                        tracing::info!(slot, "succeeded to start migrating slot");
                        stage = Stage::Snapshot;
                    }
                    Err(err) => {
                        tracing::error!(slot, error = ?err, "failed to start migrating slot");
                        self.resume_blocking(Err(format!("{err:#}")));
                        stage = Stage::Failed;
                    }
                },
                Stage::Snapshot => match self.send_snapshot() {
                    Ok(()) => stage = Stage::Wal,
                    Err(err) => {
                        tracing::error!(slot, error = ?err, "failed to send slot snapshot");
                        self.resume_blocking(Err(format!("{err:#}")));
                        stage = Stage::Failed;
                    }
                },
                Stage::Wal => match self.sync_wal() {
                    Ok(()) => {
                        tracing::info!(slot, "succeeded to sync from WAL");
                        stage = Stage::Success;
                    }
                    Err(err) => {
                        tracing::error!(slot, error = ?err, "failed to sync from WAL");
                        self.resume_blocking(Err(format!("{err:#}")));
                        stage = Stage::Failed;
                    }
                },
                Stage::Success => match self.finish_success() {
                    Ok(()) => {
                        tracing::info!(slot, "succeeded to migrate slot");
                        self.shared
                            .state
                            .store(MigrationState::Success.as_u8(), Ordering::SeqCst);
                        self.resume_blocking(Ok(()));
                        stage = Stage::Clean;
                    }
                    Err(err) => {
                        tracing::error!(slot, error = ?err, "failed to finish migration");
                        self.resume_blocking(Err(format!("{err:#}")));
                        stage = Stage::Failed;
                    }
                },
                Stage::Failed => {
                    self.finish_failed();
                    self.shared
                        .state
                        .store(MigrationState::Failed.as_u8(), Ordering::SeqCst);
                    stage = Stage::Clean;
                }
                Stage::Clean => {
                    self.clean();
                    return;
                }
            }
        }
    }

    fn stopped(&self) -> bool {
        self.shared.stopped()
    }

    // ---- Start ----

    fn start_migration(&mut self) -> anyhow::Result<()> {
        let snapshot = self.ctx.storage.snapshot()?;
        self.wal_begin_seq = snapshot.wal_seq;
        self.snapshot = Some(snapshot);
        self.last_send_us = 0;

        let addr = format!("{}:{}", self.job.dst_ip, self.job.dst_port);
        let stream = TcpStream::connect(&addr)
            .with_context(|| format!("failed to connect to the destination node {addr}"))?;
        stream.set_nodelay(true).ok();
        stream
            .set_read_timeout(Some(Duration::from_secs(1)))
            .context("set destination read timeout")?;
        self.stream = Some(stream);

        if let Some(password) = self.ctx.password.clone() {
            self.send_control_command(&[b"AUTH".to_vec(), password.into_bytes()])
                .context("failed to authenticate on destination node")?;
        }
        self.set_import_status(IMPORT_START)
            .context(ERR_SET_IMPORT_STATUS)?;

        tracing::info!(
            slot = self.job.slot,
            wal_begin_seq = self.wal_begin_seq,
            "connected to destination, snapshot pinned"
        );
        Ok(())
    }

    fn send_control_command(&mut self, args: &[Vec<u8>]) -> anyhow::Result<()> {
        let frame = encode_command(args);
        let shared = self.shared;
        let stream = self
            .stream
            .as_mut()
            .context("destination connection is not open")?;
        stream.write_all(&frame)?;
        read_replies(stream, 1, &|| shared.stopped())
    }

    fn set_import_status(&mut self, status: u8) -> anyhow::Result<()> {
        let args = vec![
            b"CLUSTER".to_vec(),
            b"IMPORT".to_vec(),
            self.job.slot.to_string().into_bytes(),
            status.to_string().into_bytes(),
        ];
        self.send_control_command(&args)
    }

    // ---- Snapshot stage ----

    fn send_snapshot(&mut self) -> anyhow::Result<()> {
        match self.job.migration_type {
            MigrationType::CommandReplay => self.send_snapshot_by_cmd(),
            MigrationType::RawKv => self.send_snapshot_by_rawkv(),
        }
    }

    fn send_snapshot_by_cmd(&mut self) -> anyhow::Result<()> {
        let snapshot = self.snapshot.take().context("engine snapshot missing")?;
        let result = self.stream_snapshot_commands(&snapshot);
        self.snapshot = Some(snapshot);
        result
    }

    fn stream_snapshot_commands(&mut self, snapshot: &EngineSnapshot) -> anyhow::Result<()> {
        let slot = self.job.slot;
        tracing::info!(slot, "start migrating snapshot");
        let prefix = compose_slot_prefix(&self.ctx.namespace, slot);

        let mut migrated = 0u64;
        let mut expired = 0u64;
        let mut empty = 0u64;

        for item in snapshot.prefix(ColumnFamily::Metadata, prefix) {
            if self.stopped() {
                anyhow::bail!(ERR_MIGRATION_CANCELED);
            }
            let (mkey, mval) = item?;
            let (_, user_key) = split_metadata_key(&mkey)?;
            let outcome = self.migrate_one_key(snapshot, user_key, &mval).with_context(|| {
                format!("failed to migrate key {}", String::from_utf8_lossy(user_key))
            })?;
            match outcome {
                KeyMigrationResult::Migrated => migrated += 1,
                KeyMigrationResult::Expired => expired += 1,
                KeyMigrationResult::UnderlyingStructEmpty => empty += 1,
            }
        }

        // The final pipeline may be below the size threshold; drain it.
        self.send_pipeline_if_needed(true)
            .context(ERR_SEND_COMMANDS)?;

        tracing::info!(slot, migrated, expired, empty, "slot snapshot migrated");
        Ok(())
    }

    fn migrate_one_key(
        &mut self,
        snapshot: &EngineSnapshot,
        user_key: &[u8],
        meta_bytes: &[u8],
    ) -> anyhow::Result<KeyMigrationResult> {
        let meta = Metadata::decode(meta_bytes)?;
        if meta.redis_type.is_emptyable() && meta.size == 0 {
            return Ok(KeyMigrationResult::UnderlyingStructEmpty);
        }
        if meta.expired_at(unix_time_ms()) {
            return Ok(KeyMigrationResult::Expired);
        }

        match meta.redis_type {
            RedisType::String => self.migrate_simple_key(user_key, meta_bytes, meta.expire_ms)?,
            RedisType::Stream => self.migrate_stream(snapshot, user_key, meta_bytes)?,
            RedisType::Bitmap => self.migrate_bitmap(snapshot, user_key, &meta)?,
            _ => self.migrate_complex_key(snapshot, user_key, &meta)?,
        }
        Ok(KeyMigrationResult::Migrated)
    }

    fn migrate_simple_key(
        &mut self,
        user_key: &[u8],
        meta_bytes: &[u8],
        expire_ms: u64,
    ) -> anyhow::Result<()> {
        let mut cmd: Vec<Vec<u8>> = vec![
            b"SET".to_vec(),
            user_key.to_vec(),
            string_payload(meta_bytes)?.to_vec(),
        ];
        if expire_ms > 0 {
            cmd.push(b"PXAT".to_vec());
            cmd.push(expire_ms.to_string().into_bytes());
        }
        self.push_command(&cmd);
        self.send_pipeline_if_needed(false)
            .context(ERR_SEND_COMMANDS)
    }

    fn migrate_complex_key(
        &mut self,
        snapshot: &EngineSnapshot,
        user_key: &[u8],
        meta: &Metadata,
    ) -> anyhow::Result<()> {
        let mut args: Vec<Vec<u8>> = vec![
            meta.redis_type.restore_command().as_bytes().to_vec(),
            user_key.to_vec(),
        ];
        let prefix =
            compose_subkey_prefix(&self.ctx.namespace, self.job.slot, user_key, meta.version);
        let mut item_count = 0usize;

        for item in snapshot.prefix(ColumnFamily::Subkey, prefix) {
            if self.stopped() {
                anyhow::bail!(ERR_MIGRATION_CANCELED);
            }
            let (ikey, ivalue) = item?;
            let parsed = ParsedInternalKey::decode(&ikey)?;
            match meta.redis_type {
                RedisType::Set => args.push(parsed.sub_key),
                RedisType::SortedInt => {
                    anyhow::ensure!(parsed.sub_key.len() == 8, "corrupt sortedint sub-key");
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(&parsed.sub_key);
                    args.push(u64::from_be_bytes(buf).to_string().into_bytes());
                }
                RedisType::ZSet => {
                    args.push(format_score(decode_score(&ivalue)?).into_bytes());
                    args.push(parsed.sub_key);
                }
                RedisType::Hash => {
                    args.push(parsed.sub_key);
                    args.push(ivalue);
                }
                RedisType::List => args.push(ivalue),
                _ => {}
            }

            item_count += 1;
            if item_count >= MAX_ITEMS_IN_COMMAND {
                self.push_command(&args);
                args.truncate(2);
                item_count = 0;
                self.send_pipeline_if_needed(false)
                    .context(ERR_SEND_COMMANDS)?;
            }
        }

        if item_count > 0 {
            self.push_command(&args);
        }

        if meta.expire_ms > 0 {
            self.push_expire(user_key, meta.expire_ms);
        }
        self.send_pipeline_if_needed(false)
            .context(ERR_SEND_COMMANDS)
    }

    fn migrate_bitmap(
        &mut self,
        snapshot: &EngineSnapshot,
        user_key: &[u8],
        meta: &Metadata,
    ) -> anyhow::Result<()> {
        let prefix =
            compose_subkey_prefix(&self.ctx.namespace, self.job.slot, user_key, meta.version);
        for item in snapshot.prefix(ColumnFamily::Subkey, prefix) {
            if self.stopped() {
                anyhow::bail!(ERR_MIGRATION_CANCELED);
            }
            let (ikey, fragment) = item?;
            let parsed = ParsedInternalKey::decode(&ikey)?;
            let fragment_start: u64 = String::from_utf8_lossy(&parsed.sub_key)
                .parse()
                .context("bitmap sub-key is not an integer")?;

            // Bitmaps have no variadic restore command; every set bit turns
            // into its own SETBIT. Correctness over speed.
            for (byte_idx, byte) in fragment.iter().enumerate() {
                if *byte == 0 {
                    continue;
                }
                for bit_idx in 0..8u64 {
                    if byte & (1 << bit_idx) != 0 {
                        let offset = (fragment_start + byte_idx as u64) * 8 + bit_idx;
                        self.push_command(&[
                            b"SETBIT".to_vec(),
                            user_key.to_vec(),
                            offset.to_string().into_bytes(),
                            b"1".to_vec(),
                        ]);
                    }
                }
            }
            self.send_pipeline_if_needed(false)
                .context(ERR_SEND_COMMANDS)?;
        }

        if meta.expire_ms > 0 {
            self.push_expire(user_key, meta.expire_ms);
        }
        self.send_pipeline_if_needed(false)
            .context(ERR_SEND_COMMANDS)
    }

    fn migrate_stream(
        &mut self,
        snapshot: &EngineSnapshot,
        user_key: &[u8],
        meta_bytes: &[u8],
    ) -> anyhow::Result<()> {
        let stream_meta = StreamMetadata::decode(meta_bytes)?;
        let prefix = compose_subkey_prefix(
            &self.ctx.namespace,
            self.job.slot,
            user_key,
            stream_meta.meta.version,
        );

        for item in snapshot.prefix(ColumnFamily::Stream, prefix) {
            if self.stopped() {
                anyhow::bail!(ERR_MIGRATION_CANCELED);
            }
            let (ikey, ivalue) = item?;
            let parsed = ParsedInternalKey::decode(&ikey)?;
            let id = StreamEntryId::decode(&parsed.sub_key)?;
            let mut cmd: Vec<Vec<u8>> = vec![
                b"XADD".to_vec(),
                user_key.to_vec(),
                id.to_string().into_bytes(),
            ];
            for (field, value) in decode_stream_entry(&ivalue)? {
                cmd.push(field);
                cmd.push(value);
            }
            self.push_command(&cmd);
            self.send_pipeline_if_needed(false)
                .context(ERR_SEND_COMMANDS)?;
        }

        // XTRIM/XDEL history cannot be replayed from entries alone; XSETID
        // carries the id bookkeeping to the destination.
        self.push_command(&[
            b"XSETID".to_vec(),
            user_key.to_vec(),
            stream_meta.last_generated_id.to_string().into_bytes(),
            b"ENTRIESADDED".to_vec(),
            stream_meta.entries_added.to_string().into_bytes(),
            b"MAXDELETEDID".to_vec(),
            stream_meta.max_deleted_entry_id.to_string().into_bytes(),
        ]);

        if stream_meta.meta.expire_ms > 0 {
            self.push_expire(user_key, stream_meta.meta.expire_ms);
        }
        self.send_pipeline_if_needed(false)
            .context(ERR_SEND_COMMANDS)
    }

    // ---- WAL stage ----

    fn sync_wal(&mut self) -> anyhow::Result<()> {
        match self.job.migration_type {
            MigrationType::CommandReplay => self.sync_wal_by_cmd(),
            MigrationType::RawKv => self.sync_wal_by_rawkv(),
        }
    }

    fn sync_wal_by_cmd(&mut self) -> anyhow::Result<()> {
        self.sync_wal_before_forbidding_slot()
            .context("failed to sync WAL before forbidding a slot")?;
        self.set_forbidden_slot();
        self.sync_wal_after_forbidding_slot()
            .context("failed to sync WAL after forbidding a slot")?;
        Ok(())
    }

    /// Phase A: chase the WAL tail until the residual gap is small.
    fn sync_wal_before_forbidding_slot(&mut self) -> anyhow::Result<()> {
        let mut epoch = 0u32;
        while epoch < MAX_LOOP_TIMES {
            let latest_seq = self.ctx.storage.latest_sequence();
            let gap = latest_seq - self.wal_begin_seq;
            if gap <= self.job.seq_gap_limit {
                tracing::info!(
                    gap,
                    limit = self.job.seq_gap_limit,
                    "incremental gap below limit, going to set forbidden slot"
                );
                break;
            }
            self.migrate_incremental_data(latest_seq)?;
            self.wal_begin_seq = latest_seq;
            epoch += 1;
        }
        tracing::info!(epoch, "incremental data migrated before forbidding slot");
        Ok(())
    }

    /// Phase B tail: one final drain after the slot is frozen.
    fn sync_wal_after_forbidding_slot(&mut self) -> anyhow::Result<()> {
        let latest_seq = self.ctx.storage.latest_sequence();
        if latest_seq <= self.wal_begin_seq {
            return Ok(());
        }
        self.migrate_incremental_data(latest_seq)
    }

    fn migrate_incremental_data(&mut self, end_seq: u64) -> anyhow::Result<()> {
        let mut expected_seq = self.wal_begin_seq + 1;
        let iter = self.ctx.storage.wal_iter_from(expected_seq)?;
        for batch in iter {
            if self.stopped() {
                anyhow::bail!(ERR_MIGRATION_CANCELED);
            }
            let batch = batch?;
            if batch.first_seq > end_seq {
                break;
            }
            anyhow::ensure!(
                batch.first_seq == expected_seq,
                "WAL is discrete, some sequences might be lost, expected sequence: {expected_seq}, but got sequence: {}",
                batch.first_seq
            );

            for cmd in extract_commands(&batch.ops, &self.ctx.namespace, self.job.slot)? {
                self.push_command(&cmd);
            }
            self.send_pipeline_if_needed(false)
                .context(ERR_SEND_COMMANDS)?;

            expected_seq = batch.next_seq();
            if expected_seq > end_seq {
                break;
            }
        }
        anyhow::ensure!(
            expected_seq > end_seq,
            "WAL ended early, expected sequence: {expected_seq}, end sequence: {end_seq}"
        );
        self.send_pipeline_if_needed(true)
            .context(ERR_SEND_COMMANDS)?;
        tracing::info!(
            from = self.wal_begin_seq,
            to = end_seq,
            "migrated one epoch of incremental data"
        );
        Ok(())
    }

    /// Freeze the slot: flip the atomic under the server's exclusive-write
    /// guard so no in-flight write straddles the boundary.
    fn set_forbidden_slot(&self) {
        let slot = self.job.slot;
        tracing::info!(slot, "setting forbidden slot");
        let started = Instant::now();
        {
            let _guard = match self.ctx.exclusive.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            self.shared.forbidden_slot.store(slot as i32, Ordering::SeqCst);
        }
        tracing::info!(
            slot,
            blocked_us = started.elapsed().as_micros() as u64,
            "forbidden slot set"
        );
    }

    // ---- Raw-KV paths ----

    fn send_snapshot_by_rawkv(&mut self) -> anyhow::Result<()> {
        let started = Instant::now();
        tracing::info!(slot = self.job.slot, "migrating snapshot by raw key value");
        let snapshot = self.snapshot.take().context("engine snapshot missing")?;
        let mut stream = self
            .stream
            .take()
            .context("destination connection is not open")?;
        let result = self.stream_snapshot_rawkv(&snapshot, &mut stream);
        self.stream = Some(stream);
        self.snapshot = Some(snapshot);

        let (bytes, batches, entries) = result?;
        tracing::info!(
            slot = self.job.slot,
            elapsed_ms = started.elapsed().as_millis() as u64,
            sent_bytes = bytes,
            batches,
            entries,
            "snapshot migrated by raw key value"
        );
        Ok(())
    }

    fn stream_snapshot_rawkv(
        &self,
        snapshot: &EngineSnapshot,
        stream: &mut TcpStream,
    ) -> anyhow::Result<(u64, u64, u64)> {
        let shared = self.shared;
        let stop = || shared.stopped();
        let mut sender =
            BatchSender::new(stream, self.job.batch_max_bytes, self.job.batch_bytes_per_sec);
        let prefix = compose_slot_prefix(&self.ctx.namespace, self.job.slot);

        for item in snapshot.prefix(ColumnFamily::Metadata, prefix) {
            if stop() {
                anyhow::bail!(ERR_MIGRATION_CANCELED);
            }
            let (mkey, mval) = item?;
            let meta = Metadata::decode(&mval)?;
            let (_, user_key) = split_metadata_key(&mkey)?;

            // A log-data header precedes each batch so the destination can
            // reconstruct the metadata; lists also need the direction hint.
            let log_data = if meta.redis_type == RedisType::List {
                WriteBatchLogData::with_args(RedisType::List, vec![b"rpush".to_vec()])
            } else {
                WriteBatchLogData::new(meta.redis_type)
            };
            sender.set_prefix_log_data(log_data.encode());
            sender.put(ColumnFamily::Metadata, mkey.clone(), mval.clone());

            if meta.redis_type != RedisType::String {
                let sub_prefix = compose_subkey_prefix(
                    &self.ctx.namespace,
                    self.job.slot,
                    user_key,
                    meta.version,
                );
                let data_cfs: &[ColumnFamily] = match meta.redis_type {
                    RedisType::Stream => &[ColumnFamily::Stream],
                    RedisType::ZSet => &[ColumnFamily::Subkey, ColumnFamily::ZsetScore],
                    _ => &[ColumnFamily::Subkey],
                };
                for cf in data_cfs {
                    for sub_item in snapshot.prefix(*cf, sub_prefix.clone()) {
                        if stop() {
                            anyhow::bail!(ERR_MIGRATION_CANCELED);
                        }
                        let (sub_key, sub_value) = sub_item?;
                        sender.put(*cf, sub_key, sub_value);
                        if sender.is_full() {
                            sender.send(&stop)?;
                        }
                    }
                }
            }

            if sender.is_full() {
                sender.send(&stop)?;
            }
        }

        sender.send(&stop)?;
        Ok((
            sender.sent_bytes(),
            sender.sent_batches(),
            sender.sent_entries(),
        ))
    }

    fn sync_wal_by_rawkv(&mut self) -> anyhow::Result<()> {
        let started = Instant::now();
        tracing::info!(slot = self.job.slot, "syncing WAL by raw key value");
        let mut stream = self
            .stream
            .take()
            .context("destination connection is not open")?;
        let result = self.stream_wal_rawkv(&mut stream);
        self.stream = Some(stream);
        result?;
        tracing::info!(
            slot = self.job.slot,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "incremental data migrated by raw key value"
        );
        Ok(())
    }

    fn stream_wal_rawkv(&mut self, stream: &mut TcpStream) -> anyhow::Result<()> {
        let mut sender = BatchSender::new(
            stream,
            self.job.batch_max_bytes,
            self.job.batch_bytes_per_sec,
        );

        let mut epoch = 0u32;
        while epoch < MAX_LOOP_TIMES {
            let latest_seq = self.ctx.storage.latest_sequence();
            let gap = latest_seq - self.wal_begin_seq;
            if gap <= self.job.seq_gap_limit {
                tracing::info!(
                    gap,
                    limit = self.job.seq_gap_limit,
                    "incremental gap below limit, going to set forbidden slot"
                );
                break;
            }
            self.migrate_incremental_rawkv(&mut sender, latest_seq)?;
            tracing::info!(epoch, from = self.wal_begin_seq, to = latest_seq, "migrated incremental epoch");
            self.wal_begin_seq = latest_seq;
            epoch += 1;
        }

        self.set_forbidden_slot();

        let latest_seq = self.ctx.storage.latest_sequence();
        if latest_seq > self.wal_begin_seq {
            self.migrate_incremental_rawkv(&mut sender, latest_seq)?;
            self.wal_begin_seq = latest_seq;
        }
        Ok(())
    }

    fn migrate_incremental_rawkv(
        &mut self,
        sender: &mut BatchSender<'_, TcpStream>,
        end_seq: u64,
    ) -> anyhow::Result<()> {
        let shared = self.shared;
        let stop = || shared.stopped();
        let slot_prefix = compose_slot_prefix(&self.ctx.namespace, self.job.slot);

        let mut expected_seq = self.wal_begin_seq + 1;
        let iter = self.ctx.storage.wal_iter_from(expected_seq)?;
        for batch in iter {
            if stop() {
                anyhow::bail!(ERR_MIGRATION_CANCELED);
            }
            let batch = batch?;
            if batch.first_seq > end_seq {
                break;
            }
            anyhow::ensure!(
                batch.first_seq == expected_seq,
                "WAL is discrete, some sequences might be lost, expected sequence: {expected_seq}, but got sequence: {}",
                batch.first_seq
            );

            for op in &batch.ops {
                match op {
                    WalOp::LogData { payload } => sender.put_log_data(payload.clone()),
                    WalOp::Put { cf, key, value } if key.starts_with(&slot_prefix) => {
                        sender.put(*cf, key.clone(), value.clone());
                    }
                    WalOp::Delete { cf, key } if key.starts_with(&slot_prefix) => {
                        sender.delete(*cf, key.clone());
                    }
                    _ => {}
                }
                if sender.is_full() {
                    sender.send(&stop)?;
                }
            }

            expected_seq = batch.next_seq();
            if expected_seq > end_seq {
                break;
            }
        }
        anyhow::ensure!(
            expected_seq > end_seq,
            "WAL ended early, expected sequence: {expected_seq}, end sequence: {end_seq}"
        );
        sender.send(&stop)
    }

    // ---- Terminal stages ----

    fn finish_success(&mut self) -> anyhow::Result<()> {
        if self.stopped() {
            anyhow::bail!(ERR_MIGRATION_CANCELED);
        }
        self.set_import_status(IMPORT_SUCCESS)
            .context(ERR_SET_IMPORT_STATUS)?;

        let dst = format!("{}:{}", self.job.dst_ip, self.job.dst_port);
        self.ctx
            .cluster
            .set_slot_migrated(self.job.slot, &dst)
            .with_context(|| format!("failed to set slot {} as migrated to {dst}", self.job.slot))?;

        self.shared.failed_slot.store(-1, Ordering::SeqCst);
        Ok(())
    }

    fn finish_failed(&mut self) {
        self.shared
            .failed_slot
            .store(self.job.slot as i32, Ordering::SeqCst);
        self.shared.forbidden_slot.store(-1, Ordering::SeqCst);

        // Best-effort: tell the destination to roll back. Failure here does
        // not change the job's outcome.
        if let Err(err) = self.set_import_status(IMPORT_FAILED) {
            tracing::warn!(
                slot = self.job.slot,
                error = %err,
                "failed to notify destination of failed migration"
            );
        }
    }

    fn clean(&mut self) {
        tracing::info!(slot = self.job.slot, "clean resources of migrating slot");
        if let Some(snapshot) = self.snapshot.take() {
            snapshot.release();
        }
        self.stream = None;
        self.pipeline.clear();
        self.pipeline_size = 0;
        self.wal_begin_seq = 0;
        self.shared.migrating_slot.store(-1, Ordering::SeqCst);
        self.shared.stop.store(false, Ordering::SeqCst);
    }

    fn resume_blocking(&mut self, result: MigrateResult) {
        if let Some(tx) = self.blocking.take() {
            let _ = tx.send(result);
        }
    }

    // ---- Pipeline / rate gate ----

    fn push_command(&mut self, args: &[Vec<u8>]) {
        self.pipeline.extend_from_slice(&encode_command(args));
        self.pipeline_size += 1;
    }

    fn push_expire(&mut self, user_key: &[u8], at_ms: u64) {
        self.push_command(&[
            b"PEXPIREAT".to_vec(),
            user_key.to_vec(),
            at_ms.to_string().into_bytes(),
        ]);
    }

    /// Flush the pipeline when it is full (or `force`), observing the rate
    /// gate and awaiting exactly one reply per command.
    fn send_pipeline_if_needed(&mut self, force: bool) -> anyhow::Result<()> {
        if self.stopped() {
            anyhow::bail!(ERR_MIGRATION_CANCELED);
        }
        if !force && self.pipeline_size < self.job.max_pipeline_size {
            return Ok(());
        }
        if self.pipeline_size == 0 {
            return Ok(());
        }

        self.apply_migration_speed_limit();

        let expected = self.pipeline_size as usize;
        let shared = self.shared;
        let stream = self
            .stream
            .as_mut()
            .context("destination connection is not open")?;
        stream
            .write_all(&self.pipeline)
            .context("failed to write data to a socket")?;
        read_replies(stream, expected, &|| shared.stopped())
            .context("wrong response from the destination node")?;

        self.last_send_us = now_micros();
        self.pipeline.clear();
        self.pipeline_size = 0;
        Ok(())
    }

    fn apply_migration_speed_limit(&self) {
        if self.job.max_speed == 0 {
            return;
        }
        let per_request_us = pipeline_delay_us(self.job.max_speed, self.job.max_pipeline_size);
        let now = now_micros();
        if self.last_send_us + per_request_us > now {
            let sleep_us = self.last_send_us + per_request_us - now;
            tracing::debug!(sleep_us, "sleep to limit migration speed");
            thread::sleep(Duration::from_micros(sleep_us));
        }
    }
}

/// Minimum wall time per pipeline in microseconds for a commands/sec cap.
fn pipeline_delay_us(max_speed: u64, pipeline_size: u64) -> u64 {
    (1_000_000 * pipeline_size / max_speed).max(1)
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
