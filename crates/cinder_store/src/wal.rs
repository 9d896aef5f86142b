//! Write-ahead log: a totally ordered stream of mutation batches with
//! contiguous sequence numbers.
//!
//! Each record on disk is `[len u32][crc32 u32][payload]`; the payload is
//! `[first_seq u64][op_count u32][ops...]`. Every op in a batch consumes one
//! sequence number, so the next batch starts exactly where the previous one
//! ended; the migration engine relies on that contiguity for gap detection.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::Context;
use crc32fast::Hasher;

use crate::metadata::{read_u32_at, read_u64_at, read_u8_at, RedisType};

const WAL_LOG_FILE: &str = "wal.log";

/// Column families the storage engine splits records across.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnFamily {
    Metadata,
    Subkey,
    ZsetScore,
    Stream,
}

impl ColumnFamily {
    pub fn as_u8(self) -> u8 {
        match self {
            ColumnFamily::Metadata => 0,
            ColumnFamily::Subkey => 1,
            ColumnFamily::ZsetScore => 2,
            ColumnFamily::Stream => 3,
        }
    }

    pub fn from_u8(tag: u8) -> anyhow::Result<Self> {
        Ok(match tag {
            0 => ColumnFamily::Metadata,
            1 => ColumnFamily::Subkey,
            2 => ColumnFamily::ZsetScore,
            3 => ColumnFamily::Stream,
            other => anyhow::bail!("unknown column family tag {other}"),
        })
    }

    pub fn partition_name(self) -> &'static str {
        match self {
            ColumnFamily::Metadata => "metadata",
            ColumnFamily::Subkey => "subkey",
            ColumnFamily::ZsetScore => "zset_score",
            ColumnFamily::Stream => "stream",
        }
    }

    pub const ALL: [ColumnFamily; 4] = [
        ColumnFamily::Metadata,
        ColumnFamily::Subkey,
        ColumnFamily::ZsetScore,
        ColumnFamily::Stream,
    ];
}

/// One logged mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalOp {
    Put {
        cf: ColumnFamily,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: ColumnFamily,
        key: Vec<u8>,
    },
    /// Out-of-band annotation; carries a `WriteBatchLogData` payload.
    LogData { payload: Vec<u8> },
}

/// A decoded WAL batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalBatch {
    pub first_seq: u64,
    pub ops: Vec<WalOp>,
}

impl WalBatch {
    /// Sequence number right after this batch.
    pub fn next_seq(&self) -> u64 {
        self.first_seq + self.ops.len() as u64
    }
}

/// Command annotation written at the head of every storage batch. The WAL
/// streamer needs it to translate raw mutations back into commands (e.g. a
/// list sub-key put becomes `RPUSH` or `LPUSH` depending on the origin).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteBatchLogData {
    pub redis_type: RedisType,
    pub args: Vec<Vec<u8>>,
}

impl WriteBatchLogData {
    pub fn new(redis_type: RedisType) -> Self {
        Self {
            redis_type,
            args: Vec::new(),
        }
    }

    pub fn with_args(redis_type: RedisType, args: Vec<Vec<u8>>) -> Self {
        Self { redis_type, args }
    }

    pub fn first_arg(&self) -> Option<&[u8]> {
        self.args.first().map(|a| a.as_slice())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.redis_type.as_u8());
        out.extend_from_slice(&(self.args.len() as u32).to_be_bytes());
        for arg in &self.args {
            out.extend_from_slice(&(arg.len() as u32).to_be_bytes());
            out.extend_from_slice(arg);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        let redis_type = RedisType::from_u8(read_u8_at(bytes, &mut offset)?)?;
        let argc = read_u32_at(bytes, &mut offset)? as usize;
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            let len = read_u32_at(bytes, &mut offset)? as usize;
            anyhow::ensure!(offset + len <= bytes.len(), "log data short arg");
            args.push(bytes[offset..offset + len].to_vec());
            offset += len;
        }
        Ok(Self { redis_type, args })
    }
}

/// Encode a batch's ops without the sequence header (shared with the raw-KV
/// wire frames).
pub fn encode_ops(ops: &[WalOp]) -> Vec<u8> {
    let mut out = Vec::new();
    for op in ops {
        match op {
            WalOp::Put { cf, key, value } => {
                out.push(0);
                out.push(cf.as_u8());
                out.extend_from_slice(&(key.len() as u32).to_be_bytes());
                out.extend_from_slice(key);
                out.extend_from_slice(&(value.len() as u32).to_be_bytes());
                out.extend_from_slice(value);
            }
            WalOp::Delete { cf, key } => {
                out.push(1);
                out.push(cf.as_u8());
                out.extend_from_slice(&(key.len() as u32).to_be_bytes());
                out.extend_from_slice(key);
            }
            WalOp::LogData { payload } => {
                out.push(2);
                out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                out.extend_from_slice(payload);
            }
        }
    }
    out
}

pub fn decode_ops(bytes: &[u8]) -> anyhow::Result<Vec<WalOp>> {
    let mut offset = 0usize;
    let mut ops = Vec::new();
    while offset < bytes.len() {
        let tag = read_u8_at(bytes, &mut offset)?;
        match tag {
            0 => {
                let cf = ColumnFamily::from_u8(read_u8_at(bytes, &mut offset)?)?;
                let key = read_bytes_at(bytes, &mut offset)?;
                let value = read_bytes_at(bytes, &mut offset)?;
                ops.push(WalOp::Put { cf, key, value });
            }
            1 => {
                let cf = ColumnFamily::from_u8(read_u8_at(bytes, &mut offset)?)?;
                let key = read_bytes_at(bytes, &mut offset)?;
                ops.push(WalOp::Delete { cf, key });
            }
            2 => {
                let payload = read_bytes_at(bytes, &mut offset)?;
                ops.push(WalOp::LogData { payload });
            }
            other => anyhow::bail!("unknown wal op tag {other}"),
        }
    }
    Ok(ops)
}

fn read_bytes_at(data: &[u8], offset: &mut usize) -> anyhow::Result<Vec<u8>> {
    let len = read_u32_at(data, offset)? as usize;
    anyhow::ensure!(*offset + len <= data.len(), "wal op short payload");
    let out = data[*offset..*offset + len].to_vec();
    *offset += len;
    Ok(out)
}

#[derive(Clone, Copy, Debug)]
enum SyncMode {
    None,
    Data,
    All,
}

/// Append-only WAL. Appends are ordered by the storage commit lock; the
/// internal mutex only protects the file handle.
pub struct Wal {
    log_path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    next_seq: AtomicU64,
    sync_mode: SyncMode,
}

impl Wal {
    pub fn open_dir(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("create wal dir")?;
        let log_path = dir.join(WAL_LOG_FILE);

        // Recover the next sequence from whatever is already on disk.
        let mut next_seq = 1u64;
        for batch in read_batches(&log_path, 0)? {
            let batch = batch?;
            next_seq = batch.next_seq();
        }

        let file = open_log_for_append(&log_path).context("open wal log")?;
        let sync_mode = parse_sync_mode(std::env::var("CINDER_WAL_SYNC_MODE").ok().as_deref());

        Ok(Self {
            log_path,
            writer: Mutex::new(BufWriter::new(file)),
            next_seq: AtomicU64::new(next_seq),
            sync_mode,
        })
    }

    /// Sequence of the most recent op, 0 when the log is empty.
    pub fn latest_sequence(&self) -> u64 {
        self.next_seq.load(Ordering::Acquire) - 1
    }

    /// Append one batch and return its first sequence number.
    pub fn append(&self, ops: &[WalOp]) -> anyhow::Result<u64> {
        anyhow::ensure!(!ops.is_empty(), "empty wal batch");
        let count = ops.len() as u64;
        let first_seq = self.next_seq.load(Ordering::Acquire);

        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&first_seq.to_be_bytes());
        payload.extend_from_slice(&(ops.len() as u32).to_be_bytes());
        payload.extend_from_slice(&encode_ops(ops));

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("wal writer poisoned"))?;
        write_record(&mut *writer, &payload)?;
        writer.flush()?;
        sync_file(writer.get_ref(), self.sync_mode)?;

        // Publish only after the record is flushed so readers never observe
        // a sequence the log does not contain.
        self.next_seq.store(first_seq + count, Ordering::Release);
        Ok(first_seq)
    }

    /// Iterate batches containing sequences `>= start_seq`.
    pub fn iter_from(&self, start_seq: u64) -> anyhow::Result<WalIter> {
        let file = match File::open(&self.log_path) {
            Ok(file) => Some(file),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };
        Ok(WalIter {
            reader: file.map(BufReader::new),
            start_seq,
        })
    }
}

pub struct WalIter {
    reader: Option<BufReader<File>>,
    start_seq: u64,
}

impl Iterator for WalIter {
    type Item = anyhow::Result<WalBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        loop {
            match read_one_record(reader) {
                Ok(Some(payload)) => match decode_batch(&payload) {
                    Ok(batch) => {
                        if batch.next_seq() <= self.start_seq {
                            continue;
                        }
                        return Some(Ok(batch));
                    }
                    Err(err) => return Some(Err(err)),
                },
                Ok(None) => return None,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

fn decode_batch(payload: &[u8]) -> anyhow::Result<WalBatch> {
    let mut offset = 0usize;
    let first_seq = read_u64_at(payload, &mut offset)?;
    let count = read_u32_at(payload, &mut offset)? as usize;
    let ops = decode_ops(&payload[offset..])?;
    anyhow::ensure!(
        ops.len() == count,
        "wal batch op count mismatch: header {count}, decoded {}",
        ops.len()
    );
    Ok(WalBatch { first_seq, ops })
}

fn read_batches(path: &Path, start_seq: u64) -> anyhow::Result<WalIter> {
    let file = match File::open(path) {
        Ok(file) => Some(file),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => return Err(err.into()),
    };
    Ok(WalIter {
        reader: file.map(BufReader::new),
        start_seq,
    })
}

fn read_one_record(reader: &mut BufReader<File>) -> anyhow::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut crc_buf = [0u8; 4];
    reader.read_exact(&mut crc_buf)?;
    let expected_crc = u32::from_be_bytes(crc_buf);
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    anyhow::ensure!(hasher.finalize() == expected_crc, "wal checksum mismatch");
    Ok(Some(payload))
}

fn write_record(writer: &mut impl Write, payload: &[u8]) -> std::io::Result<()> {
    let len = payload.len() as u32;
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let checksum = hasher.finalize();
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&checksum.to_be_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

fn open_log_for_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn sync_file(file: &File, mode: SyncMode) -> std::io::Result<()> {
    match mode {
        SyncMode::None => Ok(()),
        SyncMode::Data => file.sync_data(),
        SyncMode::All => file.sync_all(),
    }
}

fn parse_sync_mode(value: Option<&str>) -> SyncMode {
    match value.map(|v| v.to_ascii_lowercase()) {
        Some(v) if v == "data" => SyncMode::Data,
        Some(v) if v == "all" => SyncMode::All,
        _ => SyncMode::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ops(tag: u8) -> Vec<WalOp> {
        vec![
            WalOp::LogData {
                payload: WriteBatchLogData::with_args(RedisType::Hash, vec![b"hset".to_vec()])
                    .encode(),
            },
            WalOp::Put {
                cf: ColumnFamily::Subkey,
                key: vec![tag, 1, 2],
                value: vec![9, 9],
            },
            WalOp::Delete {
                cf: ColumnFamily::Metadata,
                key: vec![tag],
            },
        ]
    }

    #[test]
    fn ops_codec_round_trips() {
        let ops = sample_ops(7);
        assert_eq!(decode_ops(&encode_ops(&ops)).unwrap(), ops);
    }

    #[test]
    fn log_data_codec_round_trips() {
        let data = WriteBatchLogData::with_args(
            RedisType::List,
            vec![b"rpush".to_vec(), b"3".to_vec()],
        );
        assert_eq!(WriteBatchLogData::decode(&data.encode()).unwrap(), data);
    }

    #[test]
    fn append_assigns_contiguous_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open_dir(dir.path()).unwrap();
        assert_eq!(wal.latest_sequence(), 0);

        let first = wal.append(&sample_ops(1)).unwrap();
        assert_eq!(first, 1);
        let second = wal.append(&sample_ops(2)).unwrap();
        assert_eq!(second, 4);
        assert_eq!(wal.latest_sequence(), 6);
    }

    #[test]
    fn iter_from_skips_batches_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open_dir(dir.path()).unwrap();
        wal.append(&sample_ops(1)).unwrap();
        wal.append(&sample_ops(2)).unwrap();
        wal.append(&sample_ops(3)).unwrap();

        let batches: Vec<WalBatch> = wal
            .iter_from(4)
            .unwrap()
            .collect::<anyhow::Result<_>>()
            .unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].first_seq, 4);
        assert_eq!(batches[1].first_seq, 7);
    }

    #[test]
    fn reopen_recovers_next_sequence() {
        let dir = tempfile::tempdir().unwrap();
        {
            let wal = Wal::open_dir(dir.path()).unwrap();
            wal.append(&sample_ops(1)).unwrap();
            wal.append(&sample_ops(2)).unwrap();
        }
        let wal = Wal::open_dir(dir.path()).unwrap();
        assert_eq!(wal.latest_sequence(), 6);
        assert_eq!(wal.append(&sample_ops(3)).unwrap(), 7);
    }

    #[test]
    fn corrupted_record_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open_dir(dir.path()).unwrap();
        wal.append(&sample_ops(1)).unwrap();
        drop(wal);

        let path = dir.path().join(WAL_LOG_FILE);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let wal_err = Wal::open_dir(dir.path());
        assert!(wal_err.is_err());
    }
}
