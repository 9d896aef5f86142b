//! Redis data model over the storage engine.
//!
//! Every write produces one storage batch that leads with a
//! `WriteBatchLogData` header naming the originating command, followed by the
//! sub-record and metadata mutations. The WAL streamer depends on that
//! discipline to translate raw batches back into commands.

use std::sync::Arc;

use crate::metadata::{
    compose_internal_key, compose_subkey_prefix, encode_score, encode_stream_entry,
    encode_string_record, decode_score, decode_stream_entry, ListMetadata, Metadata,
    ParsedInternalKey, RedisType, StreamEntryId, StreamMetadata, string_payload,
};
use crate::slot::{compose_metadata_key, compose_slot_prefix, key_slot, SlotId};
use crate::storage::{unix_time_ms, Storage};
use crate::wal::{ColumnFamily, WalOp, WriteBatchLogData};

pub const DEFAULT_NAMESPACE: &[u8] = b"__default";

/// Bitmap fragment granularity in bytes; sub-keys are the decimal byte
/// offset of the fragment start.
pub const BITMAP_FRAGMENT_BYTES: u64 = 1024;

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

#[derive(Clone)]
pub struct Db {
    storage: Arc<Storage>,
    namespace: Vec<u8>,
}

impl Db {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            namespace: DEFAULT_NAMESPACE.to_vec(),
        }
    }

    pub fn namespace(&self) -> &[u8] {
        &self.namespace
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    fn metadata_key(&self, key: &[u8]) -> (SlotId, Vec<u8>) {
        let slot = key_slot(key);
        (slot, compose_metadata_key(&self.namespace, slot, key))
    }

    fn internal_key(&self, slot: SlotId, key: &[u8], version: u64, sub_key: &[u8]) -> Vec<u8> {
        compose_internal_key(&self.namespace, slot, key, version, sub_key)
    }

    /// Raw metadata record, ignoring expiry.
    fn load_raw(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let (_, mkey) = self.metadata_key(key);
        self.storage.get(ColumnFamily::Metadata, &mkey)
    }

    /// Metadata record treated as absent when expired; `WRONGTYPE` when the
    /// resident type differs from `expected`.
    fn load_live(
        &self,
        key: &[u8],
        expected: Option<RedisType>,
    ) -> anyhow::Result<Option<(Metadata, Vec<u8>)>> {
        let Some(raw) = self.load_raw(key)? else {
            return Ok(None);
        };
        let meta = Metadata::decode(&raw)?;
        if meta.expired_at(unix_time_ms()) {
            return Ok(None);
        }
        if let Some(expected) = expected {
            anyhow::ensure!(meta.redis_type == expected, WRONGTYPE);
        }
        Ok(Some((meta, raw)))
    }

    fn log_data(&self, redis_type: RedisType, args: Vec<Vec<u8>>) -> WalOp {
        WalOp::LogData {
            payload: WriteBatchLogData::with_args(redis_type, args).encode(),
        }
    }

    // ---- strings ----

    pub fn set_string(&self, key: &[u8], value: &[u8], expire_ms: u64) -> anyhow::Result<()> {
        let (_, mkey) = self.metadata_key(key);
        let ops = vec![
            self.log_data(RedisType::String, vec![b"set".to_vec()]),
            WalOp::Put {
                cf: ColumnFamily::Metadata,
                key: mkey,
                value: encode_string_record(expire_ms, value),
            },
        ];
        self.storage.write_batch(ops)?;
        Ok(())
    }

    pub fn get_string(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        match self.load_live(key, Some(RedisType::String))? {
            Some((_, raw)) => Ok(Some(string_payload(&raw)?.to_vec())),
            None => Ok(None),
        }
    }

    // ---- generic ----

    pub fn exists(&self, key: &[u8]) -> anyhow::Result<bool> {
        Ok(self.load_live(key, None)?.is_some())
    }

    pub fn del(&self, key: &[u8]) -> anyhow::Result<bool> {
        let Some((meta, _)) = self.load_live(key, None)? else {
            return Ok(false);
        };
        let (_, mkey) = self.metadata_key(key);
        let ops = vec![
            self.log_data(meta.redis_type, vec![b"del".to_vec()]),
            WalOp::Delete {
                cf: ColumnFamily::Metadata,
                key: mkey,
            },
        ];
        self.storage.write_batch(ops)?;
        Ok(true)
    }

    pub fn pexpireat(&self, key: &[u8], at_ms: u64) -> anyhow::Result<bool> {
        let Some((meta, raw)) = self.load_live(key, None)? else {
            return Ok(false);
        };
        let record = match meta.redis_type {
            RedisType::String => encode_string_record(at_ms, string_payload(&raw)?),
            RedisType::List => {
                let mut list = ListMetadata::decode(&raw)?;
                list.meta.expire_ms = at_ms;
                list.encode()
            }
            RedisType::Stream => {
                let mut stream = StreamMetadata::decode(&raw)?;
                stream.meta.expire_ms = at_ms;
                stream.encode()
            }
            _ => {
                let mut meta = meta;
                meta.expire_ms = at_ms;
                meta.encode()
            }
        };
        let (_, mkey) = self.metadata_key(key);
        let ops = vec![
            self.log_data(
                meta.redis_type,
                vec![b"pexpireat".to_vec(), at_ms.to_string().into_bytes()],
            ),
            WalOp::Put {
                cf: ColumnFamily::Metadata,
                key: mkey,
                value: record,
            },
        ];
        self.storage.write_batch(ops)?;
        Ok(true)
    }

    /// Milliseconds until expiry: -2 when absent, -1 when persistent.
    pub fn pttl(&self, key: &[u8]) -> anyhow::Result<i64> {
        let Some((meta, _)) = self.load_live(key, None)? else {
            return Ok(-2);
        };
        if meta.expire_ms == 0 {
            return Ok(-1);
        }
        Ok(meta.expire_ms.saturating_sub(unix_time_ms()) as i64)
    }

    // ---- lists ----

    pub fn push_list(
        &self,
        key: &[u8],
        values: &[Vec<u8>],
        left: bool,
    ) -> anyhow::Result<u64> {
        anyhow::ensure!(!values.is_empty(), "ERR wrong number of arguments");
        let (slot, mkey) = self.metadata_key(key);
        let mut list = match self.load_live(key, Some(RedisType::List))? {
            Some((_, raw)) => ListMetadata::decode(&raw)?,
            None => ListMetadata::new(self.storage.generate_version()),
        };

        let cmd: &[u8] = if left { b"lpush" } else { b"rpush" };
        let mut ops = vec![self.log_data(RedisType::List, vec![cmd.to_vec()])];
        for value in values {
            let index = if left {
                list.head -= 1;
                list.head
            } else {
                let index = list.tail;
                list.tail += 1;
                index
            };
            ops.push(WalOp::Put {
                cf: ColumnFamily::Subkey,
                key: self.internal_key(slot, key, list.meta.version, &index.to_be_bytes()),
                value: value.clone(),
            });
        }
        list.meta.size = (list.tail - list.head) as u32;
        ops.push(WalOp::Put {
            cf: ColumnFamily::Metadata,
            key: mkey,
            value: list.encode(),
        });
        self.storage.write_batch(ops)?;
        Ok(u64::from(list.meta.size))
    }

    pub fn pop_list(&self, key: &[u8], left: bool) -> anyhow::Result<Option<Vec<u8>>> {
        let Some((_, raw)) = self.load_live(key, Some(RedisType::List))? else {
            return Ok(None);
        };
        let mut list = ListMetadata::decode(&raw)?;
        if list.meta.size == 0 {
            return Ok(None);
        }
        let (slot, mkey) = self.metadata_key(key);
        let index = if left {
            let index = list.head;
            list.head += 1;
            index
        } else {
            list.tail -= 1;
            list.tail
        };
        let sub = self.internal_key(slot, key, list.meta.version, &index.to_be_bytes());
        let value = self
            .storage
            .get(ColumnFamily::Subkey, &sub)?
            .unwrap_or_default();
        list.meta.size = (list.tail - list.head) as u32;
        let cmd: &[u8] = if left { b"lpop" } else { b"rpop" };
        let ops = vec![
            self.log_data(RedisType::List, vec![cmd.to_vec()]),
            WalOp::Delete {
                cf: ColumnFamily::Subkey,
                key: sub,
            },
            WalOp::Put {
                cf: ColumnFamily::Metadata,
                key: mkey,
                value: list.encode(),
            },
        ];
        self.storage.write_batch(ops)?;
        Ok(Some(value))
    }

    pub fn lrange(&self, key: &[u8], start: i64, stop: i64) -> anyhow::Result<Vec<Vec<u8>>> {
        let Some((_, raw)) = self.load_live(key, Some(RedisType::List))? else {
            return Ok(Vec::new());
        };
        let list = ListMetadata::decode(&raw)?;
        let len = (list.tail - list.head) as i64;
        let (start, stop) = normalize_range(start, stop, len);
        if start > stop {
            return Ok(Vec::new());
        }
        let (slot, _) = self.metadata_key(key);
        let mut out = Vec::with_capacity((stop - start + 1) as usize);
        for offset in start..=stop {
            let index = list.head + offset as u64;
            let sub = self.internal_key(slot, key, list.meta.version, &index.to_be_bytes());
            if let Some(value) = self.storage.get(ColumnFamily::Subkey, &sub)? {
                out.push(value);
            }
        }
        Ok(out)
    }

    pub fn llen(&self, key: &[u8]) -> anyhow::Result<u64> {
        match self.load_live(key, Some(RedisType::List))? {
            Some((meta, _)) => Ok(u64::from(meta.size)),
            None => Ok(0),
        }
    }

    // ---- hashes ----

    pub fn hset(&self, key: &[u8], pairs: &[(Vec<u8>, Vec<u8>)]) -> anyhow::Result<u64> {
        let (slot, mkey) = self.metadata_key(key);
        let mut meta = match self.load_live(key, Some(RedisType::Hash))? {
            Some((meta, _)) => meta,
            None => Metadata::new(RedisType::Hash, self.storage.generate_version()),
        };
        let mut added = 0u64;
        let mut ops = vec![self.log_data(RedisType::Hash, vec![b"hset".to_vec()])];
        for (field, value) in pairs {
            let sub = self.internal_key(slot, key, meta.version, field);
            if self.storage.get(ColumnFamily::Subkey, &sub)?.is_none() {
                added += 1;
            }
            ops.push(WalOp::Put {
                cf: ColumnFamily::Subkey,
                key: sub,
                value: value.clone(),
            });
        }
        meta.size += added as u32;
        ops.push(WalOp::Put {
            cf: ColumnFamily::Metadata,
            key: mkey,
            value: meta.encode(),
        });
        self.storage.write_batch(ops)?;
        Ok(added)
    }

    pub fn hdel(&self, key: &[u8], fields: &[Vec<u8>]) -> anyhow::Result<u64> {
        let Some((mut meta, _)) = self.load_live(key, Some(RedisType::Hash))? else {
            return Ok(0);
        };
        let (slot, mkey) = self.metadata_key(key);
        let mut removed = 0u64;
        let mut ops = vec![self.log_data(RedisType::Hash, vec![b"hdel".to_vec()])];
        for field in fields {
            let sub = self.internal_key(slot, key, meta.version, field);
            if self.storage.get(ColumnFamily::Subkey, &sub)?.is_some() {
                removed += 1;
                ops.push(WalOp::Delete {
                    cf: ColumnFamily::Subkey,
                    key: sub,
                });
            }
        }
        if removed == 0 {
            return Ok(0);
        }
        meta.size -= removed as u32;
        ops.push(WalOp::Put {
            cf: ColumnFamily::Metadata,
            key: mkey,
            value: meta.encode(),
        });
        self.storage.write_batch(ops)?;
        Ok(removed)
    }

    pub fn hgetall(&self, key: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let Some((meta, _)) = self.load_live(key, Some(RedisType::Hash))? else {
            return Ok(Vec::new());
        };
        self.scan_subkeys(key, meta.version, ColumnFamily::Subkey)
    }

    // ---- sets ----

    pub fn sadd(&self, key: &[u8], members: &[Vec<u8>]) -> anyhow::Result<u64> {
        let (slot, mkey) = self.metadata_key(key);
        let mut meta = match self.load_live(key, Some(RedisType::Set))? {
            Some((meta, _)) => meta,
            None => Metadata::new(RedisType::Set, self.storage.generate_version()),
        };
        let mut added = 0u64;
        let mut ops = vec![self.log_data(RedisType::Set, vec![b"sadd".to_vec()])];
        for member in members {
            let sub = self.internal_key(slot, key, meta.version, member);
            if self.storage.get(ColumnFamily::Subkey, &sub)?.is_none() {
                added += 1;
                ops.push(WalOp::Put {
                    cf: ColumnFamily::Subkey,
                    key: sub,
                    value: Vec::new(),
                });
            }
        }
        if added == 0 {
            return Ok(0);
        }
        meta.size += added as u32;
        ops.push(WalOp::Put {
            cf: ColumnFamily::Metadata,
            key: mkey,
            value: meta.encode(),
        });
        self.storage.write_batch(ops)?;
        Ok(added)
    }

    pub fn srem(&self, key: &[u8], members: &[Vec<u8>]) -> anyhow::Result<u64> {
        let Some((mut meta, _)) = self.load_live(key, Some(RedisType::Set))? else {
            return Ok(0);
        };
        let (slot, mkey) = self.metadata_key(key);
        let mut removed = 0u64;
        let mut ops = vec![self.log_data(RedisType::Set, vec![b"srem".to_vec()])];
        for member in members {
            let sub = self.internal_key(slot, key, meta.version, member);
            if self.storage.get(ColumnFamily::Subkey, &sub)?.is_some() {
                removed += 1;
                ops.push(WalOp::Delete {
                    cf: ColumnFamily::Subkey,
                    key: sub,
                });
            }
        }
        if removed == 0 {
            return Ok(0);
        }
        meta.size -= removed as u32;
        ops.push(WalOp::Put {
            cf: ColumnFamily::Metadata,
            key: mkey,
            value: meta.encode(),
        });
        self.storage.write_batch(ops)?;
        Ok(removed)
    }

    pub fn smembers(&self, key: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
        let Some((meta, _)) = self.load_live(key, Some(RedisType::Set))? else {
            return Ok(Vec::new());
        };
        Ok(self
            .scan_subkeys(key, meta.version, ColumnFamily::Subkey)?
            .into_iter()
            .map(|(member, _)| member)
            .collect())
    }

    // ---- sorted sets ----

    pub fn zadd(&self, key: &[u8], pairs: &[(f64, Vec<u8>)]) -> anyhow::Result<u64> {
        let (slot, mkey) = self.metadata_key(key);
        let mut meta = match self.load_live(key, Some(RedisType::ZSet))? {
            Some((meta, _)) => meta,
            None => Metadata::new(RedisType::ZSet, self.storage.generate_version()),
        };
        let mut added = 0u64;
        let mut ops = vec![self.log_data(RedisType::ZSet, vec![b"zadd".to_vec()])];
        for (score, member) in pairs {
            let member_key = self.internal_key(slot, key, meta.version, member);
            match self.storage.get(ColumnFamily::Subkey, &member_key)? {
                Some(existing) => {
                    let old_score = decode_score(&existing)?;
                    if old_score == *score {
                        continue;
                    }
                    ops.push(WalOp::Delete {
                        cf: ColumnFamily::ZsetScore,
                        key: self.score_index_key(slot, key, meta.version, old_score, member),
                    });
                }
                None => added += 1,
            }
            ops.push(WalOp::Put {
                cf: ColumnFamily::Subkey,
                key: member_key,
                value: encode_score(*score).to_vec(),
            });
            ops.push(WalOp::Put {
                cf: ColumnFamily::ZsetScore,
                key: self.score_index_key(slot, key, meta.version, *score, member),
                value: Vec::new(),
            });
        }
        if ops.len() == 1 {
            return Ok(0);
        }
        meta.size += added as u32;
        ops.push(WalOp::Put {
            cf: ColumnFamily::Metadata,
            key: mkey,
            value: meta.encode(),
        });
        self.storage.write_batch(ops)?;
        Ok(added)
    }

    pub fn zrem(&self, key: &[u8], members: &[Vec<u8>]) -> anyhow::Result<u64> {
        let Some((mut meta, _)) = self.load_live(key, Some(RedisType::ZSet))? else {
            return Ok(0);
        };
        let (slot, mkey) = self.metadata_key(key);
        let mut removed = 0u64;
        let mut ops = vec![self.log_data(RedisType::ZSet, vec![b"zrem".to_vec()])];
        for member in members {
            let member_key = self.internal_key(slot, key, meta.version, member);
            let Some(existing) = self.storage.get(ColumnFamily::Subkey, &member_key)? else {
                continue;
            };
            let score = decode_score(&existing)?;
            removed += 1;
            ops.push(WalOp::Delete {
                cf: ColumnFamily::Subkey,
                key: member_key,
            });
            ops.push(WalOp::Delete {
                cf: ColumnFamily::ZsetScore,
                key: self.score_index_key(slot, key, meta.version, score, member),
            });
        }
        if removed == 0 {
            return Ok(0);
        }
        meta.size -= removed as u32;
        ops.push(WalOp::Put {
            cf: ColumnFamily::Metadata,
            key: mkey,
            value: meta.encode(),
        });
        self.storage.write_batch(ops)?;
        Ok(removed)
    }

    pub fn zscore(&self, key: &[u8], member: &[u8]) -> anyhow::Result<Option<f64>> {
        let Some((meta, _)) = self.load_live(key, Some(RedisType::ZSet))? else {
            return Ok(None);
        };
        let (slot, _) = self.metadata_key(key);
        let member_key = self.internal_key(slot, key, meta.version, member);
        match self.storage.get(ColumnFamily::Subkey, &member_key)? {
            Some(value) => Ok(Some(decode_score(&value)?)),
            None => Ok(None),
        }
    }

    fn score_index_key(
        &self,
        slot: SlotId,
        key: &[u8],
        version: u64,
        score: f64,
        member: &[u8],
    ) -> Vec<u8> {
        let mut sub = Vec::with_capacity(8 + member.len());
        sub.extend_from_slice(&encode_score(score));
        sub.extend_from_slice(member);
        self.internal_key(slot, key, version, &sub)
    }

    // ---- sorted integers ----

    pub fn siadd(&self, key: &[u8], ids: &[u64]) -> anyhow::Result<u64> {
        let (slot, mkey) = self.metadata_key(key);
        let mut meta = match self.load_live(key, Some(RedisType::SortedInt))? {
            Some((meta, _)) => meta,
            None => Metadata::new(RedisType::SortedInt, self.storage.generate_version()),
        };
        let mut added = 0u64;
        let mut ops = vec![self.log_data(RedisType::SortedInt, vec![b"siadd".to_vec()])];
        for id in ids {
            let sub = self.internal_key(slot, key, meta.version, &id.to_be_bytes());
            if self.storage.get(ColumnFamily::Subkey, &sub)?.is_none() {
                added += 1;
                ops.push(WalOp::Put {
                    cf: ColumnFamily::Subkey,
                    key: sub,
                    value: Vec::new(),
                });
            }
        }
        if added == 0 {
            return Ok(0);
        }
        meta.size += added as u32;
        ops.push(WalOp::Put {
            cf: ColumnFamily::Metadata,
            key: mkey,
            value: meta.encode(),
        });
        self.storage.write_batch(ops)?;
        Ok(added)
    }

    pub fn sirem(&self, key: &[u8], ids: &[u64]) -> anyhow::Result<u64> {
        let Some((mut meta, _)) = self.load_live(key, Some(RedisType::SortedInt))? else {
            return Ok(0);
        };
        let (slot, mkey) = self.metadata_key(key);
        let mut removed = 0u64;
        let mut ops = vec![self.log_data(RedisType::SortedInt, vec![b"sirem".to_vec()])];
        for id in ids {
            let sub = self.internal_key(slot, key, meta.version, &id.to_be_bytes());
            if self.storage.get(ColumnFamily::Subkey, &sub)?.is_some() {
                removed += 1;
                ops.push(WalOp::Delete {
                    cf: ColumnFamily::Subkey,
                    key: sub,
                });
            }
        }
        if removed == 0 {
            return Ok(0);
        }
        meta.size -= removed as u32;
        ops.push(WalOp::Put {
            cf: ColumnFamily::Metadata,
            key: mkey,
            value: meta.encode(),
        });
        self.storage.write_batch(ops)?;
        Ok(removed)
    }

    pub fn simembers(&self, key: &[u8]) -> anyhow::Result<Vec<u64>> {
        let Some((meta, _)) = self.load_live(key, Some(RedisType::SortedInt))? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for (sub_key, _) in self.scan_subkeys(key, meta.version, ColumnFamily::Subkey)? {
            anyhow::ensure!(sub_key.len() == 8, "corrupt sortedint sub-key");
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&sub_key);
            out.push(u64::from_be_bytes(buf));
        }
        Ok(out)
    }

    // ---- bitmaps ----

    pub fn setbit(&self, key: &[u8], offset: u64, value: bool) -> anyhow::Result<bool> {
        let (slot, mkey) = self.metadata_key(key);
        let mut meta = match self.load_live(key, Some(RedisType::Bitmap))? {
            Some((meta, _)) => meta,
            None => Metadata::new(RedisType::Bitmap, self.storage.generate_version()),
        };
        let byte_index = offset / 8;
        let fragment_start = byte_index - (byte_index % BITMAP_FRAGMENT_BYTES);
        let sub_key = fragment_start.to_string().into_bytes();
        let ik = self.internal_key(slot, key, meta.version, &sub_key);

        let mut fragment = self
            .storage
            .get(ColumnFamily::Subkey, &ik)?
            .unwrap_or_default();
        let index_in_fragment = (byte_index - fragment_start) as usize;
        if fragment.len() <= index_in_fragment {
            fragment.resize(index_in_fragment + 1, 0);
        }
        let mask = 1u8 << (offset % 8);
        let old = fragment[index_in_fragment] & mask != 0;
        if value {
            fragment[index_in_fragment] |= mask;
        } else {
            fragment[index_in_fragment] &= !mask;
        }

        meta.size = meta.size.max((byte_index + 1) as u32);
        let ops = vec![
            self.log_data(
                RedisType::Bitmap,
                vec![b"setbit".to_vec(), offset.to_string().into_bytes()],
            ),
            WalOp::Put {
                cf: ColumnFamily::Subkey,
                key: ik,
                value: fragment,
            },
            WalOp::Put {
                cf: ColumnFamily::Metadata,
                key: mkey,
                value: meta.encode(),
            },
        ];
        self.storage.write_batch(ops)?;
        Ok(old)
    }

    pub fn getbit(&self, key: &[u8], offset: u64) -> anyhow::Result<bool> {
        let Some((meta, _)) = self.load_live(key, Some(RedisType::Bitmap))? else {
            return Ok(false);
        };
        let (slot, _) = self.metadata_key(key);
        let byte_index = offset / 8;
        let fragment_start = byte_index - (byte_index % BITMAP_FRAGMENT_BYTES);
        let ik = self.internal_key(
            slot,
            key,
            meta.version,
            fragment_start.to_string().as_bytes(),
        );
        let Some(fragment) = self.storage.get(ColumnFamily::Subkey, &ik)? else {
            return Ok(false);
        };
        let index_in_fragment = (byte_index - fragment_start) as usize;
        if fragment.len() <= index_in_fragment {
            return Ok(false);
        }
        Ok(fragment[index_in_fragment] & (1 << (offset % 8)) != 0)
    }

    // ---- streams ----

    pub fn xadd(
        &self,
        key: &[u8],
        id: StreamEntryId,
        pairs: &[(Vec<u8>, Vec<u8>)],
    ) -> anyhow::Result<StreamEntryId> {
        anyhow::ensure!(!pairs.is_empty(), "ERR wrong number of arguments for 'xadd'");
        let (slot, mkey) = self.metadata_key(key);
        let mut stream = match self.load_live(key, Some(RedisType::Stream))? {
            Some((_, raw)) => StreamMetadata::decode(&raw)?,
            None => StreamMetadata::new(self.storage.generate_version()),
        };
        anyhow::ensure!(
            stream.entries_added == 0 || id > stream.last_generated_id,
            "ERR The ID specified in XADD is equal or smaller than the target stream top item"
        );
        stream.last_generated_id = id;
        stream.entries_added += 1;
        stream.meta.size += 1;

        let ops = vec![
            self.log_data(RedisType::Stream, vec![b"xadd".to_vec()]),
            WalOp::Put {
                cf: ColumnFamily::Stream,
                key: self.internal_key(slot, key, stream.meta.version, &id.encode()),
                value: encode_stream_entry(pairs),
            },
            WalOp::Put {
                cf: ColumnFamily::Metadata,
                key: mkey,
                value: stream.encode(),
            },
        ];
        self.storage.write_batch(ops)?;
        Ok(id)
    }

    pub fn xsetid(
        &self,
        key: &[u8],
        last_id: StreamEntryId,
        entries_added: Option<u64>,
        max_deleted: Option<StreamEntryId>,
    ) -> anyhow::Result<()> {
        let (_, mkey) = self.metadata_key(key);
        let mut stream = match self.load_live(key, Some(RedisType::Stream))? {
            Some((_, raw)) => StreamMetadata::decode(&raw)?,
            None => StreamMetadata::new(self.storage.generate_version()),
        };
        stream.last_generated_id = last_id;
        if let Some(entries_added) = entries_added {
            stream.entries_added = entries_added;
        }
        if let Some(max_deleted) = max_deleted {
            stream.max_deleted_entry_id = max_deleted;
        }
        let ops = vec![
            self.log_data(RedisType::Stream, vec![b"xsetid".to_vec()]),
            WalOp::Put {
                cf: ColumnFamily::Metadata,
                key: mkey,
                value: stream.encode(),
            },
        ];
        self.storage.write_batch(ops)?;
        Ok(())
    }

    pub fn xrange(
        &self,
        key: &[u8],
    ) -> anyhow::Result<Vec<(StreamEntryId, Vec<(Vec<u8>, Vec<u8>)>)>> {
        let Some((_, raw)) = self.load_live(key, Some(RedisType::Stream))? else {
            return Ok(Vec::new());
        };
        let stream = StreamMetadata::decode(&raw)?;
        let mut out = Vec::new();
        for (sub_key, value) in self.scan_subkeys(key, stream.meta.version, ColumnFamily::Stream)? {
            let id = StreamEntryId::decode(&sub_key)?;
            out.push((id, decode_stream_entry(&value)?));
        }
        Ok(out)
    }

    pub fn stream_info(&self, key: &[u8]) -> anyhow::Result<Option<StreamMetadata>> {
        match self.load_live(key, Some(RedisType::Stream))? {
            Some((_, raw)) => Ok(Some(StreamMetadata::decode(&raw)?)),
            None => Ok(None),
        }
    }

    // ---- slot maintenance ----

    /// Drop every record of a slot (used by the import side before and after
    /// a failed transfer). Returns the number of keys removed.
    pub fn clear_slot(&self, slot: SlotId) -> anyhow::Result<u64> {
        let prefix = compose_slot_prefix(&self.namespace, slot);
        let entries: Vec<(Vec<u8>, Vec<u8>)> = self
            .storage
            .prefix(ColumnFamily::Metadata, prefix)
            .collect::<anyhow::Result<_>>()?;

        let mut removed = 0u64;
        for (mkey, raw) in entries {
            let meta = Metadata::decode(&raw)?;
            let (_, user_key) = crate::slot::split_metadata_key(&mkey)?;
            let mut ops = vec![
                self.log_data(meta.redis_type, vec![b"del".to_vec()]),
                WalOp::Delete {
                    cf: ColumnFamily::Metadata,
                    key: mkey.clone(),
                },
            ];
            if meta.redis_type != RedisType::String {
                let sub_prefix =
                    compose_subkey_prefix(&self.namespace, slot, user_key, meta.version);
                for cf in [
                    ColumnFamily::Subkey,
                    ColumnFamily::ZsetScore,
                    ColumnFamily::Stream,
                ] {
                    let keys: Vec<(Vec<u8>, Vec<u8>)> = self
                        .storage
                        .prefix(cf, sub_prefix.clone())
                        .collect::<anyhow::Result<_>>()?;
                    for (sub, _) in keys {
                        ops.push(WalOp::Delete { cf, key: sub });
                    }
                }
            }
            self.storage.write_batch(ops)?;
            removed += 1;
        }
        Ok(removed)
    }

    fn scan_subkeys(
        &self,
        key: &[u8],
        version: u64,
        cf: ColumnFamily,
    ) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let (slot, _) = self.metadata_key(key);
        let prefix = compose_subkey_prefix(&self.namespace, slot, key, version);
        let mut out = Vec::new();
        for item in self.storage.prefix(cf, prefix) {
            let (full_key, value) = item?;
            let parsed = ParsedInternalKey::decode(&full_key)?;
            out.push((parsed.sub_key, value));
        }
        Ok(out)
    }
}

fn normalize_range(start: i64, stop: i64, len: i64) -> (i64, i64) {
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    (start, stop.min(len - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_db() -> (tempfile::TempDir, Db) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        (dir, Db::new(storage))
    }

    #[test]
    fn string_set_get_and_ttl() {
        let (_dir, db) = open_db();
        db.set_string(b"k1", b"v1", 0).unwrap();
        assert_eq!(db.get_string(b"k1").unwrap().unwrap(), b"v1");
        assert_eq!(db.pttl(b"k1").unwrap(), -1);

        let future = unix_time_ms() + 60_000;
        db.set_string(b"k2", b"v2", future).unwrap();
        assert!(db.pttl(b"k2").unwrap() > 0);

        db.set_string(b"k3", b"v3", 1).unwrap();
        assert_eq!(db.get_string(b"k3").unwrap(), None);
        assert_eq!(db.pttl(b"k3").unwrap(), -2);
    }

    #[test]
    fn hash_ops_track_size_and_fields() {
        let (_dir, db) = open_db();
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = (0..5)
            .map(|i| (format!("f{i}").into_bytes(), format!("v{i}").into_bytes()))
            .collect();
        assert_eq!(db.hset(b"h", &pairs).unwrap(), 5);
        assert_eq!(db.hset(b"h", &pairs[..2]).unwrap(), 0);
        assert_eq!(db.hgetall(b"h").unwrap().len(), 5);
        assert_eq!(db.hdel(b"h", &[b"f0".to_vec()]).unwrap(), 1);
        assert_eq!(db.hgetall(b"h").unwrap().len(), 4);
    }

    #[test]
    fn list_pushes_preserve_order() {
        let (_dir, db) = open_db();
        db.push_list(b"l", &[b"b".to_vec(), b"c".to_vec()], false).unwrap();
        db.push_list(b"l", &[b"a".to_vec()], true).unwrap();
        let range = db.lrange(b"l", 0, -1).unwrap();
        assert_eq!(range, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(db.pop_list(b"l", true).unwrap().unwrap(), b"a");
        assert_eq!(db.pop_list(b"l", false).unwrap().unwrap(), b"c");
        assert_eq!(db.llen(b"l").unwrap(), 1);
    }

    #[test]
    fn zset_keeps_member_and_score_index_in_sync() {
        let (_dir, db) = open_db();
        assert_eq!(
            db.zadd(b"z", &[(1.5, b"m1".to_vec()), (2.0, b"m2".to_vec())]).unwrap(),
            2
        );
        assert_eq!(db.zadd(b"z", &[(3.0, b"m1".to_vec())]).unwrap(), 0);
        assert_eq!(db.zscore(b"z", b"m1").unwrap().unwrap(), 3.0);
        assert_eq!(db.zrem(b"z", &[b"m1".to_vec()]).unwrap(), 1);
        assert_eq!(db.zscore(b"z", b"m1").unwrap(), None);
    }

    #[test]
    fn bitmap_bits_round_trip_across_fragments() {
        let (_dir, db) = open_db();
        for offset in [0u64, 7, 8, 8191, 8192, 70_000] {
            assert!(!db.setbit(b"bm", offset, true).unwrap());
            assert!(db.getbit(b"bm", offset).unwrap());
        }
        assert!(db.setbit(b"bm", 7, false).unwrap());
        assert!(!db.getbit(b"bm", 7).unwrap());
        assert!(!db.getbit(b"bm", 1).unwrap());
    }

    #[test]
    fn stream_entries_and_bookkeeping() {
        let (_dir, db) = open_db();
        let pairs = vec![(b"f".to_vec(), b"v".to_vec())];
        db.xadd(b"st", StreamEntryId { ms: 1, seq: 0 }, &pairs).unwrap();
        db.xadd(b"st", StreamEntryId { ms: 3, seq: 0 }, &pairs).unwrap();
        let dup = db.xadd(b"st", StreamEntryId { ms: 2, seq: 0 }, &pairs);
        assert!(dup.is_err());

        db.xsetid(
            b"st",
            StreamEntryId { ms: 5, seq: 0 },
            Some(9),
            Some(StreamEntryId { ms: 2, seq: 0 }),
        )
        .unwrap();
        let info = db.stream_info(b"st").unwrap().unwrap();
        assert_eq!(info.last_generated_id, StreamEntryId { ms: 5, seq: 0 });
        assert_eq!(info.entries_added, 9);
        assert_eq!(info.max_deleted_entry_id, StreamEntryId { ms: 2, seq: 0 });
        assert_eq!(db.xrange(b"st").unwrap().len(), 2);
    }

    #[test]
    fn wrongtype_is_reported() {
        let (_dir, db) = open_db();
        db.set_string(b"k", b"v", 0).unwrap();
        let err = db.hset(b"k", &[(b"f".to_vec(), b"v".to_vec())]).unwrap_err();
        assert!(err.to_string().starts_with("WRONGTYPE"));
    }

    #[test]
    fn clear_slot_removes_metadata_and_subrecords() {
        let (_dir, db) = open_db();
        db.set_string(b"{tag}s", b"v", 0).unwrap();
        db.hset(b"{tag}h", &[(b"f".to_vec(), b"v".to_vec())]).unwrap();
        let slot = key_slot(b"{tag}s");
        assert_eq!(slot, key_slot(b"{tag}h"));

        assert_eq!(db.clear_slot(slot).unwrap(), 2);
        assert_eq!(db.get_string(b"{tag}s").unwrap(), None);
        assert!(db.hgetall(b"{tag}h").unwrap().is_empty());
    }

    #[test]
    fn del_is_typed_and_idempotent() {
        let (_dir, db) = open_db();
        db.sadd(b"s", &[b"m".to_vec()]).unwrap();
        assert!(db.del(b"s").unwrap());
        assert!(!db.del(b"s").unwrap());
        assert!(db.smembers(b"s").unwrap().is_empty());
    }
}
