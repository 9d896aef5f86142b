//! On-disk record codecs: value metadata, internal sub-keys, scores and
//! stream entries.
//!
//! Every user key owns one record in the metadata column family. The record
//! starts with a flags byte (low 4 bits: type tag) and the absolute expiry in
//! milliseconds (0 = never). Strings carry their payload right after the
//! expiry; containers carry a version and an element count, and sub-records
//! live in sibling column families under an internal key that embeds the
//! container version. Bumping the version on re-creation makes old
//! sub-records unreachable without touching them.

use std::fmt;

use crate::slot::{compose_slot_prefix, SlotId};

/// Closed set of value types the server stores and the migrator restores.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedisType {
    String,
    List,
    Hash,
    Set,
    ZSet,
    Bitmap,
    SortedInt,
    Stream,
}

impl RedisType {
    pub fn as_u8(self) -> u8 {
        match self {
            RedisType::String => 0,
            RedisType::List => 1,
            RedisType::Hash => 2,
            RedisType::Set => 3,
            RedisType::ZSet => 4,
            RedisType::Bitmap => 5,
            RedisType::SortedInt => 6,
            RedisType::Stream => 7,
        }
    }

    pub fn from_u8(tag: u8) -> anyhow::Result<Self> {
        Ok(match tag {
            0 => RedisType::String,
            1 => RedisType::List,
            2 => RedisType::Hash,
            3 => RedisType::Set,
            4 => RedisType::ZSet,
            5 => RedisType::Bitmap,
            6 => RedisType::SortedInt,
            7 => RedisType::Stream,
            other => anyhow::bail!("unknown value type tag {other}"),
        })
    }

    /// Containers report "empty" via a zero size; strings cannot be empty.
    pub fn is_emptyable(self) -> bool {
        !matches!(self, RedisType::String)
    }

    /// Variadic restore command used when replaying a container's elements.
    pub fn restore_command(self) -> &'static str {
        match self {
            RedisType::String => "SET",
            RedisType::List => "RPUSH",
            RedisType::Hash => "HMSET",
            RedisType::Set => "SADD",
            RedisType::ZSet => "ZADD",
            RedisType::Bitmap => "SETBIT",
            RedisType::SortedInt => "SIADD",
            RedisType::Stream => "XADD",
        }
    }
}

impl fmt::Display for RedisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RedisType::String => "string",
            RedisType::List => "list",
            RedisType::Hash => "hash",
            RedisType::Set => "set",
            RedisType::ZSet => "zset",
            RedisType::Bitmap => "bitmap",
            RedisType::SortedInt => "sortedint",
            RedisType::Stream => "stream",
        };
        f.write_str(name)
    }
}

/// Offset of a string record's payload (flags byte + expiry).
pub const STRING_PAYLOAD_OFFSET: usize = 1 + 8;

/// Common header of every metadata record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub redis_type: RedisType,
    pub expire_ms: u64,
    pub version: u64,
    pub size: u32,
}

impl Metadata {
    pub fn new(redis_type: RedisType, version: u64) -> Self {
        Self {
            redis_type,
            expire_ms: 0,
            version,
            size: 0,
        }
    }

    /// Encode a container header (version + size follow the expiry).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 8 + 8 + 4);
        out.push(self.redis_type.as_u8());
        out.extend_from_slice(&self.expire_ms.to_be_bytes());
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.size.to_be_bytes());
        out
    }

    /// Decode the header of any record; string records leave version/size 0.
    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        let flags = read_u8_at(bytes, &mut offset)?;
        let redis_type = RedisType::from_u8(flags & 0x0f)?;
        let expire_ms = read_u64_at(bytes, &mut offset)?;
        let (version, size) = if redis_type == RedisType::String {
            (0, 0)
        } else {
            (read_u64_at(bytes, &mut offset)?, read_u32_at(bytes, &mut offset)?)
        };
        Ok(Self {
            redis_type,
            expire_ms,
            version,
            size,
        })
    }

    pub fn expired_at(&self, now_ms: u64) -> bool {
        self.expire_ms > 0 && self.expire_ms <= now_ms
    }
}

/// Encode a string record: header plus raw payload.
pub fn encode_string_record(expire_ms: u64, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(STRING_PAYLOAD_OFFSET + value.len());
    out.push(RedisType::String.as_u8());
    out.extend_from_slice(&expire_ms.to_be_bytes());
    out.extend_from_slice(value);
    out
}

/// Borrow a string record's payload.
pub fn string_payload(bytes: &[u8]) -> anyhow::Result<&[u8]> {
    anyhow::ensure!(
        bytes.len() >= STRING_PAYLOAD_OFFSET,
        "string record shorter than its header"
    );
    Ok(&bytes[STRING_PAYLOAD_OFFSET..])
}

/// List cursors start in the middle of the u64 index space so both pushes
/// have room to grow.
pub const LIST_INITIAL_CURSOR: u64 = u64::MAX / 2;

/// List header: common metadata plus head/tail index cursors.
///
/// Elements live at sub-keys `head..tail` (u64 BE), so lexicographic
/// iteration over the sub-key range is logical list order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListMetadata {
    pub meta: Metadata,
    pub head: u64,
    pub tail: u64,
}

impl ListMetadata {
    pub fn new(version: u64) -> Self {
        Self {
            meta: Metadata::new(RedisType::List, version),
            head: LIST_INITIAL_CURSOR,
            tail: LIST_INITIAL_CURSOR,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.meta.encode();
        out.extend_from_slice(&self.head.to_be_bytes());
        out.extend_from_slice(&self.tail.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        let meta = Metadata::decode(bytes)?;
        anyhow::ensure!(meta.redis_type == RedisType::List, "not a list record");
        let mut offset = 1 + 8 + 8 + 4;
        let head = read_u64_at(bytes, &mut offset)?;
        let tail = read_u64_at(bytes, &mut offset)?;
        Ok(Self { meta, head, tail })
    }
}

/// Stream entry identifier, rendered as `<ms>-<seq>`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamEntryId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamEntryId {
    pub const fn zero() -> Self {
        Self { ms: 0, seq: 0 }
    }

    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.ms.to_be_bytes());
        out[8..].copy_from_slice(&self.seq.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        let ms = read_u64_at(bytes, &mut offset)?;
        let seq = read_u64_at(bytes, &mut offset)?;
        Ok(Self { ms, seq })
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let (ms, seq) = match text.split_once('-') {
            Some((ms, seq)) => (ms.parse()?, seq.parse()?),
            None => (text.parse()?, 0),
        };
        Ok(Self { ms, seq })
    }
}

impl fmt::Display for StreamEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// Stream header: common metadata plus id bookkeeping `XSETID` restores.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamMetadata {
    pub meta: Metadata,
    pub last_generated_id: StreamEntryId,
    pub max_deleted_entry_id: StreamEntryId,
    pub entries_added: u64,
}

impl StreamMetadata {
    pub fn new(version: u64) -> Self {
        Self {
            meta: Metadata::new(RedisType::Stream, version),
            last_generated_id: StreamEntryId::zero(),
            max_deleted_entry_id: StreamEntryId::zero(),
            entries_added: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.meta.encode();
        out.extend_from_slice(&self.last_generated_id.encode());
        out.extend_from_slice(&self.max_deleted_entry_id.encode());
        out.extend_from_slice(&self.entries_added.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        let meta = Metadata::decode(bytes)?;
        anyhow::ensure!(meta.redis_type == RedisType::Stream, "not a stream record");
        let mut offset = 1 + 8 + 8 + 4;
        anyhow::ensure!(
            bytes.len() >= offset + 16 + 16 + 8,
            "stream record shorter than its header"
        );
        let last_generated_id = StreamEntryId::decode(&bytes[offset..offset + 16])?;
        offset += 16;
        let max_deleted_entry_id = StreamEntryId::decode(&bytes[offset..offset + 16])?;
        offset += 16;
        let entries_added = read_u64_at(bytes, &mut offset)?;
        Ok(Self {
            meta,
            last_generated_id,
            max_deleted_entry_id,
            entries_added,
        })
    }
}

/// Internal key of a container sub-record:
/// `[ns_len u8][ns][slot u16][key_len u32][key][version u64][sub_key]`.
///
/// The key length disambiguates the version boundary, so the sub-range of a
/// `(key, version)` pair is an exact byte prefix.
pub fn compose_internal_key(
    namespace: &[u8],
    slot: SlotId,
    user_key: &[u8],
    version: u64,
    sub_key: &[u8],
) -> Vec<u8> {
    let mut out = compose_subkey_prefix(namespace, slot, user_key, version);
    out.extend_from_slice(sub_key);
    out
}

/// Prefix shared by every sub-record of `(key, version)`.
pub fn compose_subkey_prefix(
    namespace: &[u8],
    slot: SlotId,
    user_key: &[u8],
    version: u64,
) -> Vec<u8> {
    let mut out = compose_slot_prefix(namespace, slot);
    out.extend_from_slice(&(user_key.len() as u32).to_be_bytes());
    out.extend_from_slice(user_key);
    out.extend_from_slice(&version.to_be_bytes());
    out
}

/// Decoded form of an internal sub-record key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedInternalKey {
    pub slot: SlotId,
    pub user_key: Vec<u8>,
    pub version: u64,
    pub sub_key: Vec<u8>,
}

impl ParsedInternalKey {
    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        let ns_len = read_u8_at(bytes, &mut offset)? as usize;
        anyhow::ensure!(
            bytes.len() >= offset + ns_len + 2,
            "internal key shorter than its namespace prefix"
        );
        offset += ns_len;
        let slot = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
        offset += 2;
        let key_len = read_u32_at(bytes, &mut offset)? as usize;
        anyhow::ensure!(
            bytes.len() >= offset + key_len + 8,
            "internal key shorter than its user key"
        );
        let user_key = bytes[offset..offset + key_len].to_vec();
        offset += key_len;
        let version = read_u64_at(bytes, &mut offset)?;
        let sub_key = bytes[offset..].to_vec();
        Ok(Self {
            slot,
            user_key,
            version,
            sub_key,
        })
    }
}

/// Order-preserving score encoding: encoded bytes compare like the floats.
pub fn encode_score(score: f64) -> [u8; 8] {
    let bits = score.to_bits();
    let encoded = if bits >> 63 == 1 { !bits } else { bits ^ (1 << 63) };
    encoded.to_be_bytes()
}

pub fn decode_score(bytes: &[u8]) -> anyhow::Result<f64> {
    let mut offset = 0usize;
    let encoded = read_u64_at(bytes, &mut offset)?;
    let bits = if encoded >> 63 == 1 {
        encoded ^ (1 << 63)
    } else {
        !encoded
    };
    Ok(f64::from_bits(bits))
}

/// Format a score the way replies and restore commands expect.
pub fn format_score(score: f64) -> String {
    if score == score.trunc() && score.abs() < 1e17 {
        format!("{}", score as i64)
    } else {
        format!("{score}")
    }
}

/// Encode a stream entry's field/value pairs.
pub fn encode_stream_entry(pairs: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(pairs.len() as u32).to_be_bytes());
    for (field, value) in pairs {
        out.extend_from_slice(&(field.len() as u32).to_be_bytes());
        out.extend_from_slice(field);
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        out.extend_from_slice(value);
    }
    out
}

pub fn decode_stream_entry(bytes: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut offset = 0usize;
    let count = read_u32_at(bytes, &mut offset)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let field_len = read_u32_at(bytes, &mut offset)? as usize;
        anyhow::ensure!(offset + field_len <= bytes.len(), "short stream field");
        let field = bytes[offset..offset + field_len].to_vec();
        offset += field_len;
        let value_len = read_u32_at(bytes, &mut offset)? as usize;
        anyhow::ensure!(offset + value_len <= bytes.len(), "short stream value");
        let value = bytes[offset..offset + value_len].to_vec();
        offset += value_len;
        out.push((field, value));
    }
    Ok(out)
}

pub(crate) fn read_u8_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    anyhow::ensure!(*offset + 1 <= data.len(), "record short u8");
    let value = data[*offset];
    *offset += 1;
    Ok(value)
}

pub(crate) fn read_u32_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "record short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

pub(crate) fn read_u64_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "record short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}
