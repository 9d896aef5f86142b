//! Translation of raw WAL batches into idempotent restore commands.
//!
//! Only mutations touching the migrating slot produce output. The
//! `WriteBatchLogData` header at the head of each batch supplies what the raw
//! key/value bytes cannot: which command produced the batch (a list sub-key
//! put is `RPUSH` or `LPUSH`; a bitmap put names the flipped offset).

use anyhow::Context;

use crate::metadata::{
    decode_score, decode_stream_entry, format_score, Metadata, ParsedInternalKey, RedisType,
    StreamEntryId, StreamMetadata, string_payload,
};
use crate::slot::{compose_slot_prefix, SlotId};
use crate::wal::{ColumnFamily, WalOp, WriteBatchLogData};

pub type Command = Vec<Vec<u8>>;

/// Translate one batch's ops into restore commands for `slot`.
pub fn extract_commands(
    ops: &[WalOp],
    namespace: &[u8],
    slot: SlotId,
) -> anyhow::Result<Vec<Command>> {
    let slot_prefix = compose_slot_prefix(namespace, slot);
    let mut log_data: Option<WriteBatchLogData> = None;
    let mut out = Vec::new();

    for op in ops {
        match op {
            WalOp::LogData { payload } => {
                log_data = Some(WriteBatchLogData::decode(payload)?);
            }
            WalOp::Put { cf, key, value } => {
                if !key.starts_with(&slot_prefix) {
                    continue;
                }
                match cf {
                    ColumnFamily::Metadata => {
                        let user_key = key[slot_prefix.len()..].to_vec();
                        extract_metadata_put(&user_key, value, &mut out)?;
                    }
                    ColumnFamily::Subkey => {
                        extract_subkey_put(log_data.as_ref(), key, value, &mut out)?;
                    }
                    ColumnFamily::Stream => {
                        let parsed = ParsedInternalKey::decode(key)?;
                        let id = StreamEntryId::decode(&parsed.sub_key)?;
                        let mut cmd: Command =
                            vec![b"XADD".to_vec(), parsed.user_key, id.to_string().into_bytes()];
                        for (field, field_value) in decode_stream_entry(value)? {
                            cmd.push(field);
                            cmd.push(field_value);
                        }
                        out.push(cmd);
                    }
                    // The score index is derived from the member records.
                    ColumnFamily::ZsetScore => {}
                }
            }
            WalOp::Delete { cf, key } => {
                if !key.starts_with(&slot_prefix) {
                    continue;
                }
                match cf {
                    ColumnFamily::Metadata => {
                        let user_key = key[slot_prefix.len()..].to_vec();
                        out.push(vec![b"DEL".to_vec(), user_key]);
                    }
                    ColumnFamily::Subkey => {
                        extract_subkey_delete(log_data.as_ref(), key, &mut out)?;
                    }
                    ColumnFamily::ZsetScore | ColumnFamily::Stream => {}
                }
            }
        }
    }
    Ok(out)
}

fn extract_metadata_put(
    user_key: &[u8],
    value: &[u8],
    out: &mut Vec<Command>,
) -> anyhow::Result<()> {
    let meta = Metadata::decode(value)?;
    match meta.redis_type {
        RedisType::String => {
            let mut cmd: Command = vec![
                b"SET".to_vec(),
                user_key.to_vec(),
                string_payload(value)?.to_vec(),
            ];
            if meta.expire_ms > 0 {
                cmd.push(b"PXAT".to_vec());
                cmd.push(meta.expire_ms.to_string().into_bytes());
            }
            out.push(cmd);
        }
        RedisType::Stream => {
            let stream = StreamMetadata::decode(value)?;
            out.push(vec![
                b"XSETID".to_vec(),
                user_key.to_vec(),
                stream.last_generated_id.to_string().into_bytes(),
                b"ENTRIESADDED".to_vec(),
                stream.entries_added.to_string().into_bytes(),
                b"MAXDELETEDID".to_vec(),
                stream.max_deleted_entry_id.to_string().into_bytes(),
            ]);
            if meta.expire_ms > 0 {
                out.push(pexpireat(user_key, meta.expire_ms));
            }
        }
        _ => {
            // Container bookkeeping carries no element data; only a live
            // expiry needs to be mirrored.
            if meta.expire_ms > 0 {
                out.push(pexpireat(user_key, meta.expire_ms));
            }
        }
    }
    Ok(())
}

fn extract_subkey_put(
    log_data: Option<&WriteBatchLogData>,
    key: &[u8],
    value: &[u8],
    out: &mut Vec<Command>,
) -> anyhow::Result<()> {
    let Some(log_data) = log_data else {
        anyhow::bail!("sub-key mutation without a log data header");
    };
    let parsed = ParsedInternalKey::decode(key)?;
    let user_key = parsed.user_key;
    match log_data.redis_type {
        RedisType::Hash => out.push(vec![
            b"HSET".to_vec(),
            user_key,
            parsed.sub_key,
            value.to_vec(),
        ]),
        RedisType::Set => out.push(vec![b"SADD".to_vec(), user_key, parsed.sub_key]),
        RedisType::ZSet => out.push(vec![
            b"ZADD".to_vec(),
            user_key,
            format_score(decode_score(value)?).into_bytes(),
            parsed.sub_key,
        ]),
        RedisType::SortedInt => {
            anyhow::ensure!(parsed.sub_key.len() == 8, "corrupt sortedint sub-key");
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&parsed.sub_key);
            out.push(vec![
                b"SIADD".to_vec(),
                user_key,
                u64::from_be_bytes(buf).to_string().into_bytes(),
            ]);
        }
        RedisType::List => {
            let cmd: &[u8] = match log_data.first_arg() {
                Some(b"lpush") => b"LPUSH",
                _ => b"RPUSH",
            };
            out.push(vec![cmd.to_vec(), user_key, value.to_vec()]);
        }
        RedisType::Bitmap => {
            let offset_arg = log_data
                .args
                .get(1)
                .context("bitmap log data without an offset")?;
            let offset: u64 = String::from_utf8_lossy(offset_arg)
                .parse()
                .context("bitmap log data offset is not an integer")?;
            let fragment_start: u64 = String::from_utf8_lossy(&parsed.sub_key)
                .parse()
                .context("bitmap sub-key is not an integer")?;
            let index_in_fragment = (offset / 8 - fragment_start) as usize;
            let bit = value
                .get(index_in_fragment)
                .map(|byte| byte & (1 << (offset % 8)) != 0)
                .unwrap_or(false);
            out.push(vec![
                b"SETBIT".to_vec(),
                user_key,
                offset.to_string().into_bytes(),
                if bit { b"1".to_vec() } else { b"0".to_vec() },
            ]);
        }
        RedisType::String | RedisType::Stream => {}
    }
    Ok(())
}

fn extract_subkey_delete(
    log_data: Option<&WriteBatchLogData>,
    key: &[u8],
    out: &mut Vec<Command>,
) -> anyhow::Result<()> {
    let Some(log_data) = log_data else {
        anyhow::bail!("sub-key deletion without a log data header");
    };
    let parsed = ParsedInternalKey::decode(key)?;
    let user_key = parsed.user_key;
    match log_data.redis_type {
        RedisType::Hash => out.push(vec![b"HDEL".to_vec(), user_key, parsed.sub_key]),
        RedisType::Set => out.push(vec![b"SREM".to_vec(), user_key, parsed.sub_key]),
        RedisType::ZSet => out.push(vec![b"ZREM".to_vec(), user_key, parsed.sub_key]),
        RedisType::SortedInt => {
            anyhow::ensure!(parsed.sub_key.len() == 8, "corrupt sortedint sub-key");
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&parsed.sub_key);
            out.push(vec![
                b"SIREM".to_vec(),
                user_key,
                u64::from_be_bytes(buf).to_string().into_bytes(),
            ]);
        }
        RedisType::List => {
            let cmd: &[u8] = match log_data.first_arg() {
                Some(b"lpop") => b"LPOP",
                _ => b"RPOP",
            };
            out.push(vec![cmd.to_vec(), user_key]);
        }
        RedisType::String | RedisType::Bitmap | RedisType::Stream => {}
    }
    Ok(())
}

fn pexpireat(user_key: &[u8], at_ms: u64) -> Command {
    vec![
        b"PEXPIREAT".to_vec(),
        user_key.to_vec(),
        at_ms.to_string().into_bytes(),
    ]
}
