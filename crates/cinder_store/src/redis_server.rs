//! RESP2 front end: connection loop, auth gate, slot admission, and command
//! dispatch into the data model and the migration control surface.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::codec::Framed;

use crate::cluster::Cluster;
use crate::config::NodeArgs;
use crate::db::Db;
use crate::metadata::{format_score, StreamEntryId};
use crate::slot::key_slot;
use crate::slot_import::SlotImporter;
use crate::slot_migrate::{MigrateShared, SlotMigrator};
use crate::storage::{unix_time_ms, Storage};

pub struct ServerContext {
    pub db: Db,
    pub storage: Arc<Storage>,
    pub cluster: Arc<Cluster>,
    pub migrator: SlotMigrator,
    pub migrate_shared: Arc<MigrateShared>,
    pub importer: SlotImporter,
    pub exclusive: Arc<RwLock<()>>,
    pub args: NodeArgs,
}

pub async fn serve(listener: TcpListener, ctx: Arc<ServerContext>) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, peer, ctx).await {
                tracing::debug!(error = ?err, %peer, "connection closed");
            }
        });
    }
}

async fn handle_conn(
    socket: TcpStream,
    _peer: SocketAddr,
    ctx: Arc<ServerContext>,
) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, Resp2::default());
    let mut authenticated = ctx.args.requirepass.is_none();

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let argv = match frame_to_argv(frame) {
            Ok(Some(argv)) => argv,
            Ok(None) => continue,
            Err(err) => {
                framed
                    .send(BytesFrame::Error(format!("ERR {err}").into()))
                    .await?;
                continue;
            }
        };

        let reply = match dispatch(&ctx, &mut authenticated, &argv).await {
            Ok(frame) => frame,
            Err(err) => BytesFrame::Error(error_message(&err).into()),
        };
        framed.send(reply).await?;
    }
    Ok(())
}

fn frame_to_argv(frame: BytesFrame) -> anyhow::Result<Option<Vec<Vec<u8>>>> {
    let BytesFrame::Array(parts) = frame else {
        anyhow::bail!("expected array frame");
    };
    if parts.is_empty() {
        return Ok(None);
    }
    let mut argv = Vec::with_capacity(parts.len());
    for part in parts {
        match part {
            BytesFrame::BulkString(bytes) | BytesFrame::SimpleString(bytes) => {
                argv.push(bytes.to_vec())
            }
            _ => anyhow::bail!("invalid argument frame"),
        }
    }
    Ok(Some(argv))
}

/// Errors that already carry a RESP error code go out verbatim; everything
/// else is wrapped as a generic `ERR`.
fn error_message(err: &anyhow::Error) -> String {
    let text = format!("{err:#}");
    for code in ["WRONGTYPE", "MOVED", "TRYAGAIN", "NOAUTH", "ERR "] {
        if text.starts_with(code) {
            return text;
        }
    }
    format!("ERR {text}")
}

async fn dispatch(
    ctx: &Arc<ServerContext>,
    authenticated: &mut bool,
    argv: &[Vec<u8>],
) -> anyhow::Result<BytesFrame> {
    let cmd = String::from_utf8_lossy(&argv[0]).to_ascii_uppercase();

    if cmd == "AUTH" {
        anyhow::ensure!(argv.len() == 2, "ERR wrong number of arguments for 'auth'");
        let Some(expected) = &ctx.args.requirepass else {
            anyhow::bail!("ERR Client sent AUTH, but no password is set");
        };
        anyhow::ensure!(
            argv[1] == expected.as_bytes(),
            "ERR invalid password"
        );
        *authenticated = true;
        return Ok(ok());
    }
    if !*authenticated {
        anyhow::bail!("NOAUTH Authentication required.");
    }

    match cmd.as_str() {
        "PING" => Ok(BytesFrame::SimpleString("PONG".into())),
        "CLUSTER" => cluster_command(ctx, argv),
        "CLUSTERX" => clusterx_command(ctx, argv).await,
        "APPLYBATCH" => {
            anyhow::ensure!(argv.len() == 2, "ERR wrong number of arguments for 'applybatch'");
            ctx.storage.apply_encoded_batch(&argv[1])?;
            Ok(ok())
        }
        _ => execute_data_command(ctx, &cmd, argv),
    }
}

fn cluster_command(ctx: &Arc<ServerContext>, argv: &[Vec<u8>]) -> anyhow::Result<BytesFrame> {
    let sub = String::from_utf8_lossy(argv.get(1).map(Vec::as_slice).unwrap_or_default())
        .to_ascii_uppercase();
    match sub.as_str() {
        "IMPORT" => {
            anyhow::ensure!(argv.len() == 4, "ERR wrong number of arguments for 'cluster import'");
            let slot = parse_slot(&argv[2])?;
            let status: u8 = parse_u64(&argv[3])? as u8;
            match status {
                0 => ctx.importer.start(slot)?,
                1 => ctx.importer.success(slot)?,
                2 => ctx.importer.fail(slot)?,
                other => anyhow::bail!("ERR invalid import state {other}"),
            }
            Ok(ok())
        }
        _ => anyhow::bail!("ERR unknown CLUSTER subcommand"),
    }
}

async fn clusterx_command(
    ctx: &Arc<ServerContext>,
    argv: &[Vec<u8>],
) -> anyhow::Result<BytesFrame> {
    let sub = String::from_utf8_lossy(argv.get(1).map(Vec::as_slice).unwrap_or_default())
        .to_ascii_uppercase();
    match sub.as_str() {
        "MIGRATE" => {
            anyhow::ensure!(
                argv.len() == 5 || argv.len() == 6,
                "ERR wrong number of arguments for 'clusterx migrate'"
            );
            let slot = parse_slot(&argv[2])?;
            let dst_ip = String::from_utf8_lossy(&argv[3]).into_owned();
            let dst_port = parse_u64(&argv[4])? as u16;
            let blocking = match argv.get(5) {
                Some(flag) => {
                    anyhow::ensure!(
                        flag.eq_ignore_ascii_case(b"sync"),
                        "ERR unknown migrate flag"
                    );
                    true
                }
                None => false,
            };

            let job = ctx.args.migration_job(slot, dst_ip, dst_port);
            if blocking {
                let (tx, rx) = oneshot::channel();
                ctx.migrator.submit(job, Some(tx))?;
                match rx.await {
                    Ok(Ok(())) => Ok(ok()),
                    Ok(Err(message)) => anyhow::bail!("ERR {message}"),
                    Err(_) => anyhow::bail!("ERR migration worker dropped the job"),
                }
            } else {
                ctx.migrator.submit(job, None)?;
                Ok(ok())
            }
        }
        "MIGRATESTOP" => {
            ctx.migrator.cancel();
            Ok(ok())
        }
        "MIGRATEINFO" => Ok(bulk(ctx.migrator.status_text().into_bytes())),
        _ => anyhow::bail!("ERR unknown CLUSTERX subcommand"),
    }
}

fn execute_data_command(
    ctx: &Arc<ServerContext>,
    cmd: &str,
    argv: &[Vec<u8>],
) -> anyhow::Result<BytesFrame> {
    anyhow::ensure!(argv.len() >= 2, "ERR wrong number of arguments");
    let key = argv[1].clone();

    let is_write = matches!(
        cmd,
        "SET" | "DEL"
            | "RPUSH"
            | "LPUSH"
            | "LPOP"
            | "RPOP"
            | "HSET"
            | "HMSET"
            | "HDEL"
            | "SADD"
            | "SREM"
            | "ZADD"
            | "ZREM"
            | "SIADD"
            | "SIREM"
            | "SETBIT"
            | "XADD"
            | "XSETID"
            | "PEXPIREAT"
    );

    if is_write {
        // Hold the shared side of the exclusive-write guard for the whole
        // check-and-execute so no write straddles the forbidden flip.
        let guard = match ctx.exclusive.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        check_write_admission(ctx, &key)?;
        let reply = execute_write(ctx, cmd, argv);
        drop(guard);
        reply
    } else {
        check_read_admission(ctx, &key)?;
        execute_read(ctx, cmd, argv)
    }
}

fn check_write_admission(ctx: &Arc<ServerContext>, key: &[u8]) -> anyhow::Result<()> {
    let slot = key_slot(key);
    if ctx.importer.importing_slot() == Some(slot) {
        // Restore traffic for an importing slot is always admitted.
        return Ok(());
    }
    if let Some(dst) = ctx.cluster.migrated_dst(slot) {
        anyhow::bail!("MOVED {slot} {dst}");
    }
    if ctx.migrate_shared.forbidden_slot() == Some(slot) {
        anyhow::bail!("TRYAGAIN Slot is being migrated");
    }
    Ok(())
}

fn check_read_admission(ctx: &Arc<ServerContext>, key: &[u8]) -> anyhow::Result<()> {
    let slot = key_slot(key);
    if ctx.importer.importing_slot() == Some(slot) {
        return Ok(());
    }
    if let Some(dst) = ctx.cluster.migrated_dst(slot) {
        anyhow::bail!("MOVED {slot} {dst}");
    }
    Ok(())
}

fn execute_write(
    ctx: &Arc<ServerContext>,
    cmd: &str,
    argv: &[Vec<u8>],
) -> anyhow::Result<BytesFrame> {
    let db = &ctx.db;
    let key = &argv[1];
    match cmd {
        "SET" => {
            anyhow::ensure!(argv.len() >= 3, "ERR wrong number of arguments for 'set'");
            let expire_ms = parse_set_expiry(&argv[3..])?;
            db.set_string(key, &argv[2], expire_ms)?;
            Ok(ok())
        }
        "DEL" => {
            let mut removed = 0i64;
            for key in &argv[1..] {
                check_write_admission(ctx, key)?;
                if db.del(key)? {
                    removed += 1;
                }
            }
            Ok(int(removed))
        }
        "RPUSH" | "LPUSH" => {
            let values = argv[2..].to_vec();
            let len = db.push_list(key, &values, cmd == "LPUSH")?;
            Ok(int(len as i64))
        }
        "LPOP" | "RPOP" => match db.pop_list(key, cmd == "LPOP")? {
            Some(value) => Ok(bulk(value)),
            None => Ok(BytesFrame::Null),
        },
        "HSET" | "HMSET" => {
            anyhow::ensure!(
                argv.len() >= 4 && argv.len() % 2 == 0,
                "ERR wrong number of arguments for 'hset'"
            );
            let pairs: Vec<(Vec<u8>, Vec<u8>)> = argv[2..]
                .chunks(2)
                .map(|pair| (pair[0].clone(), pair[1].clone()))
                .collect();
            let added = db.hset(key, &pairs)?;
            if cmd == "HMSET" {
                Ok(ok())
            } else {
                Ok(int(added as i64))
            }
        }
        "HDEL" => Ok(int(db.hdel(key, &argv[2..])? as i64)),
        "SADD" => Ok(int(db.sadd(key, &argv[2..])? as i64)),
        "SREM" => Ok(int(db.srem(key, &argv[2..])? as i64)),
        "ZADD" => {
            anyhow::ensure!(
                argv.len() >= 4 && argv.len() % 2 == 0,
                "ERR wrong number of arguments for 'zadd'"
            );
            let mut pairs = Vec::with_capacity((argv.len() - 2) / 2);
            for pair in argv[2..].chunks(2) {
                pairs.push((parse_f64(&pair[0])?, pair[1].clone()));
            }
            Ok(int(db.zadd(key, &pairs)? as i64))
        }
        "ZREM" => Ok(int(db.zrem(key, &argv[2..])? as i64)),
        "SIADD" => {
            let ids = parse_u64_list(&argv[2..])?;
            Ok(int(db.siadd(key, &ids)? as i64))
        }
        "SIREM" => {
            let ids = parse_u64_list(&argv[2..])?;
            Ok(int(db.sirem(key, &ids)? as i64))
        }
        "SETBIT" => {
            anyhow::ensure!(argv.len() == 4, "ERR wrong number of arguments for 'setbit'");
            let offset = parse_u64(&argv[2])?;
            let value = match argv[3].as_slice() {
                b"0" => false,
                b"1" => true,
                _ => anyhow::bail!("ERR bit is not an integer or out of range"),
            };
            let old = db.setbit(key, offset, value)?;
            Ok(int(i64::from(old)))
        }
        "XADD" => {
            anyhow::ensure!(
                argv.len() >= 5 && argv.len() % 2 == 1,
                "ERR wrong number of arguments for 'xadd'"
            );
            let id = parse_xadd_id(ctx, key, &argv[2])?;
            let pairs: Vec<(Vec<u8>, Vec<u8>)> = argv[3..]
                .chunks(2)
                .map(|pair| (pair[0].clone(), pair[1].clone()))
                .collect();
            let id = db.xadd(key, id, &pairs)?;
            Ok(bulk(id.to_string().into_bytes()))
        }
        "XSETID" => {
            anyhow::ensure!(argv.len() >= 3, "ERR wrong number of arguments for 'xsetid'");
            let last_id = StreamEntryId::parse(&String::from_utf8_lossy(&argv[2]))?;
            let mut entries_added = None;
            let mut max_deleted = None;
            let mut rest = argv[3..].iter();
            while let Some(option) = rest.next() {
                let value = rest
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("ERR syntax error"))?;
                if option.eq_ignore_ascii_case(b"entriesadded") {
                    entries_added = Some(parse_u64(value)?);
                } else if option.eq_ignore_ascii_case(b"maxdeletedid") {
                    max_deleted = Some(StreamEntryId::parse(&String::from_utf8_lossy(value))?);
                } else {
                    anyhow::bail!("ERR syntax error");
                }
            }
            db.xsetid(key, last_id, entries_added, max_deleted)?;
            Ok(ok())
        }
        "PEXPIREAT" => {
            anyhow::ensure!(argv.len() == 3, "ERR wrong number of arguments for 'pexpireat'");
            let at_ms = parse_u64(&argv[2])?;
            Ok(int(i64::from(db.pexpireat(key, at_ms)?)))
        }
        other => anyhow::bail!("ERR unknown command '{other}'"),
    }
}

fn execute_read(
    ctx: &Arc<ServerContext>,
    cmd: &str,
    argv: &[Vec<u8>],
) -> anyhow::Result<BytesFrame> {
    let db = &ctx.db;
    let key = &argv[1];
    match cmd {
        "GET" => match db.get_string(key)? {
            Some(value) => Ok(bulk(value)),
            None => Ok(BytesFrame::Null),
        },
        "EXISTS" => Ok(int(i64::from(db.exists(key)?))),
        "PTTL" => Ok(int(db.pttl(key)?)),
        "LLEN" => Ok(int(db.llen(key)? as i64)),
        "LRANGE" => {
            anyhow::ensure!(argv.len() == 4, "ERR wrong number of arguments for 'lrange'");
            let start = parse_i64(&argv[2])?;
            let stop = parse_i64(&argv[3])?;
            let values = db.lrange(key, start, stop)?;
            Ok(BytesFrame::Array(values.into_iter().map(bulk).collect()))
        }
        "HGETALL" => {
            let mut frames = Vec::new();
            for (field, value) in db.hgetall(key)? {
                frames.push(bulk(field));
                frames.push(bulk(value));
            }
            Ok(BytesFrame::Array(frames))
        }
        "SMEMBERS" => Ok(BytesFrame::Array(
            db.smembers(key)?.into_iter().map(bulk).collect(),
        )),
        "ZSCORE" => match db.zscore(key, argv.get(2).map(Vec::as_slice).unwrap_or_default())? {
            Some(score) => Ok(bulk(format_score(score).into_bytes())),
            None => Ok(BytesFrame::Null),
        },
        "SIMEMBERS" => Ok(BytesFrame::Array(
            db.simembers(key)?
                .into_iter()
                .map(|id| bulk(id.to_string().into_bytes()))
                .collect(),
        )),
        "GETBIT" => {
            anyhow::ensure!(argv.len() == 3, "ERR wrong number of arguments for 'getbit'");
            let offset = parse_u64(&argv[2])?;
            Ok(int(i64::from(db.getbit(key, offset)?)))
        }
        "XRANGE" => {
            let mut frames = Vec::new();
            for (id, pairs) in db.xrange(key)? {
                let mut entry = Vec::with_capacity(pairs.len() * 2);
                for (field, value) in pairs {
                    entry.push(bulk(field));
                    entry.push(bulk(value));
                }
                frames.push(BytesFrame::Array(vec![
                    bulk(id.to_string().into_bytes()),
                    BytesFrame::Array(entry),
                ]));
            }
            Ok(BytesFrame::Array(frames))
        }
        other => anyhow::bail!("ERR unknown command '{other}'"),
    }
}

fn parse_xadd_id(
    ctx: &Arc<ServerContext>,
    key: &[u8],
    raw: &[u8],
) -> anyhow::Result<StreamEntryId> {
    if raw == b"*" {
        let last = ctx
            .db
            .stream_info(key)?
            .map(|info| info.last_generated_id)
            .unwrap_or(StreamEntryId::zero());
        let now = unix_time_ms();
        if now > last.ms {
            return Ok(StreamEntryId { ms: now, seq: 0 });
        }
        return Ok(StreamEntryId {
            ms: last.ms,
            seq: last.seq + 1,
        });
    }
    StreamEntryId::parse(&String::from_utf8_lossy(raw))
}

fn parse_set_expiry(options: &[Vec<u8>]) -> anyhow::Result<u64> {
    let mut iter = options.iter();
    let Some(option) = iter.next() else {
        return Ok(0);
    };
    let value = iter
        .next()
        .ok_or_else(|| anyhow::anyhow!("ERR syntax error"))?;
    anyhow::ensure!(iter.next().is_none(), "ERR syntax error");
    if option.eq_ignore_ascii_case(b"pxat") {
        parse_u64(value)
    } else if option.eq_ignore_ascii_case(b"px") {
        Ok(unix_time_ms() + parse_u64(value)?)
    } else if option.eq_ignore_ascii_case(b"ex") {
        Ok(unix_time_ms() + parse_u64(value)? * 1000)
    } else {
        anyhow::bail!("ERR syntax error")
    }
}

fn parse_slot(raw: &[u8]) -> anyhow::Result<crate::slot::SlotId> {
    let slot = parse_u64(raw)?;
    anyhow::ensure!(
        slot < u64::from(crate::slot::HASH_SLOTS),
        "ERR slot is out of range"
    );
    Ok(slot as crate::slot::SlotId)
}

fn parse_u64(raw: &[u8]) -> anyhow::Result<u64> {
    String::from_utf8_lossy(raw)
        .parse()
        .map_err(|_| anyhow::anyhow!("ERR value is not an integer or out of range"))
}

fn parse_i64(raw: &[u8]) -> anyhow::Result<i64> {
    String::from_utf8_lossy(raw)
        .parse()
        .map_err(|_| anyhow::anyhow!("ERR value is not an integer or out of range"))
}

fn parse_f64(raw: &[u8]) -> anyhow::Result<f64> {
    String::from_utf8_lossy(raw)
        .parse()
        .map_err(|_| anyhow::anyhow!("ERR value is not a valid float"))
}

fn parse_u64_list(raws: &[Vec<u8>]) -> anyhow::Result<Vec<u64>> {
    raws.iter().map(|raw| parse_u64(raw)).collect()
}

fn ok() -> BytesFrame {
    BytesFrame::SimpleString("OK".into())
}

fn int(value: i64) -> BytesFrame {
    BytesFrame::Integer(value)
}

fn bulk(value: Vec<u8>) -> BytesFrame {
    BytesFrame::BulkString(bytes::Bytes::from(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_keep_resp_codes() {
        let moved = anyhow::anyhow!("MOVED 7 10.0.0.2:6379");
        assert_eq!(error_message(&moved), "MOVED 7 10.0.0.2:6379");
        let plain = anyhow::anyhow!("something broke");
        assert_eq!(error_message(&plain), "ERR something broke");
    }

    #[test]
    fn set_expiry_options_produce_absolute_times() {
        assert_eq!(parse_set_expiry(&[]).unwrap(), 0);
        assert_eq!(
            parse_set_expiry(&[b"PXAT".to_vec(), b"12345".to_vec()]).unwrap(),
            12345
        );
        let px = parse_set_expiry(&[b"px".to_vec(), b"60000".to_vec()]).unwrap();
        assert!(px > unix_time_ms());
        assert!(parse_set_expiry(&[b"EX".to_vec()]).is_err());
    }

    #[test]
    fn slot_parser_bounds_slot_ids() {
        assert_eq!(parse_slot(b"16383").unwrap(), 16383);
        assert!(parse_slot(b"16384").is_err());
        assert!(parse_slot(b"x").is_err());
    }
}
