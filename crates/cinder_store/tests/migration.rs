//! End-to-end slot migration between two in-process nodes speaking RESP.

mod common;

use common::{start_node, unix_ms, wait_until, Reply, TestNode};

use cinder_store::slot::key_slot;

fn setup_pair(src_args: &[&str]) -> (tempfile::TempDir, TestNode, TestNode) {
    let dir = tempfile::tempdir().expect("tempdir");
    let src = start_node(&dir.path().join("src"), src_args);
    let dst = start_node(&dir.path().join("dst"), &[]);
    (dir, src, dst)
}

fn migrate_sync(src: &TestNode, dst: &TestNode, slot: u16) -> Reply {
    let mut conn = src.connect();
    conn.cmd(&[
        "CLUSTERX",
        "MIGRATE",
        &slot.to_string(),
        "127.0.0.1",
        &dst.port().to_string(),
        "SYNC",
    ])
}

fn migrate_async(src: &TestNode, dst: &TestNode, slot: u16) -> Reply {
    let mut conn = src.connect();
    conn.cmd(&[
        "CLUSTERX",
        "MIGRATE",
        &slot.to_string(),
        "127.0.0.1",
        &dst.port().to_string(),
    ])
}

fn migrate_info(node: &TestNode) -> String {
    let mut conn = node.connect();
    String::from_utf8(conn.cmd(&["CLUSTERX", "MIGRATEINFO"]).expect_bulk()).expect("utf8 info")
}

#[test]
fn migrates_string_keys_with_expiry() {
    let (_dir, src, dst) = setup_pair(&[]);
    let mut s = src.connect();
    s.cmd(&["SET", "{t1}k1", "v1"]).expect_ok();
    let pxat = (unix_ms() + 60_000).to_string();
    s.cmd(&["SET", "{t1}k2", "v2", "PXAT", &pxat]).expect_ok();

    let slot = key_slot(b"{t1}k1");
    migrate_sync(&src, &dst, slot).expect_ok();

    let mut d = dst.connect();
    assert_eq!(d.cmd(&["GET", "{t1}k1"]), Reply::Bulk(b"v1".to_vec()));
    assert_eq!(d.cmd(&["GET", "{t1}k2"]), Reply::Bulk(b"v2".to_vec()));
    let ttl = d.cmd(&["PTTL", "{t1}k2"]).expect_int();
    assert!(ttl > 0 && ttl <= 60_000, "ttl {ttl} out of range");

    // The moved rule now rejects writes to the slot on the source.
    let err = s.cmd(&["SET", "{t1}k3", "x"]).expect_error().to_string();
    assert!(err.starts_with("MOVED"), "unexpected rejection {err}");

    let info = migrate_info(&src);
    assert!(info.contains("migrating_state: success"), "info: {info}");
    assert!(info.contains(&format!("migrating_slot: {slot}")), "info: {info}");

    // The engine released its snapshot pin on cleanup.
    assert_eq!(src.ctx().storage.open_snapshot_count(), 0);

    // A successfully migrated slot is refused for future migrations.
    let err = migrate_sync(&src, &dst, slot).expect_error().to_string();
    assert!(err.contains("has been migrated"), "unexpected error {err}");
}

#[test]
fn migrates_large_hash_in_chunked_commands() {
    let (_dir, src, dst) = setup_pair(&[]);
    let mut s = src.connect();

    let mut argv: Vec<Vec<u8>> = vec![b"HSET".to_vec(), b"{t2}h".to_vec()];
    for i in 0..250 {
        argv.push(format!("f{i}").into_bytes());
        argv.push(format!("v{i}").into_bytes());
    }
    assert_eq!(s.cmd_bytes(&argv).expect_int(), 250);

    migrate_sync(&src, &dst, key_slot(b"{t2}h")).expect_ok();

    let mut d = dst.connect();
    let flat = d.cmd(&["HGETALL", "{t2}h"]).expect_array().to_vec();
    assert_eq!(flat.len(), 500);
    // Spot-check one pair survived with its value.
    let fields: Vec<Vec<u8>> = flat.iter().step_by(2).map(|r| r.expect_bulk()).collect();
    assert!(fields.contains(&b"f249".to_vec()));
}

#[test]
fn migrates_all_container_types() {
    let (_dir, src, dst) = setup_pair(&[]);
    let mut s = src.connect();
    s.cmd(&["RPUSH", "{t3}l", "a", "b"]).expect_int();
    s.cmd(&["LPUSH", "{t3}l", "z"]).expect_int();
    s.cmd(&["SADD", "{t3}s", "m1", "m2"]).expect_int();
    s.cmd(&["ZADD", "{t3}z", "1.5", "alpha", "3", "beta"]).expect_int();
    s.cmd(&["SIADD", "{t3}si", "3", "9", "27"]).expect_int();
    s.cmd(&["SETBIT", "{t3}bm", "7", "1"]).expect_int();
    s.cmd(&["SETBIT", "{t3}bm", "8200", "1"]).expect_int();

    migrate_sync(&src, &dst, key_slot(b"{t3}l")).expect_ok();

    let mut d = dst.connect();
    let list: Vec<Vec<u8>> = d
        .cmd(&["LRANGE", "{t3}l", "0", "-1"])
        .expect_array()
        .iter()
        .map(|r| r.expect_bulk())
        .collect();
    assert_eq!(list, vec![b"z".to_vec(), b"a".to_vec(), b"b".to_vec()]);

    let members: Vec<Vec<u8>> = d
        .cmd(&["SMEMBERS", "{t3}s"])
        .expect_array()
        .iter()
        .map(|r| r.expect_bulk())
        .collect();
    assert_eq!(members, vec![b"m1".to_vec(), b"m2".to_vec()]);

    assert_eq!(d.cmd(&["ZSCORE", "{t3}z", "alpha"]).expect_bulk(), b"1.5");
    assert_eq!(d.cmd(&["ZSCORE", "{t3}z", "beta"]).expect_bulk(), b"3");

    let ids: Vec<Vec<u8>> = d
        .cmd(&["SIMEMBERS", "{t3}si"])
        .expect_array()
        .iter()
        .map(|r| r.expect_bulk())
        .collect();
    assert_eq!(ids, vec![b"3".to_vec(), b"9".to_vec(), b"27".to_vec()]);

    assert_eq!(d.cmd(&["GETBIT", "{t3}bm", "7"]).expect_int(), 1);
    assert_eq!(d.cmd(&["GETBIT", "{t3}bm", "8200"]).expect_int(), 1);
    assert_eq!(d.cmd(&["GETBIT", "{t3}bm", "6"]).expect_int(), 0);
}

#[test]
fn migrates_stream_entries_and_id_state() {
    let (_dir, src, dst) = setup_pair(&[]);
    let mut s = src.connect();
    s.cmd(&["XADD", "{t4}st", "1-0", "f", "v1"]).expect_bulk();
    s.cmd(&["XADD", "{t4}st", "3-0", "f", "v2"]).expect_bulk();
    s.cmd(&["XADD", "{t4}st", "5-0", "f", "v3"]).expect_bulk();

    migrate_sync(&src, &dst, key_slot(b"{t4}st")).expect_ok();

    let mut d = dst.connect();
    let entries = d.cmd(&["XRANGE", "{t4}st", "-", "+"]).expect_array().to_vec();
    assert_eq!(entries.len(), 3);
    let first_id = entries[0].expect_array()[0].expect_bulk();
    assert_eq!(first_id, b"1-0");

    // XSETID carried the top id over: an older id is rejected on dst.
    let err = d
        .cmd(&["XADD", "{t4}st", "4-0", "f", "late"])
        .expect_error()
        .to_string();
    assert!(err.contains("equal or smaller"), "unexpected error {err}");
    d.cmd(&["XADD", "{t4}st", "6-0", "f", "next"]).expect_bulk();
}

#[test]
fn empty_slot_migrates_successfully() {
    let (_dir, src, dst) = setup_pair(&[]);
    let slot = key_slot(b"{t5-empty}");
    migrate_sync(&src, &dst, slot).expect_ok();
    let info = migrate_info(&src);
    assert!(info.contains("migrating_state: success"), "info: {info}");
}

#[test]
fn slot_with_only_expired_keys_migrates_clean() {
    let (_dir, src, dst) = setup_pair(&[]);
    let mut s = src.connect();
    s.cmd(&["SET", "{t6}gone", "v", "PX", "50"]).expect_ok();
    std::thread::sleep(std::time::Duration::from_millis(120));

    migrate_sync(&src, &dst, key_slot(b"{t6}gone")).expect_ok();

    let mut d = dst.connect();
    assert_eq!(d.cmd(&["GET", "{t6}gone"]), Reply::Nil);
    assert_eq!(d.cmd(&["EXISTS", "{t6}gone"]).expect_int(), 0);
}

#[test]
fn writes_during_migration_are_replayed_from_wal() {
    // Throttle the snapshot stage so a concurrent write lands mid-flight.
    let (_dir, src, dst) = setup_pair(&["--migrate-speed", "200", "--migrate-pipeline-size", "4"]);
    let mut s = src.connect();
    for i in 0..300 {
        s.cmd(&["SET", &format!("{{t7}}k{i}"), "v"]).expect_ok();
    }

    let slot = key_slot(b"{t7}k0");
    migrate_async(&src, &dst, slot).expect_ok();
    std::thread::sleep(std::time::Duration::from_millis(100));

    // The slot is not frozen yet, so this commits on the source after the
    // snapshot sequence; the WAL phase must deliver it.
    s.cmd(&["SET", "{t7}late", "v-late"]).expect_ok();

    wait_until("migration success", || {
        migrate_info(&src).contains("migrating_state: success")
    });
    let mut d = dst.connect();
    assert_eq!(d.cmd(&["GET", "{t7}late"]), Reply::Bulk(b"v-late".to_vec()));
    assert_eq!(d.cmd(&["GET", "{t7}k299"]), Reply::Bulk(b"v".to_vec()));
}

#[test]
fn cancel_mid_migration_fails_job_and_unfreezes_source() {
    let (_dir, src, dst) = setup_pair(&["--migrate-speed", "50", "--migrate-pipeline-size", "1"]);
    let mut s = src.connect();
    for i in 0..100 {
        s.cmd(&["SET", &format!("{{t8}}k{i}"), "v"]).expect_ok();
    }

    let slot = key_slot(b"{t8}k0");
    migrate_async(&src, &dst, slot).expect_ok();
    std::thread::sleep(std::time::Duration::from_millis(200));
    s.cmd(&["CLUSTERX", "MIGRATESTOP"]).expect_ok();

    wait_until("migration failed", || {
        migrate_info(&src).contains("migrating_state: fail")
    });

    // Writes to the slot succeed again on the source.
    s.cmd(&["SET", "{t8}new", "v"]).expect_ok();
    assert_eq!(src.ctx().migrate_shared.forbidden_slot(), None);
    assert_eq!(src.ctx().storage.open_snapshot_count(), 0);

    // The destination rolled the partial transfer back.
    wait_until("destination rollback", || {
        let mut d = dst.connect();
        d.cmd(&["GET", "{t8}k0"]) == Reply::Nil
    });
}

#[test]
fn raw_kv_mode_migrates_slot_data() {
    let (_dir, src, dst) = setup_pair(&["--migrate-type", "raw-kv"]);
    let mut s = src.connect();
    s.cmd(&["SET", "{t9}k", "plain"]).expect_ok();
    s.cmd(&["HSET", "{t9}h", "f1", "v1", "f2", "v2"]).expect_int();
    s.cmd(&["ZADD", "{t9}z", "2.5", "m"]).expect_int();
    s.cmd(&["XADD", "{t9}st", "9-1", "f", "v"]).expect_bulk();

    migrate_sync(&src, &dst, key_slot(b"{t9}k")).expect_ok();

    let mut d = dst.connect();
    assert_eq!(d.cmd(&["GET", "{t9}k"]), Reply::Bulk(b"plain".to_vec()));
    assert_eq!(d.cmd(&["HGETALL", "{t9}h"]).expect_array().len(), 4);
    assert_eq!(d.cmd(&["ZSCORE", "{t9}z", "m"]).expect_bulk(), b"2.5");
    let entries = d.cmd(&["XRANGE", "{t9}st", "-", "+"]).expect_array().to_vec();
    assert_eq!(entries.len(), 1);

    let info = migrate_info(&src);
    assert!(info.contains("migrating_state: success"), "info: {info}");
}

#[test]
fn auth_gates_clients_and_migration_handshake() {
    let dir = tempfile::tempdir().expect("tempdir");
    let src = start_node(&dir.path().join("src"), &["--requirepass", "hunter2"]);
    let dst = start_node(&dir.path().join("dst"), &["--requirepass", "hunter2"]);

    let mut s = src.connect();
    let err = s.cmd(&["SET", "{ta}k", "v"]).expect_error().to_string();
    assert!(err.starts_with("NOAUTH"), "unexpected error {err}");
    let err = s.cmd(&["AUTH", "wrong"]).expect_error().to_string();
    assert!(err.contains("invalid password"), "unexpected error {err}");
    s.cmd(&["AUTH", "hunter2"]).expect_ok();
    s.cmd(&["SET", "{ta}k", "v"]).expect_ok();

    let slot = key_slot(b"{ta}k");
    s.cmd(&[
        "CLUSTERX",
        "MIGRATE",
        &slot.to_string(),
        "127.0.0.1",
        &dst.port().to_string(),
        "SYNC",
    ])
    .expect_ok();

    let mut d = dst.connect();
    d.cmd(&["AUTH", "hunter2"]).expect_ok();
    assert_eq!(d.cmd(&["GET", "{ta}k"]), Reply::Bulk(b"v".to_vec()));
}
