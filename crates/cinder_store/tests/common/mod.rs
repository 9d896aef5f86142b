//! Shared helpers for integration tests: in-process nodes and a raw RESP
//! client over `std::net::TcpStream`.
#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use clap::Parser;

use cinder_store::config::NodeArgs;
use cinder_store::redis_server::ServerContext;
use cinder_store::resp::encode_command;
use cinder_store::NodeHandle;

/// Timeout for condition polling.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(20);
/// Timeout for individual RESP round-trips.
pub const RESP_TIMEOUT: Duration = Duration::from_secs(10);

/// A node running on a background tokio runtime inside this process.
pub struct TestNode {
    pub addr: SocketAddr,
    handle: Option<NodeHandle>,
    _runtime: tokio::runtime::Runtime,
}

impl TestNode {
    pub fn ctx(&self) -> &Arc<ServerContext> {
        &self.handle.as_ref().expect("node running").ctx
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn connect(&self) -> RespConn {
        RespConn::connect(self.addr)
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Start a node on a free port with extra CLI args appended.
pub fn start_node(data_dir: &Path, extra_args: &[&str]) -> TestNode {
    let mut argv: Vec<String> = vec![
        "cinder-store".to_string(),
        "--listen".to_string(),
        "127.0.0.1:0".to_string(),
        "--data-dir".to_string(),
        data_dir.display().to_string(),
    ];
    argv.extend(extra_args.iter().map(|arg| arg.to_string()));
    let args = NodeArgs::try_parse_from(argv).expect("parse node args");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("build runtime");
    let handle = runtime
        .block_on(cinder_store::start_node(args))
        .expect("start node");
    let addr = handle.addr;

    TestNode {
        addr,
        handle: Some(handle),
        _runtime: runtime,
    }
}

pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Poll `cond` until it holds or the timeout elapses.
pub fn wait_until(context: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !cond() {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for: {context}"
        );
        std::thread::sleep(Duration::from_millis(25));
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Int(i64),
    Bulk(Vec<u8>),
    Nil,
    Array(Vec<Reply>),
}

impl Reply {
    #[track_caller]
    pub fn expect_ok(&self) {
        assert_eq!(self, &Reply::Simple("OK".to_string()), "expected +OK");
    }

    #[track_caller]
    pub fn expect_int(&self) -> i64 {
        match self {
            Reply::Int(value) => *value,
            other => panic!("expected integer reply, got {other:?}"),
        }
    }

    #[track_caller]
    pub fn expect_bulk(&self) -> Vec<u8> {
        match self {
            Reply::Bulk(value) => value.clone(),
            other => panic!("expected bulk reply, got {other:?}"),
        }
    }

    #[track_caller]
    pub fn expect_error(&self) -> &str {
        match self {
            Reply::Error(message) => message,
            other => panic!("expected error reply, got {other:?}"),
        }
    }

    #[track_caller]
    pub fn expect_array(&self) -> &[Reply] {
        match self {
            Reply::Array(items) => items,
            other => panic!("expected array reply, got {other:?}"),
        }
    }
}

pub struct RespConn {
    reader: BufReader<TcpStream>,
}

impl RespConn {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect");
        stream.set_nodelay(true).ok();
        stream
            .set_read_timeout(Some(RESP_TIMEOUT))
            .expect("set read timeout");
        Self {
            reader: BufReader::new(stream),
        }
    }

    pub fn cmd(&mut self, args: &[&str]) -> Reply {
        let argv: Vec<Vec<u8>> = args.iter().map(|arg| arg.as_bytes().to_vec()).collect();
        self.cmd_bytes(&argv)
    }

    pub fn cmd_bytes(&mut self, args: &[Vec<u8>]) -> Reply {
        let frame = encode_command(args);
        self.reader
            .get_mut()
            .write_all(&frame)
            .expect("send command");
        self.read_reply()
    }

    fn read_reply(&mut self) -> Reply {
        let line = self.read_line();
        let (kind, rest) = line.split_at(1);
        match kind {
            "+" => Reply::Simple(rest.to_string()),
            "-" => Reply::Error(rest.to_string()),
            ":" => Reply::Int(rest.parse().expect("integer reply")),
            "$" => {
                let len: i64 = rest.parse().expect("bulk length");
                if len < 0 {
                    return Reply::Nil;
                }
                let mut buf = vec![0u8; len as usize + 2];
                std::io::Read::read_exact(&mut self.reader, &mut buf).expect("bulk payload");
                buf.truncate(len as usize);
                Reply::Bulk(buf)
            }
            "*" => {
                let len: i64 = rest.parse().expect("array length");
                if len < 0 {
                    return Reply::Nil;
                }
                Reply::Array((0..len).map(|_| self.read_reply()).collect())
            }
            other => panic!("unexpected reply type {other:?} in line {line:?}"),
        }
    }

    fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read reply line");
        line.trim_end_matches(['\r', '\n']).to_string()
    }
}
