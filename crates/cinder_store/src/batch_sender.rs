//! Raw key/value batch shipping for the raw-KV migration mode.
//!
//! Ops accumulate into an encoded write-batch frame sent as one
//! `APPLYBATCH` command; the destination acknowledges each frame with a
//! single RESP reply. Batches are capped by size and the outgoing byte rate
//! is limited per second. A log-data prefix identifying the value type is
//! planted at the head of each batch so the destination can reconstruct
//! metadata.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use crate::resp::{encode_command, read_replies};
use crate::wal::{encode_ops, ColumnFamily, WalOp};

pub struct BatchSender<'a, S: Read + Write> {
    stream: &'a mut S,
    max_bytes: usize,
    bytes_per_sec: u64,
    prefix_log_data: Option<Vec<u8>>,
    pending: Vec<WalOp>,
    pending_bytes: usize,
    sent_bytes: u64,
    sent_batches: u64,
    sent_entries: u64,
    window_start: Instant,
    window_bytes: u64,
}

impl<'a, S: Read + Write> BatchSender<'a, S> {
    pub fn new(stream: &'a mut S, max_bytes: usize, bytes_per_sec: u64) -> Self {
        Self {
            stream,
            max_bytes: max_bytes.max(1),
            bytes_per_sec,
            prefix_log_data: None,
            pending: Vec::new(),
            pending_bytes: 0,
            sent_bytes: 0,
            sent_batches: 0,
            sent_entries: 0,
            window_start: Instant::now(),
            window_bytes: 0,
        }
    }

    /// Log-data planted at the head of every batch started afterwards.
    pub fn set_prefix_log_data(&mut self, payload: Vec<u8>) {
        self.prefix_log_data = Some(payload);
    }

    /// Tunables may be changed mid-migration; apply them on the next send.
    pub fn set_limits(&mut self, max_bytes: usize, bytes_per_sec: u64) {
        self.max_bytes = max_bytes.max(1);
        self.bytes_per_sec = bytes_per_sec;
    }

    pub fn put(&mut self, cf: ColumnFamily, key: Vec<u8>, value: Vec<u8>) {
        self.ensure_prefix();
        self.pending_bytes += key.len() + value.len() + 16;
        self.sent_entries += 1;
        self.pending.push(WalOp::Put { cf, key, value });
    }

    pub fn delete(&mut self, cf: ColumnFamily, key: Vec<u8>) {
        self.ensure_prefix();
        self.pending_bytes += key.len() + 16;
        self.sent_entries += 1;
        self.pending.push(WalOp::Delete { cf, key });
    }

    pub fn put_log_data(&mut self, payload: Vec<u8>) {
        self.ensure_prefix();
        self.pending_bytes += payload.len() + 8;
        self.pending.push(WalOp::LogData { payload });
    }

    pub fn is_full(&self) -> bool {
        self.pending_bytes >= self.max_bytes
    }

    /// Flush the pending batch (no-op when empty) and await its single
    /// acknowledgement.
    pub fn send(&mut self, should_stop: &dyn Fn() -> bool) -> anyhow::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let blob = encode_ops(&self.pending);
        self.throttle(blob.len());

        let frame = encode_command(&[b"APPLYBATCH".as_ref(), &blob]);
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        read_replies(self.stream, 1, should_stop)?;

        self.sent_bytes += frame.len() as u64;
        self.sent_batches += 1;
        self.pending.clear();
        self.pending_bytes = 0;
        Ok(())
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes
    }

    pub fn sent_batches(&self) -> u64 {
        self.sent_batches
    }

    pub fn sent_entries(&self) -> u64 {
        self.sent_entries
    }

    fn ensure_prefix(&mut self) {
        if self.pending.is_empty() {
            if let Some(payload) = self.prefix_log_data.clone() {
                self.pending_bytes += payload.len() + 8;
                self.pending.push(WalOp::LogData { payload });
            }
        }
    }

    /// Advisory byte-rate cap: sleep out the current one-second window when
    /// the next frame would exceed it. Never drops data.
    fn throttle(&mut self, frame_len: usize) {
        if self.bytes_per_sec == 0 {
            return;
        }
        let elapsed = self.window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            self.window_start = Instant::now();
            self.window_bytes = 0;
        } else if self.window_bytes + frame_len as u64 > self.bytes_per_sec {
            std::thread::sleep(Duration::from_secs(1).saturating_sub(elapsed));
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
        self.window_bytes += frame_len as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::decode_ops;

    struct FakeConn {
        replies: Vec<u8>,
        written: Vec<u8>,
    }

    impl FakeConn {
        fn new(replies: &[u8]) -> Self {
            Self {
                replies: replies.to_vec(),
                written: Vec::new(),
            }
        }
    }

    impl Read for FakeConn {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.replies.len().min(buf.len());
            buf[..n].copy_from_slice(&self.replies[..n]);
            self.replies.drain(..n);
            Ok(n)
        }
    }

    impl Write for FakeConn {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn sends_one_applybatch_frame_with_prefix_log_data() {
        let mut conn = FakeConn::new(b"+OK\r\n");
        let mut sender = BatchSender::new(&mut conn, 1024 * 1024, 0);
        sender.set_prefix_log_data(vec![7, 7, 7]);
        sender.put(ColumnFamily::Metadata, b"k".to_vec(), b"v".to_vec());
        sender.delete(ColumnFamily::Subkey, b"s".to_vec());
        sender.send(&|| false).unwrap();

        assert_eq!(sender.sent_batches(), 1);
        assert_eq!(sender.sent_entries(), 2);
        assert!(sender.sent_bytes() > 0);

        let written = conn.written.clone();
        let header = b"*2\r\n$10\r\nAPPLYBATCH\r\n";
        assert!(written.starts_with(header));
        // Recover the blob from the frame and check op order.
        let rest = &written[header.len()..];
        let len_end = rest.iter().position(|b| *b == b'\r').unwrap();
        let blob_len: usize = String::from_utf8_lossy(&rest[1..len_end]).parse().unwrap();
        let blob = &rest[len_end + 2..len_end + 2 + blob_len];
        let ops = decode_ops(blob).unwrap();
        assert_eq!(ops.len(), 3);
        assert!(matches!(&ops[0], WalOp::LogData { payload } if payload == &vec![7, 7, 7]));
    }

    #[test]
    fn empty_send_is_a_no_op() {
        let mut conn = FakeConn::new(b"");
        let mut sender = BatchSender::new(&mut conn, 16, 0);
        sender.send(&|| false).unwrap();
        assert_eq!(sender.sent_batches(), 0);
        assert!(conn.written.is_empty());
    }

    #[test]
    fn fills_up_by_byte_cap() {
        let mut conn = FakeConn::new(b"+OK\r\n+OK\r\n");
        let mut sender = BatchSender::new(&mut conn, 64, 0);
        assert!(!sender.is_full());
        sender.put(
            ColumnFamily::Subkey,
            vec![0u8; 32],
            vec![0u8; 32],
        );
        assert!(sender.is_full());
        sender.send(&|| false).unwrap();
        assert!(!sender.is_full());
    }

    #[test]
    fn error_reply_fails_the_batch() {
        let mut conn = FakeConn::new(b"-ERR import not started\r\n");
        let mut sender = BatchSender::new(&mut conn, 1024, 0);
        sender.put(ColumnFamily::Metadata, b"k".to_vec(), b"v".to_vec());
        let err = sender.send(&|| false).unwrap_err();
        assert!(err.to_string().contains("import not started"));
    }
}
