//! RESP plumbing for the destination link: command encoding and the
//! count-N reply parser.
//!
//! The migration engine pipelines commands and must then observe exactly N
//! top-level replies before the pipeline counts as delivered. Replies are
//! never interpreted beyond their shape: `+`/`:` complete immediately, `$n`
//! completes after `n + 2` bytes, `*n` after peeling `n` CRLF-terminated
//! elements, and any `-` reply fails the whole job.

use std::io::Read;

/// Encode a command as a RESP array of bulk strings.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + args.iter().map(|a| a.as_ref().len() + 16).sum::<usize>());
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        let arg = arg.as_ref();
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParserState {
    ExpectHeader,
    ReadBulk { remaining: usize },
    ReadArrayElements { remaining: usize },
}

/// Incremental reply counter over a byte stream.
pub struct ReplyParser {
    state: ParserState,
    buf: Vec<u8>,
    consumed: usize,
    completed: usize,
}

impl Default for ReplyParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::ExpectHeader,
            buf: Vec::new(),
            consumed: 0,
            completed: 0,
        }
    }

    /// Number of complete top-level replies observed so far.
    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Feed bytes and advance the state machine as far as possible.
    pub fn feed(&mut self, data: &[u8]) -> anyhow::Result<usize> {
        self.buf.extend_from_slice(data);
        loop {
            match self.state {
                ParserState::ExpectHeader => {
                    let Some(line) = self.take_line() else { break };
                    anyhow::ensure!(!line.is_empty(), "empty reply header");
                    let rest = String::from_utf8_lossy(&line[1..]).into_owned();
                    match line[0] {
                        b'-' => anyhow::bail!("destination replied with an error: {rest}"),
                        b'+' | b':' => self.completed += 1,
                        b'$' => {
                            let len: i64 = rest
                                .parse()
                                .map_err(|_| anyhow::anyhow!("bad bulk length {rest:?}"))?;
                            if len < 0 {
                                // Nil bulk has no payload bytes.
                                self.completed += 1;
                            } else {
                                self.state = ParserState::ReadBulk {
                                    remaining: len as usize + 2,
                                };
                            }
                        }
                        b'*' => {
                            let len: i64 = rest
                                .parse()
                                .map_err(|_| anyhow::anyhow!("bad array length {rest:?}"))?;
                            if len <= 0 {
                                self.completed += 1;
                            } else {
                                self.state = ParserState::ReadArrayElements {
                                    remaining: len as usize,
                                };
                            }
                        }
                        other => anyhow::bail!(
                            "unexpected reply header byte {:?}",
                            char::from(other)
                        ),
                    }
                }
                ParserState::ReadBulk { remaining } => {
                    if self.available() < remaining {
                        break;
                    }
                    self.consumed += remaining;
                    self.completed += 1;
                    self.state = ParserState::ExpectHeader;
                }
                ParserState::ReadArrayElements { remaining } => {
                    // Elements are only length-peeled to their CRLF; their
                    // payloads are not interpreted.
                    let Some(_line) = self.take_line() else { break };
                    if remaining == 1 {
                        self.completed += 1;
                        self.state = ParserState::ExpectHeader;
                    } else {
                        self.state = ParserState::ReadArrayElements {
                            remaining: remaining - 1,
                        };
                    }
                }
            }
        }
        self.compact();
        Ok(self.completed)
    }

    fn available(&self) -> usize {
        self.buf.len() - self.consumed
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let window = &self.buf[self.consumed..];
        let pos = window.windows(2).position(|pair| pair == b"\r\n")?;
        let line = window[..pos].to_vec();
        self.consumed += pos + 2;
        Some(line)
    }

    fn compact(&mut self) {
        if self.consumed > 0 {
            self.buf.drain(..self.consumed);
            self.consumed = 0;
        }
    }
}

/// Read from `stream` until `expected` replies have been parsed.
///
/// Read timeouts are not fatal: they re-poll the cancellation flag and retry,
/// so a stalled destination is escaped through `Cancel` rather than a
/// deadline.
pub fn read_replies(
    stream: &mut impl Read,
    expected: usize,
    should_stop: &dyn Fn() -> bool,
) -> anyhow::Result<()> {
    if expected == 0 {
        return Ok(());
    }
    let mut parser = ReplyParser::new();
    let mut buf = [0u8; 16 * 1024];
    while parser.completed() < expected {
        if should_stop() {
            anyhow::bail!(crate::slot_migrate::ERR_MIGRATION_CANCELED);
        }
        match stream.read(&mut buf) {
            Ok(0) => anyhow::bail!("connection closed by destination"),
            Ok(n) => {
                parser.feed(&buf[..n])?;
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_bulk_string_arrays() {
        let bytes = encode_command(&[b"SET".as_ref(), b"k", b"v1"]);
        assert_eq!(bytes, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$2\r\nv1\r\n");
    }

    #[test]
    fn counts_simple_and_integer_replies() {
        let mut parser = ReplyParser::new();
        assert_eq!(parser.feed(b"+OK\r\n:1\r\n:42\r\n").unwrap(), 3);
    }

    #[test]
    fn counts_bulk_and_nil_replies() {
        let mut parser = ReplyParser::new();
        assert_eq!(parser.feed(b"$5\r\nhello\r\n$-1\r\n$0\r\n\r\n").unwrap(), 3);
    }

    #[test]
    fn peels_array_elements_without_interpreting() {
        let mut parser = ReplyParser::new();
        assert_eq!(parser.feed(b"*2\r\n:0\r\n:1\r\n+OK\r\n").unwrap(), 2);
        let mut empty = ReplyParser::new();
        assert_eq!(empty.feed(b"*0\r\n*-1\r\n").unwrap(), 2);
    }

    #[test]
    fn handles_replies_split_across_feeds() {
        let mut parser = ReplyParser::new();
        assert_eq!(parser.feed(b"$5\r\nhel").unwrap(), 0);
        assert_eq!(parser.feed(b"lo\r\n+O").unwrap(), 1);
        assert_eq!(parser.feed(b"K\r\n").unwrap(), 2);
    }

    #[test]
    fn error_reply_fails_immediately() {
        let mut parser = ReplyParser::new();
        assert_eq!(parser.feed(b"+OK\r\n+OK\r\n").unwrap(), 2);
        let err = parser.feed(b"-ERR nope\r\n").unwrap_err();
        assert!(err.to_string().contains("ERR nope"));
    }

    #[test]
    fn read_replies_drains_exactly_expected_count() {
        let mut input: &[u8] = b"+OK\r\n+OK\r\n+OK\r\n";
        read_replies(&mut input, 3, &|| false).unwrap();
    }

    #[test]
    fn read_replies_observes_cancellation() {
        struct Stalled;
        impl Read for Stalled {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::from(std::io::ErrorKind::TimedOut))
            }
        }
        let err = read_replies(&mut Stalled, 1, &|| true).unwrap_err();
        assert!(err
            .to_string()
            .contains("task cancellation"));
    }
}
