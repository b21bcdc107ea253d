//! Memcached text protocol
//!
//! Tracks a client/server conversation well enough to account for
//! retrievals: `get`/`gets` responses produce one event per returned
//! value, storage commands have their bodies skipped, everything else has
//! its one-line response discarded.

use tracing::trace;

use super::{Conversation, Event, EventKind, FsmError};
use crate::assembly::reader::ReadError;

const CRLF_LEN: usize = 2;

/// The 0x80 magic byte of the memcached binary protocol.
const BINARY_MAGIC: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Check for the binary protocol before interpreting anything.
    PeekMagicByte,
    ReadCommand,
    ReadArgs,
    HandleGet,
    HandleSet,
    DiscardResponse,
}

/// State machine for a memcached text conversation.
pub struct MctextFsm {
    state: State,
    cmd: String,
    args: Vec<String>,
}

impl Default for MctextFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl MctextFsm {
    pub fn new() -> Self {
        Self {
            state: State::PeekMagicByte,
            cmd: String::new(),
            args: Vec::new(),
        }
    }

    pub(super) fn soft_reset(&mut self) {
        self.state = State::ReadCommand;
    }

    /// Execute the current state. `Ok` means another state follows
    /// immediately; errors follow the run-loop contract.
    pub(super) fn step(&mut self, conv: &mut Conversation) -> Result<(), FsmError> {
        match self.state {
            State::PeekMagicByte => self.peek_magic_byte(conv),
            State::ReadCommand => self.read_command(conv),
            State::ReadArgs => self.read_args(conv),
            State::HandleGet => self.handle_get(conv),
            State::HandleSet => self.handle_set(conv),
            State::DiscardResponse => self.discard_response(conv),
        }
    }

    fn peek_magic_byte(&mut self, conv: &mut Conversation) -> Result<(), FsmError> {
        conv.server.truncate();
        let first = match conv.client.peek_n(1) {
            Ok(out) => out[0],
            Err(ReadError::LostData(_)) => {
                // retry from the start of a fresh client packet
                conv.client.truncate();
                return Err(ReadError::ShortRead.into());
            }
            Err(e) => return Err(e.into()),
        };
        if first == BINARY_MAGIC {
            trace!("looks like binary protocol, ignoring connection");
            return Err(FsmError::Closed);
        }
        self.state = State::ReadCommand;
        Ok(())
    }

    fn read_command(&mut self, conv: &mut Conversation) -> Result<(), FsmError> {
        self.args.clear();
        // any pipelined server bytes belong to a command we never saw
        conv.server.truncate();
        let pos = conv.client.index_any(b" \n")?;
        let word = conv.client.read_n(pos + 1)?;
        let delim = word[word.len() - 1];
        let verb = trim_right(word, b" \r\n");

        if verb.is_empty() || !verb.iter().all(|b| b.is_ascii_alphabetic()) {
            return Err(FsmError::Desync);
        }
        self.cmd = String::from_utf8_lossy(verb).into_owned();
        trace!(cmd = %self.cmd, "read command");

        self.state = if delim == b' ' {
            State::ReadArgs
        } else {
            self.dispatch()?
        };
        Ok(())
    }

    fn read_args(&mut self, conv: &mut Conversation) -> Result<(), FsmError> {
        conv.server.truncate();
        let pos = conv.client.index_any(b" \n")?;
        let word = conv.client.read_n(pos + 1)?;
        let delim = word[word.len() - 1];
        let arg = trim_right(&word[..word.len() - 1], b"\r");
        self.args.push(String::from_utf8_lossy(arg).into_owned());
        if delim == b' ' {
            return Ok(());
        }
        trace!(cmd = %self.cmd, args = ?self.args, "read arguments");
        self.state = self.dispatch()?;
        Ok(())
    }

    /// State to enter once the complete client request line has been read.
    fn dispatch(&self) -> Result<State, FsmError> {
        Ok(match self.cmd.as_str() {
            "get" | "gets" => State::HandleGet,
            "set" | "add" | "replace" | "append" | "prepend" | "cas" => State::HandleSet,
            "quit" => return Err(FsmError::Closed),
            _ => State::DiscardResponse,
        })
    }

    fn handle_get(&mut self, conv: &mut Conversation) -> Result<(), FsmError> {
        if self.args.is_empty() {
            self.state = State::DiscardResponse;
            return Ok(());
        }
        loop {
            let line = conv.server.read_line()?;
            let mut fields = line.split(|&b| b == b' ');
            let header = fields.next().unwrap_or_default();
            if header != b"VALUE" {
                // typically END
                self.state = State::ReadCommand;
                return Ok(());
            }
            let key = fields.next();
            let _flags = fields.next();
            let size = fields.next();
            let (Some(key), Some(size)) = (key, size) else {
                self.state = State::ReadCommand;
                return Ok(());
            };
            let size = parse_usize(size).ok_or(FsmError::Desync)?;
            let key = String::from_utf8_lossy(key).into_owned();
            trace!(key = %key, size, "get hit");
            conv.add_event(Event {
                kind: EventKind::GetHit,
                key,
                size,
            });
            conv.server.discard(size + CRLF_LEN)?;
        }
    }

    fn handle_set(&mut self, conv: &mut Conversation) -> Result<(), FsmError> {
        let size = self.args.get(3).and_then(|s| s.parse::<usize>().ok());
        let Some(size) = size else {
            self.state = State::DiscardResponse;
            return Ok(());
        };
        trace!(cmd = %self.cmd, size, "discarding value body");
        conv.client.discard(size + CRLF_LEN)?;
        self.state = State::DiscardResponse;
        Ok(())
    }

    fn discard_response(&mut self, conv: &mut Conversation) -> Result<(), FsmError> {
        let line = conv.server.read_line()?;
        trace!(reply = %String::from_utf8_lossy(line), "discarded response");
        self.state = State::ReadCommand;
        Ok(())
    }
}

fn trim_right<'a>(mut bytes: &'a [u8], cut: &[u8]) -> &'a [u8] {
    while let Some(&last) = bytes.last() {
        if cut.contains(&last) {
            bytes = &bytes[..bytes.len() - 1];
        } else {
            break;
        }
    }
    bytes
}

fn parse_usize(bytes: &[u8]) -> Option<usize> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::reader::Reader;
    use crate::protocol::testing::{hit, CollectSink};
    use crate::protocol::{Consumer, Fsm};
    use std::sync::Arc;

    fn new_consumer() -> (Consumer, Arc<CollectSink>) {
        let sink = Arc::new(CollectSink::default());
        let c = Consumer::new(
            Reader::new(),
            Reader::new(),
            Fsm::Mctext(MctextFsm::new()),
            sink.clone(),
        );
        (c, sink)
    }

    /// Drive a conversation where the server sends `lines` in response to
    /// a `get`, and return the collected events.
    fn run_get(server_lines: &[&str]) -> Vec<Event> {
        let (mut c, sink) = new_consumer();
        c.write_client(0, b"get key1 key2\r\n");
        c.run();
        let mut body = Vec::new();
        for line in server_lines {
            body.extend_from_slice(line.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        c.write_server(0, &body);
        c.run();
        let _ = c.into_readers();
        let events = sink.events.lock();
        events.clone()
    }

    #[test]
    fn test_get_multi() {
        let events = run_get(&[
            "VALUE key1 0 5",
            "hello",
            "VALUE key2 10 5",
            "world",
            "END",
        ]);
        assert_eq!(events, vec![hit("key1", 5), hit("key2", 5)]);
    }

    #[test]
    fn test_get_empty_value() {
        let events = run_get(&["VALUE key3|foo 32 0", "", "END"]);
        assert_eq!(events, vec![hit("key3|foo", 0)]);
    }

    #[test]
    fn test_get_truncated_header() {
        // a short trailing header emits no event and no error
        let events = run_get(&["VALUE key1 42 5", "world", "VALUE "]);
        assert_eq!(events, vec![hit("key1", 5)]);
    }

    #[test]
    fn test_value_split_across_writes() {
        let (mut c, sink) = new_consumer();
        c.write_client(0, b"get ke");
        c.run();
        c.write_client(0, b"y1\r\n");
        c.run();
        c.write_server(0, b"VALUE key1 0 10\r\nhel");
        c.run();
        c.write_server(0, b"lo");
        c.run();
        c.write_server(0, b"world\r\nEND\r\n");
        c.run();
        let _ = c.into_readers();
        assert_eq!(*sink.events.lock(), vec![hit("key1", 10)]);
    }

    #[test]
    fn test_set_body_is_skipped() {
        let (mut c, sink) = new_consumer();
        c.write_client(0, b"set key1 0 0 5\r\nhello\r\n");
        c.run();
        c.write_server(0, b"STORED\r\n");
        c.run();
        c.write_client(0, b"get key2\r\n");
        c.run();
        c.write_server(0, b"VALUE key2 0 3\r\nabc\r\nEND\r\n");
        c.run();
        let _ = c.into_readers();
        assert_eq!(*sink.events.lock(), vec![hit("key2", 3)]);
    }

    #[test]
    fn test_set_body_discarded_before_arrival() {
        // the parser discards the value body before the bytes exist
        let (mut c, sink) = new_consumer();
        c.write_client(0, b"set key1 0 0 5\r\n");
        c.run();
        c.write_client(0, b"hello\r\n");
        c.write_server(0, b"STORED\r\n");
        c.run();
        c.write_client(0, b"get key2\r\n");
        c.run();
        c.write_server(0, b"VALUE key2 0 1\r\nx\r\nEND\r\n");
        c.run();
        let _ = c.into_readers();
        assert_eq!(*sink.events.lock(), vec![hit("key2", 1)]);
    }

    #[test]
    fn test_unknown_command_response_discarded() {
        let (mut c, sink) = new_consumer();
        c.write_client(0, b"stats\r\n");
        c.run();
        c.write_server(0, b"END\r\n");
        c.run();
        c.write_client(0, b"get key1\r\n");
        c.run();
        c.write_server(0, b"VALUE key1 0 2\r\nhi\r\nEND\r\n");
        c.run();
        let _ = c.into_readers();
        assert_eq!(*sink.events.lock(), vec![hit("key1", 2)]);
    }

    #[test]
    fn test_binary_magic_closes_connection() {
        let (mut c, sink) = new_consumer();
        c.write_client(0, &[0x80, 0x0c, 0x00, 0x00]);
        c.run();
        assert!(c.is_done());
        assert!(sink.events.lock().is_empty());
    }

    #[test]
    fn test_quit_closes_connection() {
        let (mut c, _sink) = new_consumer();
        c.write_client(0, b"quit\r\n");
        c.run();
        assert!(c.is_done());
    }

    #[test]
    fn test_non_ascii_verb_resyncs() {
        let (mut c, sink) = new_consumer();
        c.write_client(0, b"\x01\x02\x03 x\r\n");
        c.run();
        assert!(!c.is_done());
        // after resync a clean exchange still parses
        c.write_client(0, b"get key1\r\n");
        c.run();
        c.write_server(0, b"VALUE key1 0 2\r\nhi\r\nEND\r\n");
        c.run();
        let _ = c.into_readers();
        assert_eq!(*sink.events.lock(), vec![hit("key1", 2)]);
    }

    #[test]
    fn test_server_loss_recovery() {
        let (mut c, sink) = new_consumer();
        c.write_client(0, b"get key1 key2\r\n");
        c.run();
        c.write_server(0, b"VALUE key1 0 5\r\nworld\r\n");
        c.run();
        // 7 bytes lost mid-response, then a later exchange
        c.write_server(7, b"END\r\n");
        c.run();
        c.write_client(0, b"get key3\r\n");
        c.run();
        c.write_server(0, b"VALUE key3 0 2\r\nok\r\nEND\r\n");
        c.run();
        let _ = c.into_readers();
        assert_eq!(*sink.events.lock(), vec![hit("key1", 5), hit("key3", 2)]);
    }

    #[test]
    fn test_chunked_writes_any_partition() {
        let client: &[u8] = b"get key1\r\n";
        let server: &[u8] = b"VALUE key1 3 5\r\nhello\r\nEND\r\n";
        for split in 1..server.len() {
            let (mut c, sink) = new_consumer();
            c.write_client(0, client);
            c.run();
            c.write_server(0, &server[..split]);
            c.run();
            c.write_server(0, &server[split..]);
            c.run();
            let _ = c.into_readers();
            assert_eq!(*sink.events.lock(), vec![hit("key1", 5)], "split {split}");
        }
    }
}
