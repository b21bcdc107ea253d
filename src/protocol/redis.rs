//! RESP (Redis serialization protocol)
//!
//! A stack-machine parser consumes one RESP value per top-level call,
//! suspending cleanly mid-value when the stream runs dry. Bulk bodies are
//! only materialized up to a capture limit: on the client side commands
//! are small and their keys are wanted, on the server side only the *size*
//! of a returned bulk matters, so bodies are skipped with `Discard`.

use tracing::trace;

use super::{Conversation, Event, EventKind, FsmError};
use crate::assembly::reader::Reader;

/// Largest client command we materialize for key extraction.
const MAX_COMMAND_SIZE: usize = 1024;

/// Protects against pathologically nested arrays.
const MAX_PARSE_DEPTH: usize = 64;

const TAG_STATUS: u8 = b'+';
const TAG_ERROR: u8 = b'-';
const TAG_INT: u8 = b':';
const TAG_BULK: u8 = b'$';
const TAG_ARRAY: u8 = b'*';

/// A parsed RESP value. Bulks over the capture limit are reduced to their
/// size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// The RESP nil bulk (`$-1`) or nil array.
    Null,
    Int(i64),
    Simple(String),
    Error(String),
    /// A bulk captured within the limit.
    Bytes(Vec<u8>),
    /// A bulk beyond the capture limit; the body was discarded.
    Size(i64),
    Array(Vec<Value>),
}

/// One suspended production of the parser.
#[derive(Debug)]
enum Frame {
    /// Read a tag byte and dispatch.
    Value,
    /// Read one line as a simple string or error.
    Line { as_error: bool },
    /// Read one line as an integer.
    Int,
    /// Consume the integer length below and read or skip the body.
    BulkHeader,
    /// Read a captured bulk body of `n` bytes plus CRLF.
    BulkBody { n: usize },
    /// Consume the integer count below and collect that many values.
    ArrayHeader,
    ArrayElems { remaining: usize, items: Vec<Value> },
}

/// Re-entrant RESP parser over one stream direction.
#[derive(Debug)]
pub struct RespParser {
    stack: Vec<Frame>,
    /// Result of the most recently completed frame, consumed by its
    /// parent.
    pending: Option<Value>,
    bulk_capture_limit: usize,
}

impl RespParser {
    fn new(bulk_capture_limit: usize) -> Self {
        Self {
            stack: vec![Frame::Value],
            pending: None,
            bulk_capture_limit,
        }
    }

    fn reset(&mut self, bulk_capture_limit: usize) {
        self.stack.clear();
        self.stack.push(Frame::Value);
        self.pending = None;
        self.bulk_capture_limit = bulk_capture_limit;
    }

    /// Parse one complete value from `r`, resuming any suspended parse.
    /// `ShortRead` leaves the parser state intact for re-entry.
    fn run(&mut self, r: &mut Reader) -> Result<Value, FsmError> {
        loop {
            let Some(frame) = self.stack.pop() else {
                // a finished parse leaves the machine primed for the next
                self.stack.push(Frame::Value);
                return Ok(self.pending.take().unwrap_or(Value::Null));
            };
            match frame {
                Frame::Value => {
                    let tag = match r.read_n(1) {
                        Ok(out) => out[0],
                        Err(e) => {
                            self.stack.push(Frame::Value);
                            return Err(e.into());
                        }
                    };
                    if self.stack.len() + 2 > MAX_PARSE_DEPTH {
                        return Err(FsmError::Resp);
                    }
                    match tag {
                        TAG_STATUS => self.stack.push(Frame::Line { as_error: false }),
                        TAG_ERROR => self.stack.push(Frame::Line { as_error: true }),
                        TAG_INT => self.stack.push(Frame::Int),
                        TAG_BULK => {
                            self.stack.push(Frame::BulkHeader);
                            self.stack.push(Frame::Int);
                        }
                        TAG_ARRAY => {
                            self.stack.push(Frame::ArrayHeader);
                            self.stack.push(Frame::Int);
                        }
                        _ => return Err(FsmError::Resp),
                    }
                }
                Frame::Line { as_error } => {
                    let line = match r.read_line() {
                        Ok(out) => out,
                        Err(e) => {
                            self.stack.push(Frame::Line { as_error });
                            return Err(e.into());
                        }
                    };
                    let s = String::from_utf8_lossy(line).into_owned();
                    self.pending = Some(if as_error {
                        Value::Error(s)
                    } else {
                        Value::Simple(s)
                    });
                }
                Frame::Int => {
                    let line = match r.read_line() {
                        Ok(out) => out,
                        Err(e) => {
                            self.stack.push(Frame::Int);
                            return Err(e.into());
                        }
                    };
                    let n = parse_i64(line).ok_or(FsmError::Resp)?;
                    self.pending = Some(Value::Int(n));
                }
                Frame::BulkHeader => {
                    let n = self.take_int()?;
                    if n < 0 {
                        self.pending = Some(Value::Null);
                    } else if n as usize <= self.bulk_capture_limit {
                        self.stack.push(Frame::BulkBody { n: n as usize });
                    } else {
                        // skip the body; only its size is retained. The
                        // discard may outrun the buffered data and become
                        // a debt against future writes.
                        r.discard(n as usize + 2)?;
                        self.pending = Some(Value::Size(n));
                    }
                }
                Frame::BulkBody { n } => {
                    let body = match r.read_n(n) {
                        Ok(out) => out.to_vec(),
                        Err(e) => {
                            self.stack.push(Frame::BulkBody { n });
                            return Err(e.into());
                        }
                    };
                    r.discard(2)?;
                    self.pending = Some(Value::Bytes(body));
                }
                Frame::ArrayHeader => {
                    let n = self.take_int()?;
                    if n <= 0 {
                        self.pending = Some(if n < 0 {
                            Value::Null
                        } else {
                            Value::Array(Vec::new())
                        });
                    } else {
                        self.stack.push(Frame::ArrayElems {
                            remaining: n as usize,
                            items: Vec::new(),
                        });
                        self.stack.push(Frame::Value);
                    }
                }
                Frame::ArrayElems {
                    mut remaining,
                    mut items,
                } => {
                    let value = self.pending.take().ok_or(FsmError::Resp)?;
                    items.push(value);
                    remaining -= 1;
                    if remaining == 0 {
                        self.pending = Some(Value::Array(items));
                    } else {
                        self.stack.push(Frame::ArrayElems { remaining, items });
                        self.stack.push(Frame::Value);
                    }
                }
            }
        }
    }

    fn take_int(&mut self) -> Result<i64, FsmError> {
        match self.pending.take() {
            Some(Value::Int(n)) => Ok(n),
            _ => Err(FsmError::Resp),
        }
    }
}

fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

#[derive(Debug)]
enum State {
    ReadCommand,
    HandleGet { key: String },
    DiscardResponse,
}

/// State machine for a RESP conversation.
pub struct RedisFsm {
    state: State,
    parser: RespParser,
}

impl Default for RedisFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl RedisFsm {
    pub fn new() -> Self {
        Self {
            state: State::ReadCommand,
            parser: RespParser::new(MAX_COMMAND_SIZE),
        }
    }

    pub(super) fn soft_reset(&mut self) {
        self.transition(false, State::ReadCommand);
    }

    /// Install the next state, repointing the parser at the right stream
    /// direction: commands are captured, response bulks are skipped.
    fn transition(&mut self, from_server: bool, state: State) {
        let limit = if from_server { 0 } else { MAX_COMMAND_SIZE };
        self.parser.reset(limit);
        self.state = state;
    }

    pub(super) fn step(&mut self, conv: &mut Conversation) -> Result<(), FsmError> {
        match &mut self.state {
            State::ReadCommand => {
                conv.server.truncate();
                let value = self.parser.run(&mut conv.client)?;
                let fields = bulk_fields(&value).ok_or(FsmError::Resp)?;
                let Some(cmd) = fields.first() else {
                    return Err(FsmError::Resp);
                };
                let cmd = cmd.to_ascii_lowercase();
                trace!(cmd = %String::from_utf8_lossy(&cmd), "read command");
                match cmd.as_slice() {
                    b"get" | b"mget" => {
                        let Some(key) = fields.get(1) else {
                            return Err(FsmError::Resp);
                        };
                        let key = String::from_utf8_lossy(key).into_owned();
                        self.transition(true, State::HandleGet { key });
                    }
                    _ => self.transition(true, State::DiscardResponse),
                }
                Ok(())
            }
            State::HandleGet { key } => {
                let key = key.clone();
                let value = self.parser.run(&mut conv.server)?;
                match value {
                    Value::Null => conv.add_event(Event {
                        kind: EventKind::GetMiss,
                        key,
                        size: 0,
                    }),
                    Value::Size(n) | Value::Int(n) => conv.add_event(Event {
                        kind: EventKind::GetHit,
                        key,
                        size: n.max(0) as usize,
                    }),
                    Value::Bytes(body) => conv.add_event(Event {
                        kind: EventKind::GetHit,
                        key,
                        size: body.len(),
                    }),
                    _ => return Err(FsmError::Resp),
                }
                self.transition(false, State::ReadCommand);
                Ok(())
            }
            State::DiscardResponse => {
                self.parser.run(&mut conv.server)?;
                self.transition(false, State::ReadCommand);
                Ok(())
            }
        }
    }
}

/// View an array of captured bulks as its fields.
fn bulk_fields(value: &Value) -> Option<Vec<&[u8]>> {
    let Value::Array(items) = value else {
        return None;
    };
    items
        .iter()
        .map(|v| match v {
            Value::Bytes(b) => Some(b.as_slice()),
            _ => None,
        })
        .collect()
}
