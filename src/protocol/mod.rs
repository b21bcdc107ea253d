//! Protocol parsing
//!
//! Finite-state machines consume the reassembled client and server byte
//! streams of a connection and emit [`Event`]s describing cache
//! operations. A machine never blocks: each step either consumes bytes and
//! transitions, or returns a short-read indicator, in which case it is
//! re-entered when the next reassembled data arrives.

pub mod infer;
pub mod mctext;
pub mod redis;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::assembly::reader::{ReadError, Reader};

/// What sort of cache operation occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// An unhandled event.
    Unknown,
    /// A data retrieval that returned data.
    GetHit,
    /// A data retrieval that did not return data.
    GetMiss,
}

/// A single event in a datastore conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    /// Datastore key affected by this event.
    pub key: String,
    /// Size in bytes of the datastore value affected by this event.
    pub size: usize,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} ({} bytes)", self.kind, self.key, self.size)
    }
}

/// Receives batches of events from protocol consumers. Implemented by the
/// analysis pool; must be threadsafe.
pub trait EventSink: Send + Sync {
    fn handle_events(&self, evts: Vec<Event>);
}

/// Events buffered per conversation before being flushed to the sink, to
/// amortize handler calls.
const EVENT_BATCH_CAPACITY: usize = 128;

#[derive(Debug, Error)]
pub enum FsmError {
    #[error(transparent)]
    Read(#[from] ReadError),
    /// The byte stream no longer looks like the expected protocol.
    #[error("protocol desync while reading command")]
    Desync,
    /// Malformed RESP data.
    #[error("RESP protocol error")]
    Resp,
    /// The conversation ended (`quit`, or an uninterpretable connection).
    #[error("conversation closed")]
    Closed,
}

/// The two reassembled streams of one connection plus the event batch
/// buffer. This is what state machines operate on.
pub struct Conversation {
    /// Data sent by the client to the server.
    pub client: Reader,
    /// Data sent by the server to the client.
    pub server: Reader,
    events: Vec<Event>,
    sink: Arc<dyn EventSink>,
}

impl Conversation {
    pub fn new(client: Reader, server: Reader, sink: Arc<dyn EventSink>) -> Self {
        Self {
            client,
            server,
            events: Vec::with_capacity(EVENT_BATCH_CAPACITY),
            sink,
        }
    }

    pub fn add_event(&mut self, evt: Event) {
        self.events.push(evt);
        if self.events.len() >= EVENT_BATCH_CAPACITY {
            self.flush_events();
        }
    }

    pub fn flush_events(&mut self) {
        if !self.events.is_empty() {
            self.sink.handle_events(std::mem::take(&mut self.events));
        }
    }

    /// Tear down both streams, handing the readers back for reuse.
    fn into_readers(mut self) -> (Reader, Reader) {
        self.flush_events();
        (self.client, self.server)
    }
}

/// Which protocol to assume for new connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProtocolKind {
    /// Decide per connection from the first client byte.
    #[default]
    Infer,
    Mctext,
    Redis,
}

impl ProtocolKind {
    pub fn new_fsm(&self) -> Fsm {
        match self {
            ProtocolKind::Infer => Fsm::Infer,
            ProtocolKind::Mctext => Fsm::Mctext(mctext::MctextFsm::new()),
            ProtocolKind::Redis => Fsm::Redis(redis::RedisFsm::new()),
        }
    }
}

impl std::str::FromStr for ProtocolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "infer" => Ok(ProtocolKind::Infer),
            "mctext" => Ok(ProtocolKind::Mctext),
            "redis" => Ok(ProtocolKind::Redis),
            other => Err(format!(
                "unknown protocol {other:?} (expected mctext, redis or infer)"
            )),
        }
    }
}

/// Protocol state machine, dispatched per connection.
pub enum Fsm {
    /// Not yet known; decided from the first client byte.
    Infer,
    Mctext(mctext::MctextFsm),
    Redis(redis::RedisFsm),
}

impl Fsm {
    /// Execute one state transition.
    fn step(&mut self, conv: &mut Conversation) -> Result<(), FsmError> {
        match self {
            Fsm::Infer => {
                let next = infer::infer(&mut conv.client)?;
                *self = next;
                Ok(())
            }
            Fsm::Mctext(m) => m.step(conv),
            Fsm::Redis(r) => r.step(conv),
        }
    }

    /// Return to the initial command state after a recoverable error. The
    /// inference front end simply waits for a fresh packet boundary.
    fn soft_reset(&mut self) {
        match self {
            Fsm::Infer => {}
            Fsm::Mctext(m) => m.soft_reset(),
            Fsm::Redis(r) => r.soft_reset(),
        }
    }
}

/// A generic reader of a datastore conversation: one per connection,
/// owning both stream readers and the protocol state machine.
pub struct Consumer {
    conv: Conversation,
    fsm: Fsm,
    done: bool,
}

impl Consumer {
    pub fn new(client: Reader, server: Reader, fsm: Fsm, sink: Arc<dyn EventSink>) -> Self {
        Self {
            conv: Conversation::new(client, server, sink),
            fsm,
            done: false,
        }
    }

    /// Append reassembled client-side data.
    pub fn write_client(&mut self, skip: isize, data: &[u8]) {
        self.conv.client.write(skip, data);
    }

    /// Append reassembled server-side data.
    pub fn write_server(&mut self, skip: isize, data: &[u8]) {
        self.conv.server.write(skip, data);
    }

    /// Mark one side of the conversation complete.
    pub fn stream_complete(&mut self, from_server: bool) {
        if from_server {
            self.conv.server.reassembly_complete();
        } else {
            self.conv.client.reassembly_complete();
        }
    }

    /// Run the state machine until it suspends waiting for data, resyncs
    /// after an error, or terminates the conversation.
    pub fn run(&mut self) {
        if self.done {
            return;
        }
        loop {
            match self.fsm.step(&mut self.conv) {
                Ok(()) => continue,
                Err(FsmError::Read(ReadError::ShortRead)) => return,
                Err(FsmError::Read(ReadError::ShortWrite)) | Err(FsmError::Closed) => {
                    // uninterpretable connection, stop parsing it
                    self.conv.flush_events();
                    self.conv.client.close();
                    self.conv.server.close();
                    self.done = true;
                    return;
                }
                Err(_) => {
                    // data lost or protocol error, resync at the next
                    // command boundary
                    self.conv.client.truncate();
                    self.conv.server.truncate();
                    self.fsm.soft_reset();
                    return;
                }
            }
        }
    }

    /// Whether the conversation has been terminated by the state machine.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Push any buffered events to the sink without closing the
    /// conversation.
    pub fn flush_events(&mut self) {
        self.conv.flush_events();
    }

    /// Flush buffered events and recover the readers for pool reuse.
    pub fn into_readers(self) -> (Reader, Reader) {
        self.conv.into_readers()
    }
}
