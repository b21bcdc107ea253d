//! Passive analysis of memcached/redis traffic.
//!
//! Observes live network traffic (or a captured trace) carrying
//! memcached-text or RESP protocol exchanges and produces a continuously
//! updated, grouped-and-aggregated ranking of the keys accounting for
//! the most traffic. Strictly read-only: it never injects traffic nor
//! terminates sessions.
//!
//! The pipeline has five stages, each a pool of workers fed by a bounded
//! queue, with dispatch by connection hash so that all packets of a
//! connection are processed in order by a single worker at every stage:
//!
//! ```text
//! capture -> decode -> assembly -> protocol FSM -> analysis
//! ```
//!
//! Backpressure is handled by dropping and counting, never by blocking
//! the capture path.

pub mod analysis;
pub mod assembly;
pub mod capture;
pub mod cli;
pub mod config;
pub mod decode;
pub mod presentation;
pub mod protocol;
pub mod stats;
