//! # Votestream
//!
//! Live poll counting from a filtered post stream.
//!
//! Two processes talk only through the message bus:
//!
//! ```text
//! producer: live stream -> StreamReader -> hand-off -> VotePublisher -> bus
//! counter:  bus -> VoteCounter -> TallyMap -> Flusher -> poll storage
//! ```
//!
//! ## Modules
//!
//! - [`stream`]: stream sessions, record decoding and option matching
//! - [`publisher`]: hand-off to bus forwarding
//! - [`bus`]: Redis Stream publisher and consumer-group subscriber
//! - [`tally`]: in-memory per-option deltas and the bus handler feeding them
//! - [`flusher`]: periodic capture-and-write of deltas
//! - [`poll`]: poll storage
//! - [`lifecycle`]: startup errors and ordered shutdown of both processes

pub mod bus;
pub mod config;
pub mod flusher;
pub mod lifecycle;
pub mod poll;
pub mod publisher;
pub mod shutdown;
pub mod stream;
pub mod tally;
pub mod vote;

#[cfg(test)]
mod testing;

// Re-export commonly used types at crate root
pub use config::VotesConfig;
pub use flusher::Flusher;
pub use lifecycle::{run_counter, run_producer, CounterReport, ProducerReport, StartupError};
pub use publisher::VotePublisher;
pub use stream::StreamReader;
pub use tally::{TallyMap, VoteCounter};
pub use vote::VoteEvent;

/// Redis stream carrying vote events
pub const VOTE_STREAM_NAME: &str = "ballots:votes";

/// Default consumer group of the counter
pub const DEFAULT_CONSUMER_GROUP: &str = "counter";
