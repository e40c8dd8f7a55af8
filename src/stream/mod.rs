//! Live stream ingestion.
//!
//! - [`matcher`]: option snapshot and case-insensitive matching
//! - [`decode`]: newline-delimited record decoding
//! - [`transport`]: connection opening and request signing
//! - [`reader`]: the session state machine that ties them together

pub mod decode;
pub mod matcher;
pub mod reader;
pub mod transport;

use thiserror::Error;

use crate::poll::StorageError;

pub use decode::{DecodeError, Post, RecordDecoder};
pub use matcher::OptionSet;
pub use reader::{ReaderSettings, ReaderState, ReaderStats, StreamReader};
pub use transport::{HttpTransport, StreamConnection, StreamCredentials, StreamTransport};

/// Errors that end a stream cycle before any record is read.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The option list could not be loaded
    #[error("failed to load options: {0}")]
    Load(#[from] StorageError),

    #[error("stream authentication failed: {0}")]
    Auth(String),

    #[error("stream connection failed: {0}")]
    Connect(String),

    /// The server answered with a non-success status
    #[error("stream returned status {0}")]
    Status(u16),
}
