//! Vote events flowing from the stream reader to the bus.
//!
//! A [`VoteEvent`] is one detected match between a post and a configured
//! option. Duplicates are valid and summed downstream; events carry no
//! identity and no ordering guarantee.

use chrono::{DateTime, Utc};

/// Stream entry field holding the option identifier.
pub const OPTION_FIELD: &str = "option";

/// Stream entry field holding the detection timestamp.
pub const DETECTED_AT_FIELD: &str = "detectedAt";

/// One vote in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteEvent {
    /// The option this vote counts towards
    pub option: String,

    /// When the reader matched the post
    pub detected_at: DateTime<Utc>,
}

impl VoteEvent {
    pub fn new(option: impl Into<String>) -> Self {
        Self {
            option: option.into(),
            detected_at: Utc::now(),
        }
    }

    /// Field/value pairs written to the bus stream entry.
    pub fn fields(&self) -> [(&'static str, String); 2] {
        [
            (OPTION_FIELD, self.option.clone()),
            (DETECTED_AT_FIELD, self.detected_at.to_rfc3339()),
        ]
    }
}
