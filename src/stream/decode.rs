//! Per-record decoding of the live stream body.
//!
//! The body is newline-delimited JSON. Blank lines are keep-alives and are
//! skipped. Records may be split across chunks in any way.

use bytes::BytesMut;
use futures_util::StreamExt;
use serde::Deserialize;
use thiserror::Error;

use super::transport::BodyStream;

/// Why a session's decode loop stopped reading.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("stream ended")]
    EndOfStream,

    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("record exceeds {limit} bytes")]
    RecordTooLarge { limit: usize },

    #[error("transport error while reading: {0}")]
    Transport(String),
}

/// One decoded post.
///
/// Accepts both flat records (`{"text": ...}`) and enveloped ones
/// (`{"data": {"text": ...}}`).
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Post {
    #[serde(default)]
    text: Option<String>,

    #[serde(default)]
    data: Option<PostData>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
struct PostData {
    #[serde(default)]
    text: Option<String>,
}

impl Post {
    pub fn text(&self) -> &str {
        self.text
            .as_deref()
            .or_else(|| self.data.as_ref().and_then(|d| d.text.as_deref()))
            .unwrap_or_default()
    }
}

/// Pulls one [`Post`] at a time out of a body stream.
pub struct RecordDecoder {
    body: BodyStream,
    buffer: BytesMut,
    max_record_bytes: usize,
    finished: bool,
}

impl RecordDecoder {
    pub fn new(body: BodyStream, max_record_bytes: usize) -> Self {
        Self {
            body,
            buffer: BytesMut::new(),
            max_record_bytes,
            finished: false,
        }
    }

    /// Decode the next record, reading more of the body as needed.
    ///
    /// Cancel safe: bytes already read stay buffered if the future is dropped.
    pub async fn next_record(&mut self) -> Result<Post, DecodeError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                if pos > self.max_record_bytes {
                    return Err(DecodeError::RecordTooLarge {
                        limit: self.max_record_bytes,
                    });
                }
                let line = self.buffer.split_to(pos + 1);
                let line = line[..pos].trim_ascii();
                if line.is_empty() {
                    continue;
                }
                return Ok(serde_json::from_slice(line)?);
            }

            if self.buffer.len() > self.max_record_bytes {
                return Err(DecodeError::RecordTooLarge {
                    limit: self.max_record_bytes,
                });
            }

            if self.finished {
                let rest = self.buffer.split();
                let rest = rest.trim_ascii();
                if rest.is_empty() {
                    return Err(DecodeError::EndOfStream);
                }
                return Ok(serde_json::from_slice(rest)?);
            }

            match self.body.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(DecodeError::Transport(e.to_string())),
                None => self.finished = true,
            }
        }
    }

    /// Read and discard whatever is left of the body.
    pub async fn drain(&mut self) -> usize {
        let mut discarded = self.buffer.len();
        self.buffer.clear();
        while let Some(Ok(chunk)) = self.body.next().await {
            discarded += chunk.len();
        }
        self.finished = true;
        discarded
    }
}
