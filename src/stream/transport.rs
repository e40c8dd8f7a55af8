//! Transport for the filtered live stream.
//!
//! The reader only sees [`StreamTransport`]: give it the tracked options,
//! get back a status and a body stream. Request signing lives here and is
//! configured once at startup through [`StreamCredentials`].

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::{Client, RequestBuilder};
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

use super::matcher::OptionSet;
use super::StreamError;
use crate::config::{StreamConfig, BEARER_TOKEN_ENV};

/// Raw response body, chunk by chunk.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// An open connection to the live stream.
pub struct StreamConnection {
    pub status: u16,
    pub body: BodyStream,
}

impl StreamConnection {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the server refused our credentials.
    pub fn is_auth_failure(&self) -> bool {
        self.status == 401 || self.status == 403
    }
}

impl fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConnection")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Opens filtered-stream connections.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Open one connection tracking `options`. `timeout` bounds the whole
    /// request, body included.
    async fn open(
        &self,
        options: &OptionSet,
        timeout: Duration,
    ) -> Result<StreamConnection, StreamError>;
}

/// Credentials used to sign stream requests.
#[derive(Clone)]
pub struct StreamCredentials {
    bearer_token: String,
}

impl StreamCredentials {
    pub fn new(bearer_token: impl Into<String>) -> Result<Self, StreamError> {
        let bearer_token = bearer_token.into();
        if bearer_token.trim().is_empty() {
            return Err(StreamError::Auth("bearer token is empty".to_string()));
        }
        if bearer_token.contains("${") {
            return Err(StreamError::Auth(
                "bearer token contains an unsubstituted environment variable".to_string(),
            ));
        }
        Ok(Self { bearer_token })
    }

    /// Resolve credentials from config, falling back to the environment.
    pub fn from_config(config: &StreamConfig) -> Result<Self, StreamError> {
        let token = match &config.bearer_token {
            Some(token) => token.clone(),
            None => std::env::var(BEARER_TOKEN_ENV)
                .map_err(|_| StreamError::Auth(format!("{} must be set", BEARER_TOKEN_ENV)))?,
        };
        Self::new(token)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.bearer_token)
    }
}

impl fmt::Debug for StreamCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCredentials")
            .field("bearer_token", &"<redacted>")
            .finish()
    }
}

/// HTTP long-poll transport: `POST endpoint` with `track=<options>`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    credentials: StreamCredentials,
}

impl HttpTransport {
    pub fn new(config: &StreamConfig, credentials: StreamCredentials) -> Result<Self, StreamError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .user_agent(concat!("votestream/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StreamError::Connect(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            credentials,
        })
    }
}

#[async_trait]
impl StreamTransport for HttpTransport {
    async fn open(
        &self,
        options: &OptionSet,
        timeout: Duration,
    ) -> Result<StreamConnection, StreamError> {
        let track = options.as_slice().join(",");
        debug!(endpoint = %self.endpoint, track = %track, "Opening stream");

        let request = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .form(&[("track", track.as_str())]);

        let response = self
            .credentials
            .authorize(request)
            .send()
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));

        Ok(StreamConnection {
            status,
            body: Box::pin(body),
        })
    }
}
