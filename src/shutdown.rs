//! Graceful shutdown coordination for votestream.
//!
//! This module provides a [`ShutdownSignal`] that turns process termination
//! signals into cancellation of one root [`CancellationToken`]. Every
//! component receives the token (or a child of it) explicitly and checks it
//! at its own suspension points.
//!
//! # Example
//!
//! ```rust,ignore
//! use votestream::shutdown::ShutdownSignal;
//!
//! #[tokio::main]
//! async fn main() {
//!     let shutdown = ShutdownSignal::new();
//!
//!     let listener = shutdown.clone();
//!     tokio::spawn(async move { listener.wait().await });
//!
//!     let token = shutdown.token();
//!     tokio::select! {
//!         _ = token.cancelled() => {}
//!         // ... do work
//!     }
//! }
//! ```

use tokio_util::sync::CancellationToken;
use tracing::info;

/// A signal for coordinating graceful shutdown across components.
///
/// When a termination signal (SIGTERM, SIGINT, SIGHUP) is received, the root
/// token is cancelled and every component holding it (or a child) observes it.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// The root cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for a termination signal, then cancel the root token.
    ///
    /// Returns early if shutdown was already triggered some other way.
    pub async fn wait(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};

            match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
                (Ok(mut term), Ok(mut hup)) => {
                    tokio::select! {
                        _ = term.recv() => "SIGTERM",
                        _ = hup.recv() => "SIGHUP",
                    }
                }
                (Err(e), _) | (_, Err(e)) => {
                    tracing::error!(error = %e, "Failed to install SIGTERM/SIGHUP handler");
                    std::future::pending::<&str>().await
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<&str>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            name = terminate => {
                info!(signal = name, "Received termination signal, initiating graceful shutdown...");
            }
            _ = self.token.cancelled() => return,
        }

        self.token.cancel();
    }
}
