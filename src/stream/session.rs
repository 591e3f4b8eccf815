//! One client connection, from request to last sample
//!
//! ```text
//! Accepted ──► Parsing ──(valid request)──► Streaming(request) ──► SessionEnd
//!                 │                                                   ▲
//!                 └──────────(bad request / unknown attribute)────────┘
//! ```
//!
//! Every way out of a session drops the machine, which closes the socket and
//! releases the session's own attribute handle.
//!
//! Attribute reads are blocking file reads, so each one runs on the blocking
//! pool. A device file that never answers stalls only its own session.

use chrono::{DateTime, Local};
use statum::{machine, state};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{format_sample, read_request, StreamRequest};
use super::StreamError;
use crate::attribute::{AttributeRegistry, AttributeSource};

/// How a session ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// Sending failed, the peer went away
    ClosedByClient,
    /// The server was stopped
    ClosedByServer,
    /// Bad request or unreadable attribute
    Faulted(String),
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Accepted,
    Parsing,
    Streaming(StreamRequest),
}

#[machine]
#[derive(Debug)]
pub struct StreamSession<S: SessionState> {
    id: u64,
    peer: SocketAddr,
    socket: TcpStream,
    accepted_at: DateTime<Local>,
    period: Duration,
    // Shared by all sessions of one server
    epoch: Instant,
    shutdown: CancellationToken,
}

impl<S: SessionState> StreamSession<S> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl StreamSession<Accepted> {
    pub fn create(
        id: u64,
        socket: TcpStream,
        peer: SocketAddr,
        period: Duration,
        epoch: Instant,
        shutdown: CancellationToken,
    ) -> Self {
        debug!("Session {} accepted from {}", id, peer);
        Self::new(
            id,
            peer,
            socket,
            Local::now(),
            period,
            epoch,
            shutdown,
        )
    }

    /// Drives the session to completion
    pub async fn run(self, registry: Arc<AttributeRegistry>) -> SessionEnd {
        let id = self.id;
        let peer = self.peer;

        let end = match self.begin_parsing().negotiate(&registry).await {
            Ok(Some((streaming, source))) => streaming.deliver(source).await,
            Ok(None) => SessionEnd::ClosedByServer,
            Err(e) => {
                warn!("Session {} from {} rejected: {}", id, peer, e);
                SessionEnd::Faulted(e.to_string())
            }
        };

        debug!("Session {} from {} ended: {:?}", id, peer, end);
        end
    }

    pub fn begin_parsing(self) -> StreamSession<Parsing> {
        self.transition()
    }
}

impl StreamSession<Parsing> {
    /// Reads and resolves the request. `Ok(None)` means the server stopped
    /// before the request arrived.
    pub async fn negotiate(
        mut self,
        registry: &AttributeRegistry,
    ) -> Result<Option<(StreamSession<Streaming>, Box<dyn AttributeSource>)>, StreamError> {
        let raw = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(None),
            raw = read_request(&mut self.socket) => raw?,
        };

        let request = StreamRequest::parse(&raw)?;
        let source = registry.open_source(&request.port, &request.property)?;

        info!(
            "Session {} from {} streaming {} (connected {})",
            self.id,
            self.peer,
            source.key(),
            self.accepted_at.format("%H:%M:%S%.3f")
        );
        Ok(Some((self.transition_with(request), source)))
    }
}

impl StreamSession<Streaming> {
    pub fn request(&self) -> Option<&StreamRequest> {
        self.get_state_data()
    }

    /// Sends one sample per period until the peer goes away, the attribute
    /// fails, or the server stops.
    pub async fn deliver(mut self, mut source: Box<dyn AttributeSource>) -> SessionEnd {
        let mut lag_events: u64 = 0;

        loop {
            if self.shutdown.is_cancelled() {
                return SessionEnd::ClosedByServer;
            }

            let tick_start = Instant::now();
            let read = tokio::task::spawn_blocking(move || {
                let value = source.read();
                (source, value)
            });
            let (returned, value) = tokio::select! {
                _ = self.shutdown.cancelled() => return SessionEnd::ClosedByServer,
                joined = read => match joined {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("Session {} read task failed: {}", self.id, e);
                        return SessionEnd::Faulted(e.to_string());
                    }
                },
            };
            source = returned;
            let value = match value {
                Ok(value) => value,
                Err(e) => {
                    warn!("Session {} failed to read {}: {}", self.id, source.key(), e);
                    return SessionEnd::Faulted(e.to_string());
                }
            };

            let sample = format_sample(self.epoch.elapsed().as_secs_f64(), &value);
            tokio::select! {
                _ = self.shutdown.cancelled() => return SessionEnd::ClosedByServer,
                sent = self.socket.write_all(sample.as_bytes()) => {
                    if let Err(e) = sent {
                        debug!("Session {} send failed: {}", self.id, e);
                        return SessionEnd::ClosedByClient;
                    }
                }
            }

            let elapsed = tick_start.elapsed();
            if elapsed < self.period {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return SessionEnd::ClosedByServer,
                    _ = tokio::time::sleep(self.period - elapsed) => {}
                }
            } else {
                lag_events += 1;
                if lag_events % 100 == 1 {
                    warn!(
                        "Session {} lagging: sample took {:?} of {:?} ({} times)",
                        self.id, elapsed, self.period, lag_events
                    );
                }
                tokio::task::yield_now().await;
            }
        }
    }
}
