//! # Property Streaming Server
//!
//! Streams timestamped samples of any registered attribute to TCP clients.
//!
//! ```text
//! stream/
//! ├── protocol.rs  - request parsing and sample formatting
//! ├── session.rs   - per-connection state machine and delivery loop
//! └── server.rs    - listener, accept loop and capacity control
//! ```
//!
//! A client connects, sends `STREAM:<PORT>!<PROPERTY>;` and receives
//! `<seconds>,<value>;` samples at the server's frequency until either side
//! closes the connection. Each session runs in its own task with its own
//! attribute handle, so sessions never block each other or the control loops.
//!
//! ## Capacity
//!
//! The listener backlog equals `max_connections`. While `max_connections`
//! sessions are live, further connections are accepted and closed at once
//! without any data being sent.

pub mod protocol;
pub mod server;
pub mod session;

use serde::{Deserialize, Serialize};

use crate::attribute::AttributeError;

pub use protocol::StreamRequest;
pub use server::{StreamServer, StreamServerHandle};
pub use session::{SessionEnd, SessionState, StreamSession};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamServerConfig {
    pub enabled: bool,
    pub address: String,
    pub port: u16,
    pub max_connections: usize,
    /// Samples per second sent on every stream
    pub frequency: f64,
}

impl Default for StreamServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: "0.0.0.0".to_string(),
            port: 5000,
            max_connections: 5,
            frequency: 30.0,
        }
    }
}

// Stream errors
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown request: {0:?}")]
    UnknownRequest(String),

    #[error("Malformed request: {0:?}")]
    MalformedRequest(String),

    #[error("Request exceeds {0} bytes without terminator")]
    RequestTooLong(usize),

    #[error("Attribute error: {0}")]
    Attribute(#[from] AttributeError),

    #[error("Invalid server configuration: {0}")]
    InvalidConfig(String),

    #[error("Server task error: {0}")]
    TaskError(String),
}
