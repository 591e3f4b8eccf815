use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::session::StreamSession;
use super::{StreamError, StreamServerConfig};
use crate::attribute::AttributeRegistry;
use crate::control::tick_period;

// Back-off after a failed accept (e.g. out of file descriptors)
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

pub struct StreamServer;

impl StreamServer {
    /// Binds the listener and spawns the accept loop
    pub async fn serve(
        config: &StreamServerConfig,
        registry: Arc<AttributeRegistry>,
    ) -> Result<StreamServerHandle, StreamError> {
        if config.max_connections == 0 {
            return Err(StreamError::InvalidConfig(
                "max_connections must be at least 1".to_string(),
            ));
        }
        let period = tick_period(config.frequency).ok_or_else(|| {
            StreamError::InvalidConfig(format!(
                "frequency must be positive with a representable period, got {}",
                config.frequency
            ))
        })?;

        let listener = bind(config).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "Stream server listening on {} ({} connections, {} Hz)",
            local_addr, config.max_connections, config.frequency
        );

        let shutdown = CancellationToken::new();
        let slots = Arc::new(Semaphore::new(config.max_connections));
        let acceptor = Acceptor {
            listener,
            registry,
            slots: slots.clone(),
            period,
            epoch: Instant::now(),
            next_session_id: AtomicU64::new(1),
            shutdown: shutdown.clone(),
        };
        let task_handle = tokio::spawn(acceptor.run());

        Ok(StreamServerHandle {
            local_addr,
            max_connections: config.max_connections,
            slots,
            shutdown,
            task_handle: Some(task_handle),
        })
    }
}

async fn bind(config: &StreamServerConfig) -> Result<TcpListener, StreamError> {
    let address = format!("{}:{}", config.address, config.port);
    let bind_error = |source| StreamError::Bind {
        address: address.clone(),
        source,
    };

    let addr = tokio::net::lookup_host(address.as_str())
        .await
        .map_err(bind_error)?
        .next()
        .ok_or_else(|| {
            bind_error(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "address did not resolve",
            ))
        })?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_error)?;
    socket.set_reuseaddr(true).map_err(bind_error)?;
    socket.bind(addr).map_err(bind_error)?;

    let backlog = u32::try_from(config.max_connections).unwrap_or(u32::MAX);
    socket.listen(backlog).map_err(bind_error)
}

struct Acceptor {
    listener: TcpListener,
    registry: Arc<AttributeRegistry>,
    slots: Arc<Semaphore>,
    period: Duration,
    epoch: Instant,
    next_session_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Acceptor {
    async fn run(self) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received for stream server");
                    break;
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer)) => self.dispatch(socket, peer),
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }

        // Listener closes here; running sessions see the child token
        info!("Stream server stopped accepting connections");
    }

    fn dispatch(&self, socket: tokio::net::TcpStream, peer: SocketAddr) {
        let permit = match self.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Connection limit reached, closing connection from {}", peer);
                drop(socket);
                return;
            }
        };

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = StreamSession::create(
            id,
            socket,
            peer,
            self.period,
            self.epoch,
            self.shutdown.child_token(),
        );
        let registry = self.registry.clone();

        tokio::spawn(async move {
            let end = session.run(registry).await;
            debug!("Session {} released its slot ({:?})", id, end);
            drop(permit);
        });
    }
}

/// Handle to a running stream server
#[derive(Debug)]
pub struct StreamServerHandle {
    local_addr: SocketAddr,
    max_connections: usize,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
}

impl StreamServerHandle {
    /// Address actually bound, useful with port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_sessions(&self) -> usize {
        self.max_connections
            .saturating_sub(self.slots.available_permits())
    }

    /// Closes the listener and signals every session to end. Calling it again
    /// is a no-op.
    pub async fn stop(&mut self) -> Result<(), StreamError> {
        debug!("Sending shutdown signal to stream server");
        self.shutdown.cancel();

        match self.task_handle.take() {
            Some(handle) => handle.await.map_err(|e| {
                error!("Stream server task panicked: {}", e);
                StreamError::TaskError(format!("Accept task failed: {}", e))
            }),
            None => {
                debug!("Stream server already stopped");
                Ok(())
            }
        }
    }
}

impl Drop for StreamServerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
