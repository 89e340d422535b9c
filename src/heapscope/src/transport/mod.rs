//! Guest buffer transports
//!
//! Two interchangeable ways of fetching the raw buffer bytes:
//! - `MonitorTransport` - the hypervisor's QMP control socket (needs a guest address)
//! - `SharedMemoryTransport` - a file the guest's memory is mapped into
//!
//! `SessionTransport` picks one of them per debugging session.

mod monitor;
mod shared_memory;

#[cfg(test)]
mod mock;

pub use monitor::{parse_hex_dump, MonitorTransport};
pub use shared_memory::SharedMemoryTransport;

#[cfg(test)]
pub use mock::MockTransport;

use crate::config::WatchConfig;
use crate::resolver::SymbolSource;

use std::future::Future;
use std::path::PathBuf;

/// Errors raised by transports
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Backing file or buffer not published yet
    #[error("Guest buffer not ready: {0}")]
    NotReady(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Monitor handshake failed: {0}")]
    Handshake(String),

    #[error("Monitor handshake timed out after {0} ms")]
    HandshakeTimeout(u64),

    #[error("Request {id} ({command}) timed out")]
    Timeout { id: u64, command: String },

    #[error("Monitor returned an error: {0}")]
    Monitor(String),

    #[error("Monitor connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("A guest address is required for this transport")]
    MissingAddress,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TransportError {
    /// Whether this only means the guest has not published yet
    pub fn is_not_ready(&self) -> bool {
        matches!(self, TransportError::NotReady(_))
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Capability shared by every buffer transport
pub trait Transport: Send {
    /// Establish the connection (handshake included)
    fn connect(&mut self) -> impl Future<Output = TransportResult<()>> + Send;

    /// Read `size` bytes at `address`. Transports that do not need an
    /// address ignore it.
    fn read(
        &mut self,
        size: usize,
        address: Option<u64>,
    ) -> impl Future<Output = TransportResult<Vec<u8>>> + Send;

    /// Tear the connection down. Safe to call when not connected.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;

    fn is_connected(&self) -> bool;

    /// Whether reads need a guest address from the resolver
    fn needs_address(&self) -> bool;
}

/// Which collaborator data is available for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    /// Guest memory backed by a host file
    SharedMemory { path: PathBuf },
    /// Hypervisor QMP socket plus somewhere to find the buffer address
    Monitor { socket: PathBuf, symbols: SymbolSource },
}

impl WatchTarget {
    /// Pick a target from whatever the session supplied.
    ///
    /// Shared memory wins when present since it needs no round trips.
    /// The monitor channel needs a socket plus either a kernel image or
    /// a fixed address.
    pub fn select(
        shm: Option<PathBuf>,
        qmp: Option<PathBuf>,
        kernel: Option<PathBuf>,
        address: Option<u64>,
    ) -> Option<Self> {
        if let Some(path) = shm {
            return Some(WatchTarget::SharedMemory { path });
        }

        let socket = qmp?;
        let symbols = match (address, kernel) {
            (Some(address), _) => SymbolSource::Fixed(address),
            (None, Some(path)) => SymbolSource::SymbolTable(path),
            (None, None) => return None,
        };
        Some(WatchTarget::Monitor { socket, symbols })
    }
}

/// The transport chosen for one session
pub enum SessionTransport {
    Monitor(MonitorTransport),
    SharedMemory(SharedMemoryTransport),
}

impl SessionTransport {
    pub fn for_target(target: &WatchTarget, config: &WatchConfig) -> Self {
        match target {
            WatchTarget::SharedMemory { path } => {
                SessionTransport::SharedMemory(SharedMemoryTransport::new(path))
            }
            WatchTarget::Monitor { socket, .. } => SessionTransport::Monitor(
                MonitorTransport::new(socket)
                    .with_handshake_timeout(config.handshake_timeout())
                    .with_request_timeout(config.request_timeout()),
            ),
        }
    }
}

impl Transport for SessionTransport {
    async fn connect(&mut self) -> TransportResult<()> {
        match self {
            SessionTransport::Monitor(t) => t.connect().await,
            SessionTransport::SharedMemory(t) => t.connect().await,
        }
    }

    async fn read(&mut self, size: usize, address: Option<u64>) -> TransportResult<Vec<u8>> {
        match self {
            SessionTransport::Monitor(t) => t.read(size, address).await,
            SessionTransport::SharedMemory(t) => t.read(size, address).await,
        }
    }

    async fn disconnect(&mut self) {
        match self {
            SessionTransport::Monitor(t) => t.disconnect().await,
            SessionTransport::SharedMemory(t) => t.disconnect().await,
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            SessionTransport::Monitor(t) => t.is_connected(),
            SessionTransport::SharedMemory(t) => t.is_connected(),
        }
    }

    fn needs_address(&self) -> bool {
        match self {
            SessionTransport::Monitor(t) => t.needs_address(),
            SessionTransport::SharedMemory(t) => t.needs_address(),
        }
    }
}
