//! # Transport Client Abstraction
//!
//! The lifecycle manager talks to the device through the [`TransportClient`] trait:
//! an opaque connection with a connect/close lifecycle, two lifecycle events, and
//! an open set of named async capabilities.
//!
//! Events are delivered over a channel into the lifecycle owner task. Each
//! transport instance gets an [`EventSender`] stamped with a generation number so
//! events from an instance that has since been torn down can be recognised and
//! dropped.
//!
//! Capabilities come from two sources, mirroring how a device library shares
//! methods across all clients of one type while individual instances may carry
//! extra ones:
//!
//! - [`TransportClient::shared_capabilities`] - the client type's method set
//! - [`TransportClient::instance_capabilities`] - per-instance additions, which
//!   shadow shared entries of the same name

pub mod capability;

pub use capability::{Capability, CapabilityError, CapabilityFuture, CapabilityTable};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    Closed,

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("device error {0}")]
    Device(u8),
}

/// Lifecycle notification emitted by a transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEventKind {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportEvent {
    pub generation: u64,
    pub kind: TransportEventKind,
}

/// Per-instance event emitter handed to a transport on creation.
#[derive(Debug, Clone)]
pub struct EventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSender {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connected(&self) {
        self.emit(TransportEventKind::Connected);
    }

    pub fn disconnected(&self) {
        self.emit(TransportEventKind::Disconnected);
    }

    fn emit(&self, kind: TransportEventKind) {
        // Receiver gone means the service is shutting down; nothing to notify.
        let _ = self.tx.send(TransportEvent {
            generation: self.generation,
            kind,
        });
    }
}

/// One device connection.
///
/// Implementations must tolerate concurrent capability calls.
#[async_trait]
pub trait TransportClient: Send + Sync + 'static {
    /// Establish the connection. Emits `connected` through the instance's
    /// [`EventSender`] on success.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Best-effort close. Callers ignore the result.
    fn close(&self) -> Result<(), TransportError>;

    /// Capabilities common to every instance of this client type.
    fn shared_capabilities(&self) -> CapabilityTable;

    /// Capabilities attached to this particular instance.
    fn instance_capabilities(&self) -> CapabilityTable {
        CapabilityTable::default()
    }
}

/// Creates transport instances for the lifecycle manager.
pub trait TransportFactory: Send + Sync + 'static {
    fn create(&self, host: &str, port: u16, events: EventSender) -> Arc<dyn TransportClient>;
}

/// Handle to the currently live transport instance.
///
/// Owned by the lifecycle manager; the gateway and the refresh scheduler borrow
/// it for one operation at a time.
#[derive(Clone)]
pub struct LiveConnection {
    generation: u64,
    client: Arc<dyn TransportClient>,
}

impl LiveConnection {
    pub fn new(generation: u64, client: Arc<dyn TransportClient>) -> Self {
        Self { generation, client }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn client(&self) -> &Arc<dyn TransportClient> {
        &self.client
    }

    /// Resolve a public capability by exact name. Instance entries shadow shared ones.
    pub fn capability(&self, name: &str) -> Option<Capability> {
        if !capability::is_public_name(name) {
            return None;
        }
        self.client
            .instance_capabilities()
            .get(name)
            .or_else(|| self.client.shared_capabilities().get(name))
    }

    /// Best-effort close; failures are logged and dropped.
    pub fn close(&self) {
        if let Err(e) = self.client.close() {
            log::debug!("Ignoring close error on connection #{}: {}", self.generation, e);
        }
    }
}

impl std::fmt::Debug for LiveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConnection")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}
