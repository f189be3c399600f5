//! # Connection Lifecycle Manager
//!
//! A single owner task holds the live transport instance and every piece of
//! connection state. Everything that can change that state arrives as a message
//! into its `select!` loop:
//!
//! - transport events (`connected` / `disconnected`), generation stamped
//! - the outcome of the background connect attempt
//! - the reconnect timer and the refresh interval
//! - commands from [`ServiceHandle`] (RPC, method listing, shutdown)
//!
//! ```text
//!            start / reconnect timer
//! Disconnected ----------------------> Connecting
//!      ^   ^                              |   |
//!      |   |     connect error            |   | connected event
//!      |   +------------------------------+   v
//!      |         disconnected event       Connected
//!      +--------------------------------------+
//!
//! any state --shutdown--> ShuttingDown (final)
//! ```
//!
//! Slow work (the connect handshake, contact queries, RPC calls) runs on its own
//! tasks so the owner never waits on the device. Results that touch connection
//! state come back through a channel and are applied by the owner.

pub mod refresh;

pub use refresh::{
    fetch_contacts, publish_contacts, ContactFetch, RefreshResult, RefreshScheduler,
    CONTACTS_CAPABILITY,
};

use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};

use crate::gateway::{list_methods, PreparedCall, RpcGateway, RpcOutcome, RpcRequest, NOT_CONNECTED};
use crate::logutil::escape_log;
use crate::status::{declare_fields, keys, StatusSink};
use crate::transport::{
    EventSender, LiveConnection, TransportEvent, TransportEventKind, TransportFactory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ShuttingDown,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::ShuttingDown => "shutting down",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Config invalid: host/port")]
    EmptyHost,

    #[error("Config invalid: host/port")]
    PortOutOfRange(i64),

    #[error("Config invalid: {0} must be positive")]
    NonPositiveInterval(&'static str),
}

/// Per-run connection settings, as configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: i64,
    pub reconnect_interval_ms: u64,
    pub refresh_interval_ms: u64,
}

/// Settings that passed [`ConnectionConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub reconnect_interval: Duration,
    pub refresh_interval: Duration,
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<ConnectTarget, ConfigError> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        let port = u16::try_from(self.port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or(ConfigError::PortOutOfRange(self.port))?;
        if self.reconnect_interval_ms == 0 {
            return Err(ConfigError::NonPositiveInterval("reconnect interval"));
        }
        if self.refresh_interval_ms == 0 {
            return Err(ConfigError::NonPositiveInterval("refresh interval"));
        }
        Ok(ConnectTarget {
            host: host.to_string(),
            port,
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            refresh_interval: Duration::from_millis(self.refresh_interval_ms),
        })
    }
}

enum ServiceCommand {
    Invoke {
        request: RpcRequest,
        reply: oneshot::Sender<RpcOutcome>,
    },
    ListMethods(oneshot::Sender<Vec<String>>),
    Shutdown(oneshot::Sender<()>),
}

/// Results of background work, applied by the owner task.
enum Completion {
    ConnectFailed { generation: u64, message: String },
    Refreshed { generation: u64, fetch: ContactFetch },
}

/// Clone-able handle to a running service.
#[derive(Clone, Debug)]
pub struct ServiceHandle {
    tx: mpsc::UnboundedSender<ServiceCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl ServiceHandle {
    /// Forward one call to the live connection. Always yields an outcome.
    pub async fn invoke(&self, request: RpcRequest) -> RpcOutcome {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ServiceCommand::Invoke { request, reply }).is_err() {
            return RpcOutcome::err(NOT_CONNECTED);
        }
        rx.await.unwrap_or_else(|_| RpcOutcome::err(NOT_CONNECTED))
    }

    pub async fn list_methods(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ServiceCommand::ListMethods(reply)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Stop the service and wait for teardown. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let (done, rx) = oneshot::channel();
        if self.tx.send(ServiceCommand::Shutdown(done)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Spawn the lifecycle owner task and start connecting.
///
/// With an invalid `config` the service still runs and answers commands, but
/// never attempts a connection.
pub fn start_service(
    config: ConnectionConfig,
    factory: Arc<dyn TransportFactory>,
    sink: Arc<dyn StatusSink>,
) -> ServiceHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = mpsc::unbounded_channel();

    let manager = Manager {
        factory,
        gateway: RpcGateway::new(sink.clone(), shutdown_rx),
        sink,
        state_tx,
        shutdown_tx: shutdown_tx.clone(),
        target: None,
        live: None,
        generation: 0,
        pending_attempt: None,
        reconnect_at: None,
        refresh: RefreshScheduler::new(),
        connect_task: None,
        refresh_task: None,
        events_tx,
        done_tx,
    };
    tokio::spawn(manager.run(config, rx, events_rx, done_rx));

    ServiceHandle {
        tx,
        state_rx,
        shutdown_tx,
    }
}

struct Manager {
    factory: Arc<dyn TransportFactory>,
    sink: Arc<dyn StatusSink>,
    gateway: RpcGateway,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    target: Option<ConnectTarget>,
    live: Option<LiveConnection>,
    generation: u64,
    /// Connect attempt whose own outcome has not been reported yet.
    pending_attempt: Option<u64>,
    reconnect_at: Option<Instant>,
    refresh: RefreshScheduler,
    connect_task: Option<JoinHandle<()>>,
    refresh_task: Option<JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    done_tx: mpsc::UnboundedSender<Completion>,
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

impl Manager {
    async fn run(
        mut self,
        config: ConnectionConfig,
        mut commands: mpsc::UnboundedReceiver<ServiceCommand>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        self.start(&config);
        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(ServiceCommand::Invoke { request, reply }) => self.invoke(request, reply),
                        Some(ServiceCommand::ListMethods(reply)) => {
                            let _ = reply.send(list_methods(self.connected_live()));
                        }
                        Some(ServiceCommand::Shutdown(done)) => {
                            self.shutdown();
                            let _ = done.send(());
                            break;
                        }
                        None => {
                            debug!("All service handles dropped; shutting down");
                            self.shutdown();
                            break;
                        }
                    }
                }
                Some(event) = events.recv() => self.on_transport_event(event),
                Some(done) = completions.recv() => self.on_completion(done),
                _ = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.connect();
                }
                _ = self.refresh.tick() => self.spawn_refresh(),
            }
        }
        debug!("Lifecycle owner task finished");
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            debug!("Connection state {} -> {}", prev, state);
        }
    }

    fn publish(&self, key: &str, value: Value) {
        self.sink.set_value(key, value, true);
    }

    /// The live connection, only once the device confirmed it.
    fn connected_live(&self) -> Option<&LiveConnection> {
        match self.state() {
            ConnectionState::Connected => self.live.as_ref(),
            _ => None,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.live.as_ref().map(LiveConnection::generation) == Some(generation)
    }

    fn start(&mut self, config: &ConnectionConfig) {
        declare_fields(self.sink.as_ref());
        self.publish(keys::HOST, json!(config.host.trim()));
        self.publish(keys::PORT, json!(config.port));
        self.publish(keys::CONNECTION, json!(false));
        self.publish(keys::LAST_ERROR, json!(""));

        match config.validate() {
            Ok(target) => {
                self.target = Some(target);
                self.connect();
            }
            Err(e) => {
                error!("{} (host={:?}, port={})", e, config.host, config.port);
                self.publish(keys::LAST_ERROR, json!(e.to_string()));
            }
        }
    }

    /// Stop the scheduler, cancel the timer, close and discard the live instance.
    fn teardown(&mut self) {
        self.refresh.stop();
        if let Some(task) = self.refresh_task.take() {
            task.abort();
        }
        self.reconnect_at = None;
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        if let Some(live) = self.live.take() {
            live.close();
        }
    }

    fn connect(&mut self) {
        let Some(target) = self.target.clone() else {
            return;
        };
        self.teardown();
        self.generation += 1;
        let generation = self.generation;
        self.set_state(ConnectionState::Connecting);
        info!(
            "Connecting to {}:{} (attempt #{})",
            target.host, target.port, generation
        );

        let events = EventSender::new(generation, self.events_tx.clone());
        let client = self.factory.create(&target.host, target.port, events);
        self.live = Some(LiveConnection::new(generation, client.clone()));
        self.pending_attempt = Some(generation);

        let done_tx = self.done_tx.clone();
        self.connect_task = Some(tokio::spawn(async move {
            if let Err(e) = client.connect().await {
                let _ = done_tx.send(Completion::ConnectFailed {
                    generation,
                    message: e.to_string(),
                });
            }
        }));
    }

    /// Arm the reconnect timer unless one is already pending.
    fn schedule_reconnect(&mut self) {
        let Some(target) = self.target.as_ref() else {
            return;
        };
        if self.reconnect_at.is_some() {
            debug!("Reconnect already pending");
            return;
        }
        self.reconnect_at = Some(Instant::now() + target.reconnect_interval);
        info!(
            "Reconnecting in {} ms",
            target.reconnect_interval.as_millis()
        );
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        if !self.is_current(event.generation) {
            debug!(
                "Ignoring {:?} from stale connection #{}",
                event.kind, event.generation
            );
            return;
        }
        match event.kind {
            TransportEventKind::Connected => self.on_connected(),
            TransportEventKind::Disconnected => self.on_disconnected(),
        }
    }

    fn on_connected(&mut self) {
        if self.state() != ConnectionState::Connecting {
            return;
        }
        self.connect_task = None;
        self.pending_attempt = None;
        if let Some(target) = self.target.as_ref() {
            info!("Connected to {}:{}", target.host, target.port);
        }
        self.publish(keys::CONNECTION, json!(true));
        self.publish(keys::LAST_ERROR, json!(""));
        self.set_state(ConnectionState::Connected);
        // A failing first refresh must not hold back the transition.
        self.spawn_refresh();
        if let Some(period) = self.target.as_ref().map(|t| t.refresh_interval) {
            self.refresh.start_periodic(period);
        }
    }

    fn on_disconnected(&mut self) {
        warn!("Connection #{} lost", self.generation);
        self.publish(keys::CONNECTION, json!(false));
        if self.state() == ConnectionState::Connecting {
            // Let the attempt finish so its error still gets published.
            self.connect_task = None;
        }
        self.teardown();
        self.set_state(ConnectionState::Disconnected);
        self.schedule_reconnect();
    }

    fn on_completion(&mut self, done: Completion) {
        match done {
            Completion::ConnectFailed {
                generation,
                message,
            } => {
                if self.pending_attempt != Some(generation)
                    || self.state() == ConnectionState::ShuttingDown
                {
                    debug!("Ignoring stale connect failure for #{}", generation);
                    return;
                }
                self.pending_attempt = None;
                error!("Connect failed: {}", escape_log(&message));
                self.publish(keys::CONNECTION, json!(false));
                self.publish(keys::LAST_ERROR, json!(message));
                // A disconnect from this attempt may already have torn it down.
                if self.state() == ConnectionState::Connecting {
                    self.teardown();
                    self.set_state(ConnectionState::Disconnected);
                }
                self.schedule_reconnect();
            }
            Completion::Refreshed { generation, fetch } => {
                if !self.is_current(generation) {
                    debug!("Dropping contacts from stale connection #{}", generation);
                    return;
                }
                self.refresh_task = None;
                publish_contacts(self.sink.as_ref(), fetch);
            }
        }
    }

    /// Query contacts on a separate task; the result comes back as a completion.
    fn spawn_refresh(&mut self) {
        if let Some(task) = self.refresh_task.as_ref() {
            if !task.is_finished() {
                debug!("Contact refresh still running; skipping tick");
                return;
            }
        }
        let Some(live) = self.connected_live().cloned() else {
            return;
        };
        let done_tx = self.done_tx.clone();
        self.refresh_task = Some(tokio::spawn(async move {
            let fetch = fetch_contacts(Some(&live)).await;
            let _ = done_tx.send(Completion::Refreshed {
                generation: live.generation(),
                fetch,
            });
        }));
    }

    fn invoke(&self, request: RpcRequest, reply: oneshot::Sender<RpcOutcome>) {
        match self.gateway.prepare(self.connected_live(), request) {
            PreparedCall::Done(outcome) => {
                let _ = reply.send(outcome);
            }
            ready => {
                tokio::spawn(async move {
                    let _ = reply.send(ready.run().await);
                });
            }
        }
    }

    fn shutdown(&mut self) {
        info!("Shutting down connection manager");
        self.shutdown_tx.send_replace(true);
        self.set_state(ConnectionState::ShuttingDown);
        self.teardown();
    }
}
