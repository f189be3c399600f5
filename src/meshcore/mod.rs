//! # MeshCore Companion TCP Client
//!
//! [`MeshCoreClient`] is the production [`TransportClient`]: it speaks the
//! MeshCore companion-radio protocol to a device (or a WiFi/TCP bridge) and
//! exposes the device's commands as named capabilities.
//!
//! ## Tasks
//!
//! A connected client runs two tasks, the same reader/writer split the rest of
//! the crate uses for device links:
//!
//! - **reader** - decodes `>` frames, forwards responses to whoever holds the
//!   request slot, logs unsolicited pushes, emits `disconnected` on EOF
//! - **writer** - drains the outbound frame queue onto the socket
//!
//! Requests are serialised through one async mutex because the protocol has no
//! request ids: exactly one command is in flight and the next non-push frame is
//! its response.
//!
//! ## Capabilities
//!
//! ```text
//! getSelfInfo          -> {type, txPower, publicKey, name, ...}
//! getContacts          -> [{publicKey, advName, outPath, lastAdvert, ...}]
//! getDeviceTime        -> {epochSecs}
//! setDeviceTime(secs)  -> null
//! sendFloodAdvert      -> null
//! sendZeroHopAdvert    -> null
//! setAdvertName(name)  -> null
//! getBatteryVoltage    -> {batteryMilliVolts}
//! reboot               -> null
//! ```

pub mod frame;
pub mod protocol;

use async_trait::async_trait;
use log::{debug, info, trace, warn};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::logutil::escape_log;
use crate::transport::capability::arg;
use crate::transport::{
    CapabilityError, CapabilityTable, EventSender, TransportClient, TransportError, TransportFactory,
};
use frame::{encode_frame, FrameDecoder};
use protocol::{resp, Contact, SelfInfo, PUSH_CODE_MIN};

/// Client tuning shared by every instance a factory creates.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub request_timeout: Duration,
    pub app_name: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(10_000),
            app_name: "meshcore-gateway".to_string(),
        }
    }
}

/// Creates [`MeshCoreClient`] instances for the lifecycle manager.
#[derive(Debug, Clone, Default)]
pub struct MeshCoreFactory {
    pub options: ClientOptions,
}

impl MeshCoreFactory {
    pub fn new(options: ClientOptions) -> Self {
        Self { options }
    }
}

impl TransportFactory for MeshCoreFactory {
    fn create(&self, host: &str, port: u16, events: EventSender) -> Arc<dyn TransportClient> {
        Arc::new(MeshCoreClient::new(host, port, self.options.clone(), events))
    }
}

struct Link {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct ClientInner {
    host: String,
    port: u16,
    options: ClientOptions,
    events: EventSender,
    closed: Arc<AtomicBool>,
    link: Mutex<Option<Link>>,
    /// Response stream; holding the lock is holding the request slot.
    responses: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

/// One TCP connection to a MeshCore companion radio.
pub struct MeshCoreClient {
    inner: Arc<ClientInner>,
}

impl MeshCoreClient {
    pub fn new(host: &str, port: u16, options: ClientOptions, events: EventSender) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                host: host.to_string(),
                port,
                options,
                events,
                closed: Arc::new(AtomicBool::new(false)),
                link: Mutex::new(None),
                responses: tokio::sync::Mutex::new(None),
            }),
        }
    }
}

#[async_trait]
impl TransportClient for MeshCoreClient {
    async fn connect(&self) -> Result<(), TransportError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let stream = TcpStream::connect((inner.host.as_str(), inner.port)).await?;
        let _ = stream.set_nodelay(true);
        let (rd, wr) = stream.into_split();

        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        *inner.responses.lock().await = Some(resp_rx);

        let reader = tokio::spawn(read_loop(
            rd,
            resp_tx,
            inner.events.clone(),
            inner.closed.clone(),
        ));
        let writer = tokio::spawn(write_loop(wr, out_rx));
        inner.set_link(Link {
            outbound: out_tx,
            reader,
            writer,
        });

        // The radio expects APP_START before anything else.
        match inner.get_self_info().await {
            Ok(info) => {
                info!(
                    "MeshCore radio '{}' answered on {}:{}",
                    escape_log(&info.name),
                    inner.host,
                    inner.port
                );
            }
            Err(e) => {
                inner.shutdown_link();
                return Err(e);
            }
        }

        if inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        inner.events.connected();
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.shutdown_link();
        Ok(())
    }

    fn shared_capabilities(&self) -> CapabilityTable {
        let mut t = CapabilityTable::new();
        for &(name, command) in COMMANDS {
            let c = self.inner.clone();
            t.register(name, move |args| c.clone().run(command, args));
        }
        t
    }
}

#[derive(Debug, Clone, Copy)]
enum Command {
    SelfInfo,
    Contacts,
    DeviceTime,
    SetDeviceTime,
    FloodAdvert,
    ZeroHopAdvert,
    SetAdvertName,
    BatteryVoltage,
    Reboot,
}

/// Capability names as the device library spells them.
const COMMANDS: &[(&str, Command)] = &[
    ("getSelfInfo", Command::SelfInfo),
    ("getContacts", Command::Contacts),
    ("getDeviceTime", Command::DeviceTime),
    ("setDeviceTime", Command::SetDeviceTime),
    ("sendFloodAdvert", Command::FloodAdvert),
    ("sendZeroHopAdvert", Command::ZeroHopAdvert),
    ("setAdvertName", Command::SetAdvertName),
    ("getBatteryVoltage", Command::BatteryVoltage),
    ("reboot", Command::Reboot),
];

fn to_json<T: serde::Serialize>(v: &T) -> Value {
    serde_json::to_value(v).unwrap_or(Value::Null)
}

impl ClientInner {
    async fn run(self: Arc<Self>, command: Command, args: Vec<Value>) -> Result<Value, CapabilityError> {
        let value = match command {
            Command::SelfInfo => to_json(&self.get_self_info().await?),
            Command::Contacts => to_json(&self.get_contacts().await?),
            Command::DeviceTime => json!({ "epochSecs": self.get_device_time().await? }),
            Command::SetDeviceTime => {
                let secs = arg(&args, 0)
                    .as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| CapabilityError::new("setDeviceTime expects epoch seconds"))?;
                self.simple_command(protocol::set_device_time(secs), "setDeviceTime")
                    .await?;
                Value::Null
            }
            Command::FloodAdvert => {
                self.simple_command(protocol::send_self_advert(true), "sendFloodAdvert")
                    .await?;
                Value::Null
            }
            Command::ZeroHopAdvert => {
                self.simple_command(protocol::send_self_advert(false), "sendZeroHopAdvert")
                    .await?;
                Value::Null
            }
            Command::SetAdvertName => {
                let name = arg(&args, 0)
                    .as_str()
                    .ok_or_else(|| CapabilityError::new("setAdvertName expects a name"))?;
                self.simple_command(protocol::set_advert_name(name)?, "setAdvertName")
                    .await?;
                Value::Null
            }
            Command::BatteryVoltage => {
                json!({ "batteryMilliVolts": self.get_battery_millivolts().await? })
            }
            Command::Reboot => {
                // The radio restarts without answering.
                self.send(protocol::reboot())?;
                Value::Null
            }
        };
        Ok(value)
    }

    fn lock_link(&self) -> std::sync::MutexGuard<'_, Option<Link>> {
        match self.link.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_link(&self, link: Link) {
        if let Some(old) = self.lock_link().replace(link) {
            old.reader.abort();
            old.writer.abort();
        }
    }

    fn shutdown_link(&self) {
        if let Some(link) = self.lock_link().take() {
            link.reader.abort();
            link.writer.abort();
            debug!("MeshCore link to {}:{} torn down", self.host, self.port);
        }
    }

    fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        let frame = encode_frame(&payload)?;
        let guard = self.lock_link();
        let link = guard.as_ref().ok_or(TransportError::Closed)?;
        trace!("-> {}", hex::encode(&payload));
        link.outbound
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    /// Send one command and feed response frames to `handle` until it yields a result.
    /// `handle` returns `None` for frames it does not consume.
    async fn exchange<T>(
        &self,
        payload: Vec<u8>,
        what: &str,
        mut handle: impl FnMut(u8, &[u8]) -> Option<Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        let mut slot = self.responses.lock().await;
        let rx = slot.as_mut().ok_or(TransportError::Closed)?;
        // Anything still queued belongs to an earlier request that timed out.
        while rx.try_recv().is_ok() {}

        self.send(payload)?;
        let deadline = Instant::now() + self.options.request_timeout;
        loop {
            let frame = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Err(TransportError::Closed),
                Err(_) => return Err(TransportError::Timeout(what.to_string())),
            };
            let Some((&code, body)) = frame.split_first() else {
                continue;
            };
            if code == resp::ERR {
                return Err(TransportError::Device(protocol::parse_err_code(body)));
            }
            if let Some(result) = handle(code, body) {
                return result;
            }
            debug!("Ignoring response 0x{:02X} while waiting for {}", code, what);
        }
    }

    async fn simple_command(&self, payload: Vec<u8>, what: &str) -> Result<(), TransportError> {
        self.exchange(payload, what, |code, _| (code == resp::OK).then_some(Ok(())))
            .await
    }

    async fn get_self_info(&self) -> Result<SelfInfo, TransportError> {
        self.exchange(
            protocol::app_start(&self.options.app_name),
            "self info",
            |code, body| (code == resp::SELF_INFO).then(|| protocol::parse_self_info(body)),
        )
        .await
    }

    async fn get_contacts(&self) -> Result<Vec<Contact>, TransportError> {
        let mut contacts = Vec::new();
        self.exchange(protocol::get_contacts(), "contacts", |code, body| match code {
            resp::CONTACTS_START => {
                contacts.clear();
                None
            }
            resp::CONTACT => match protocol::parse_contact(body) {
                Ok(c) => {
                    contacts.push(c);
                    None
                }
                Err(e) => Some(Err(e)),
            },
            resp::END_OF_CONTACTS => Some(Ok(())),
            _ => None,
        })
        .await?;
        Ok(contacts)
    }

    async fn get_device_time(&self) -> Result<u32, TransportError> {
        self.exchange(protocol::get_device_time(), "device time", |code, body| {
            (code == resp::CURR_TIME).then(|| protocol::parse_curr_time(body))
        })
        .await
    }

    async fn get_battery_millivolts(&self) -> Result<u16, TransportError> {
        self.exchange(protocol::get_battery_voltage(), "battery voltage", |code, body| {
            (code == resp::BATTERY_VOLTAGE).then(|| protocol::parse_battery_millivolts(body))
        })
        .await
    }
}

async fn read_loop(
    mut rd: OwnedReadHalf,
    responses: mpsc::UnboundedSender<Vec<u8>>,
    events: EventSender,
    closed: Arc<AtomicBool>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 1024];
    loop {
        match rd.read(&mut buf).await {
            Ok(0) => {
                debug!("MeshCore socket reached EOF");
                break;
            }
            Ok(n) => {
                decoder.push(&buf[..n]);
                while let Some(frame) = decoder.next_frame() {
                    trace!("<- {}", hex::encode(&frame));
                    match frame.first() {
                        None => {}
                        Some(&code) if code >= PUSH_CODE_MIN => {
                            debug!("MeshCore push 0x{:02X} ({} bytes)", code, frame.len());
                        }
                        Some(_) => {
                            let _ = responses.send(frame);
                        }
                    }
                }
            }
            Err(e) => {
                warn!("MeshCore read error: {}", e);
                break;
            }
        }
    }
    // A local close() already accounted for this link.
    if !closed.swap(true, Ordering::SeqCst) {
        events.disconnected();
    }
}

async fn write_loop(mut wr: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = wr.write_all(&frame).await {
            warn!("MeshCore write error: {}", e);
            break;
        }
    }
    let _ = wr.shutdown().await;
}
