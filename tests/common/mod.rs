//! Test utilities & fixtures.
//! Provides a scripted in-process transport so lifecycle and gateway behaviour can
//! be driven without a radio.
#![allow(dead_code)] // each test binary uses a different subset

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

use meshcore_gateway::lifecycle::{start_service, ConnectionConfig, ConnectionState, ServiceHandle};
use meshcore_gateway::status::MemorySink;
use meshcore_gateway::transport::{
    CapabilityError, CapabilityTable, EventSender, TransportClient, TransportError,
    TransportFactory,
};

/// How one scripted `connect()` call behaves.
#[derive(Debug, Clone)]
pub enum ConnectStep {
    /// Emit `connected` and succeed.
    Succeed,
    /// Fail with this message.
    Fail(String),
    /// Emit `disconnected`, then fail with this message.
    DropThenFail(String),
    /// Never complete.
    Hang,
}

pub struct FakeClient {
    pub index: usize,
    events: EventSender,
    step: ConnectStep,
    shared: CapabilityTable,
    instance: CapabilityTable,
    closes: AtomicUsize,
}

impl FakeClient {
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    /// Simulate the device dropping the link.
    pub fn drop_link(&self) {
        self.events.disconnected();
    }

    /// Emit a late `connected` as a misbehaving transport would.
    pub fn spurious_connected(&self) {
        self.events.connected();
    }
}

#[async_trait]
impl TransportClient for FakeClient {
    async fn connect(&self) -> Result<(), TransportError> {
        match &self.step {
            ConnectStep::Succeed => {
                self.events.connected();
                Ok(())
            }
            ConnectStep::Fail(msg) => Err(refused(msg)),
            ConnectStep::DropThenFail(msg) => {
                self.events.disconnected();
                Err(refused(msg))
            }
            ConnectStep::Hang => std::future::pending().await,
        }
    }

    fn close(&self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::Closed)
    }

    fn shared_capabilities(&self) -> CapabilityTable {
        self.shared.clone()
    }

    fn instance_capabilities(&self) -> CapabilityTable {
        self.instance.clone()
    }
}

fn refused(msg: &str) -> TransportError {
    TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        msg.to_string(),
    ))
}

/// Factory handing out [`FakeClient`]s according to a script.
pub struct FakeFactory {
    script: Mutex<VecDeque<ConnectStep>>,
    fallback: ConnectStep,
    shared: CapabilityTable,
    instance: CapabilityTable,
    created: Mutex<Vec<(Instant, Arc<FakeClient>)>>,
}

impl FakeFactory {
    pub fn new(shared: CapabilityTable) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: ConnectStep::Succeed,
            shared,
            instance: CapabilityTable::new(),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn with_script(mut self, steps: Vec<ConnectStep>, fallback: ConnectStep) -> Self {
        self.script = Mutex::new(steps.into());
        self.fallback = fallback;
        self
    }

    pub fn with_instance(mut self, instance: CapabilityTable) -> Self {
        self.instance = instance;
        self
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn created_at(&self) -> Vec<Instant> {
        self.created.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    pub fn client(&self, idx: usize) -> Arc<FakeClient> {
        self.created.lock().unwrap()[idx].1.clone()
    }

    pub fn last_client(&self) -> Arc<FakeClient> {
        self.created.lock().unwrap().last().expect("no client created").1.clone()
    }
}

impl TransportFactory for FakeFactory {
    fn create(&self, _host: &str, _port: u16, events: EventSender) -> Arc<dyn TransportClient> {
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let mut created = self.created.lock().unwrap();
        let client = Arc::new(FakeClient {
            index: created.len(),
            events,
            step,
            shared: self.shared.clone(),
            instance: self.instance.clone(),
            closes: AtomicUsize::new(0),
        });
        created.push((Instant::now(), client.clone()));
        client
    }
}

/// Counts calls to a capability.
#[derive(Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// A device exposing `getContacts` -> `[{"id":"a"}]`, `echo`, `fail` and `_secret`.
pub fn device_capabilities(contacts_calls: CallCounter) -> CapabilityTable {
    let mut t = CapabilityTable::new();
    t.register("getContacts", move |_| {
        contacts_calls.bump();
        async { Ok(json!([{ "id": "a" }])) }
    });
    t.register("echo", |args| async move { Ok(Value::Array(args)) });
    t.register("fail", |_| async { Err(CapabilityError::new("radio busy")) });
    t.register("nothing", |_| async { Ok(Value::Null) });
    t.register("_secret", |_| async { Ok(json!("hidden")) });
    t
}

/// `getContacts` succeeds on the first call and fails on every later one.
pub fn flaky_contacts(calls: CallCounter) -> CapabilityTable {
    let mut t = CapabilityTable::new();
    t.register("getContacts", move |_| {
        let n = calls.bump();
        async move {
            if n == 1 {
                Ok(json!([{ "id": "a" }]))
            } else {
                Err(CapabilityError::new("timed out waiting for contacts"))
            }
        }
    });
    t
}

pub fn config(port: i64) -> ConnectionConfig {
    ConnectionConfig {
        host: "radio.local".to_string(),
        port,
        reconnect_interval_ms: 5_000,
        refresh_interval_ms: 60_000,
    }
}

pub struct Harness {
    pub service: ServiceHandle,
    pub factory: Arc<FakeFactory>,
    pub sink: Arc<MemorySink>,
}

pub fn start(factory: FakeFactory, config: ConnectionConfig) -> Harness {
    let factory = Arc::new(factory);
    let sink = Arc::new(MemorySink::new());
    let service = start_service(config, factory.clone(), sink.clone());
    Harness {
        service,
        factory,
        sink,
    }
}

pub async fn wait_for_state(service: &ServiceHandle, want: ConnectionState) {
    let mut rx = service.subscribe_state();
    tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", want))
        .expect("state channel closed");
}

/// Poll `cond` until it holds, yielding to the runtime between checks.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Let spawned tasks run without advancing the (possibly paused) clock.
pub async fn settle() {
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
}
