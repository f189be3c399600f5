//! # Status Sink
//!
//! The gateway reports everything observable about itself through a string-keyed
//! status surface: connection flag, last error, echo of the effective host/port,
//! the contact snapshot, and the last RPC call/result/error.
//!
//! Writers go through the [`StatusSink`] trait. Two implementations ship with the
//! crate:
//!
//! - [`StatusStore`] - durable, mirrors every write to a JSON file on disk
//! - [`MemorySink`] - in-memory only, records write history (embedding and tests)
//!
//! `set_value` never blocks on I/O: durable persistence happens in a background
//! task, so it is safe to call from the lifecycle owner task.

pub mod store;

pub use store::StatusStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Status keys written by the gateway.
pub mod keys {
    pub const CONNECTION: &str = "info.connection";
    pub const LAST_ERROR: &str = "info.lastError";
    pub const HOST: &str = "info.host";
    pub const PORT: &str = "info.port";
    pub const CONTACTS: &str = "contacts.json";
    pub const RPC_LAST_CALL: &str = "rpc.lastCall";
    pub const RPC_LAST_RESULT: &str = "rpc.lastResultJson";
    pub const RPC_LAST_ERROR: &str = "rpc.lastError";
}

/// Key/value publication surface consumed by the gateway.
pub trait StatusSink: Send + Sync {
    /// Publish `value` under `key`. `ack` marks the value as confirmed by this
    /// service (read-only for other components).
    fn set_value(&self, key: &str, value: Value, ack: bool);

    fn get_value(&self, key: &str) -> Option<Value>;
}

/// One stored status value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub value: Value,
    pub ack: bool,
    pub ts: DateTime<Utc>,
}

impl StatusEntry {
    pub fn new(value: Value, ack: bool) -> Self {
        Self {
            value,
            ack,
            ts: Utc::now(),
        }
    }
}

/// Declaration of a status field: key, display label and default.
#[derive(Debug, Clone)]
pub struct StatusField {
    pub key: &'static str,
    pub name: &'static str,
    pub default: Value,
}

/// All fields the gateway publishes.
pub fn declared_fields() -> Vec<StatusField> {
    use serde_json::json;
    vec![
        StatusField { key: keys::CONNECTION, name: "Connected", default: json!(false) },
        StatusField { key: keys::LAST_ERROR, name: "Last error", default: json!("") },
        StatusField { key: keys::HOST, name: "Host", default: json!("") },
        StatusField { key: keys::PORT, name: "Port", default: json!(0) },
        StatusField { key: keys::CONTACTS, name: "Contacts JSON", default: json!("[]") },
        StatusField { key: keys::RPC_LAST_CALL, name: "RPC last call", default: json!("") },
        StatusField { key: keys::RPC_LAST_RESULT, name: "RPC last result JSON", default: json!("") },
        StatusField { key: keys::RPC_LAST_ERROR, name: "RPC last error", default: json!("") },
    ]
}

/// Seed every declared field that has no value yet. Existing values are kept.
pub fn declare_fields(sink: &dyn StatusSink) {
    for field in declared_fields() {
        if sink.get_value(field.key).is_none() {
            sink.set_value(field.key, field.default, true);
        }
    }
}

/// Non-durable sink keeping every write in order.
#[derive(Debug, Default)]
pub struct MemorySink {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    values: BTreeMap<String, StatusEntry>,
    history: Vec<(String, Value)>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write so far, oldest first.
    pub fn history(&self) -> Vec<(String, Value)> {
        match self.inner.lock() {
            Ok(guard) => guard.history.clone(),
            Err(poisoned) => poisoned.into_inner().history.clone(),
        }
    }

    /// Writes made to `key`, oldest first.
    pub fn writes_to(&self, key: &str) -> Vec<Value> {
        self.history()
            .into_iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v)
            .collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, StatusEntry> {
        match self.inner.lock() {
            Ok(guard) => guard.values.clone(),
            Err(poisoned) => poisoned.into_inner().values.clone(),
        }
    }
}

impl StatusSink for MemorySink {
    fn set_value(&self, key: &str, value: Value, ack: bool) {
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.history.push((key.to_string(), value.clone()));
        guard
            .values
            .insert(key.to_string(), StatusEntry::new(value, ack));
    }

    fn get_value(&self, key: &str) -> Option<Value> {
        let guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.values.get(key).map(|e| e.value.clone())
    }
}
