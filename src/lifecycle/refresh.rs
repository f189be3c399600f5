//! Periodic contact refresh.
//!
//! The scheduler is only a timer; the lifecycle owner task polls [`RefreshScheduler::tick`]
//! in its select loop, runs [`fetch_contacts`] against whatever connection is live
//! at that moment on a separate task, and applies the result with
//! [`publish_contacts`] once it comes back.

use log::{debug, warn};
use serde_json::Value;
use tokio::time::{interval_at, Duration, Instant, Interval, MissedTickBehavior};

use crate::logutil::escape_log;
use crate::status::{keys, StatusSink};
use crate::transport::LiveConnection;

/// Capability queried for the contact snapshot.
pub const CONTACTS_CAPABILITY: &str = "getContacts";

/// Repeating refresh timer. Armed while connected, disarmed otherwise.
#[derive(Debug, Default)]
pub struct RefreshScheduler {
    interval: Option<Interval>,
}

impl RefreshScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a fresh timer; the first tick fires one full period from now.
    /// Any previous timer is discarded.
    pub fn start_periodic(&mut self, period: Duration) {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
    }

    /// Safe to call when not running.
    pub fn stop(&mut self) {
        self.interval = None;
    }

    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    /// Resolves on the next tick; never resolves while stopped.
    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

/// Outcome of one contact query, produced off the owner task.
#[derive(Debug, Clone, PartialEq)]
pub enum ContactFetch {
    /// No connection or no contacts capability.
    Skipped,
    Fetched(Value),
    Failed(String),
}

/// What one refresh attempt did to the published snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshResult {
    Skipped,
    /// Snapshot replaced with this many contacts.
    Published(usize),
    /// Query failed; previous snapshot kept.
    Failed,
}

/// Query the contacts capability of `live`, if it has one.
pub async fn fetch_contacts(live: Option<&LiveConnection>) -> ContactFetch {
    let Some(live) = live else {
        return ContactFetch::Skipped;
    };
    let Some(query) = live.capability(CONTACTS_CAPABILITY) else {
        debug!("Connection #{} has no {}", live.generation(), CONTACTS_CAPABILITY);
        return ContactFetch::Skipped;
    };
    match query(Vec::new()).await {
        Ok(contacts) => ContactFetch::Fetched(contacts),
        Err(e) => ContactFetch::Failed(e.message),
    }
}

/// Replace the published snapshot with a successful fetch. Failures only log.
pub fn publish_contacts(sink: &dyn StatusSink, fetch: ContactFetch) -> RefreshResult {
    match fetch {
        ContactFetch::Skipped => RefreshResult::Skipped,
        ContactFetch::Fetched(contacts) => {
            let (text, count) = match &contacts {
                Value::Null => ("[]".to_string(), 0),
                Value::Array(items) => (contacts.to_string(), items.len()),
                other => (other.to_string(), 1),
            };
            sink.set_value(keys::CONTACTS, Value::String(text), true);
            debug!("Published {} contacts", count);
            RefreshResult::Published(count)
        }
        ContactFetch::Failed(message) => {
            warn!("Contact refresh failed: {}", escape_log(&message));
            RefreshResult::Failed
        }
    }
}
