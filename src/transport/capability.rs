//! Runtime-enumerable capability tables.
//!
//! A capability is a named, type-erased async callable taking a positional JSON
//! argument list. Transports publish their capabilities through these tables so
//! the gateway can dispatch by name without compiled-in knowledge of the device's
//! method set.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Error reported by a capability. The message is surfaced to RPC callers verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CapabilityError {
    pub message: String,
}

impl CapabilityError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<super::TransportError> for CapabilityError {
    fn from(e: super::TransportError) -> Self {
        CapabilityError::new(e.to_string())
    }
}

pub type CapabilityFuture = Pin<Box<dyn Future<Output = Result<Value, CapabilityError>> + Send>>;

/// Shared handle to a callable capability.
pub type Capability = Arc<dyn Fn(Vec<Value>) -> CapabilityFuture + Send + Sync>;

/// Names starting with this marker are implementation-private and never listed.
pub const PRIVATE_PREFIX: char = '_';

/// Self-reference entry that is never treated as a callable method.
pub const CONSTRUCTOR_NAME: &str = "constructor";

/// True when a capability name may be listed and invoked from outside.
pub fn is_public_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with(PRIVATE_PREFIX) && name != CONSTRUCTOR_NAME
}

/// Ordered mapping from method name to capability.
#[derive(Clone, Default)]
pub struct CapabilityTable {
    entries: BTreeMap<String, Capability>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async closure under `name`, replacing any previous entry.
    pub fn register<F, Fut>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CapabilityError>> + Send + 'static,
    {
        let cap: Capability = Arc::new(move |args| Box::pin(f(args)));
        self.entries.insert(name.to_string(), cap);
        self
    }

    pub fn get(&self, name: &str) -> Option<Capability> {
        self.entries.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl fmt::Debug for CapabilityTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

/// Fetch a positional argument, `Null` when absent.
pub fn arg(args: &[Value], idx: usize) -> &Value {
    args.get(idx).unwrap_or(&Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn private_and_constructor_names_are_hidden() {
        assert!(is_public_name("getContacts"));
        assert!(!is_public_name("_secret"));
        assert!(!is_public_name("constructor"));
        assert!(!is_public_name(""));
    }

    #[tokio::test]
    async fn registered_closure_receives_args() {
        let mut table = CapabilityTable::new();
        table.register("echo", |args| async move { Ok(Value::Array(args)) });
        let cap = table.get("echo").expect("registered");
        let out = cap(vec![json!(1), json!("two")]).await.expect("ok");
        assert_eq!(out, json!([1, "two"]));
        assert!(table.get("Echo").is_none());
    }
}
