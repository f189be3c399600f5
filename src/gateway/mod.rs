//! # RPC Gateway
//!
//! Generic passthrough from external callers to whatever capability the live
//! connection exposes. The gateway knows nothing about individual device
//! methods: it normalises the request, resolves the method by exact name,
//! awaits the capability and mirrors the outcome into the status sink.
//!
//! ## Status writes
//!
//! ```text
//! before execution   rpc.lastCall        = {"method":..,"args":[..]}
//!                    rpc.lastError       = ""
//! on success         rpc.lastResultJson  = <result as JSON text>
//! on failure         rpc.lastError       = <message>
//! ```
//!
//! Invocation is split in two so the lifecycle owner task can do the cheap,
//! state-dependent half ([`RpcGateway::prepare`]) inline and hand the slow half
//! ([`PreparedCall::run`]) to its own task. Distinct calls are never serialised
//! against each other.

pub mod catalog;

pub use catalog::list_methods;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::watch;

use crate::logutil::{escape_log, preview_json};
use crate::status::{keys, StatusSink};
use crate::transport::{Capability, LiveConnection};

pub const NOT_CONNECTED: &str = "not connected";

/// One call request: method name plus positional arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }

    /// Build a request from a loosely shaped message. A missing method becomes
    /// the empty string, non-string methods are stringified, and `args` that is
    /// absent or not an array becomes an empty list.
    pub fn from_message(message: &Value) -> Self {
        let method = match message.get("method") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        let args = match message.get("args") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        Self { method, args }.normalized()
    }

    /// Trim the method name.
    pub fn normalized(mut self) -> Self {
        let trimmed = self.method.trim();
        if trimmed.len() != self.method.len() {
            self.method = trimmed.to_string();
        }
        self
    }
}

/// Outcome of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcOutcome {
    Ok { result: Value },
    Err { message: String },
}

impl RpcOutcome {
    pub fn err(message: impl Into<String>) -> Self {
        RpcOutcome::Err {
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, RpcOutcome::Ok { .. })
    }

    /// Wire shape returned to callers: `{ok:true,result}` or `{ok:false,error}`.
    pub fn to_response(&self) -> Value {
        match self {
            RpcOutcome::Ok { result } => json!({ "ok": true, "result": result }),
            RpcOutcome::Err { message } => json!({ "ok": false, "error": message }),
        }
    }
}

/// Dynamic method-invocation proxy over the live connection.
#[derive(Clone)]
pub struct RpcGateway {
    sink: Arc<dyn StatusSink>,
    shutdown: watch::Receiver<bool>,
}

/// Result of [`RpcGateway::prepare`].
pub enum PreparedCall {
    /// Capability resolved; awaiting it performs the call.
    Ready(ReadyCall),
    /// Failed before reaching the device.
    Done(RpcOutcome),
}

pub struct ReadyCall {
    gateway: RpcGateway,
    method: String,
    args: Vec<Value>,
    capability: Capability,
}

impl RpcGateway {
    pub fn new(sink: Arc<dyn StatusSink>, shutdown: watch::Receiver<bool>) -> Self {
        Self { sink, shutdown }
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Status writes are dropped once shutdown was requested.
    fn publish(&self, key: &str, value: Value) {
        if self.shutting_down() {
            debug!("Dropping {} update during shutdown", key);
            return;
        }
        self.sink.set_value(key, value, true);
    }

    /// Normalise, record the in-flight call and resolve the capability.
    pub fn prepare(&self, live: Option<&LiveConnection>, request: RpcRequest) -> PreparedCall {
        let RpcRequest { method, args } = request.normalized();

        let call_record = json!({ "method": method, "args": args });
        self.publish(keys::RPC_LAST_CALL, Value::String(call_record.to_string()));
        self.publish(keys::RPC_LAST_ERROR, Value::String(String::new()));
        debug!("RPC {} {}", escape_log(&method), preview_json(&Value::Array(args.clone())));

        let Some(live) = live else {
            return PreparedCall::Done(self.fail(&method, NOT_CONNECTED.to_string()));
        };
        let Some(capability) = live.capability(&method) else {
            let message = format!("unknown method: {}", method);
            return PreparedCall::Done(self.fail(&method, message));
        };

        PreparedCall::Ready(ReadyCall {
            gateway: self.clone(),
            method,
            args,
            capability,
        })
    }

    /// Convenience: prepare and run in one go.
    pub async fn invoke(&self, live: Option<&LiveConnection>, request: RpcRequest) -> RpcOutcome {
        self.prepare(live, request).run().await
    }

    fn fail(&self, method: &str, message: String) -> RpcOutcome {
        warn!("RPC {} failed: {}", escape_log(method), escape_log(&message));
        self.publish(keys::RPC_LAST_ERROR, Value::String(message.clone()));
        RpcOutcome::Err { message }
    }
}

impl PreparedCall {
    pub async fn run(self) -> RpcOutcome {
        match self {
            PreparedCall::Done(outcome) => outcome,
            PreparedCall::Ready(call) => call.run().await,
        }
    }
}

impl ReadyCall {
    pub async fn run(self) -> RpcOutcome {
        let ReadyCall {
            gateway,
            method,
            args,
            capability,
        } = self;
        match capability(args).await {
            Ok(result) => {
                gateway.publish(keys::RPC_LAST_RESULT, Value::String(result.to_string()));
                debug!("RPC {} ok", escape_log(&method));
                RpcOutcome::Ok { result }
            }
            Err(e) => gateway.fail(&method, e.message),
        }
    }
}
