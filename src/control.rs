//! # Control Server
//!
//! Local TCP command surface for external callers. One JSON object per line:
//!
//! ```text
//! -> {"command":"meshcore.rpc","message":{"method":"getContacts","args":[]},"callback":1}
//! <- {"command":"meshcore.rpc","callback":1,"response":{"ok":true,"result":[...]}}
//!
//! -> {"command":"meshcore.getMethods","message":{},"callback":"m"}
//! <- {"command":"meshcore.getMethods","callback":"m","response":{"ok":true,"methods":[...]}}
//! ```
//!
//! A reply is only written when the request carries a non-empty `callback`.
//! Lines that do not parse, lack a string `command`, or name an unknown command
//! are dropped.
//! Requests on one connection are handled concurrently; replies may therefore
//! come back in a different order than the requests went out.

use anyhow::{anyhow, Result};
use futures::StreamExt;
use log::{debug, info, warn};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};

use crate::gateway::RpcRequest;
use crate::lifecycle::ServiceHandle;
use crate::logutil::escape_log;

pub const CMD_RPC: &str = "meshcore.rpc";
pub const CMD_GET_METHODS: &str = "meshcore.getMethods";

/// Longest request line accepted before the connection is dropped.
pub const MAX_LINE: usize = 64 * 1024;

/// Handle one request line. `None` means nothing is sent back.
pub async fn dispatch(service: &ServiceHandle, line: &str) -> Option<Value> {
    let parsed: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            debug!("Ignoring unparsable control line: {}", e);
            return None;
        }
    };
    let Some(obj) = parsed.as_object() else {
        debug!("Ignoring non-object control line");
        return None;
    };
    let Some(command) = obj.get("command").and_then(Value::as_str) else {
        debug!("Ignoring control line without command");
        return None;
    };
    let message = obj.get("message").cloned().unwrap_or(Value::Null);

    let response = match command {
        CMD_RPC => service
            .invoke(RpcRequest::from_message(&message))
            .await
            .to_response(),
        CMD_GET_METHODS => json!({ "ok": true, "methods": service.list_methods().await }),
        other => {
            debug!("Ignoring unknown control command {}", escape_log(other));
            return None;
        }
    };

    let callback = obj.get("callback").filter(|c| wants_reply(c))?;
    Some(json!({
        "command": command,
        "callback": callback,
        "response": response,
    }))
}

/// `null`, `false`, `0` and `""` mark a fire-and-forget request.
fn wants_reply(callback: &Value) -> bool {
    match callback {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Bind the listener; split from [`serve`] so callers learn the bound address.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow!("Failed to bind control listener on {}: {}", addr, e))
}

/// Accept control clients until the listener fails.
pub async fn serve(listener: TcpListener, service: ServiceHandle) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Control server listening on {}", addr);
    }
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!("Control client {} connected", peer);
        let service = service.clone();
        tokio::spawn(async move {
            handle_client(stream, service).await;
            debug!("Control client {} disconnected", peer);
        });
    }
}

async fn handle_client(stream: TcpStream, service: ServiceHandle) {
    let (rd, mut wr) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Value>();

    let writer = tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            let mut line = reply.to_string();
            line.push('\n');
            if wr.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let codec = AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), MAX_LINE);
    let mut lines = FramedRead::new(rd, codec);
    while let Some(frame) = lines.next().await {
        let raw = match frame {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Control client read failed: {}; closing", e);
                break;
            }
        };
        let Ok(text) = std::str::from_utf8(&raw) else {
            debug!("Ignoring control line that is not UTF-8");
            continue;
        };
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        let request = trimmed.to_string();
        let service = service.clone();
        let reply_tx = reply_tx.clone();
        tokio::spawn(async move {
            if let Some(reply) = dispatch(&service, &request).await {
                let _ = reply_tx.send(reply);
            }
        });
    }

    // Let in-flight requests finish writing before the socket goes away.
    drop(reply_tx);
    let _ = writer.await;
}

/// One-shot client used by the CLI: send `command` and return its `response`.
pub async fn request(addr: &str, command: &str, message: Value, wait: Duration) -> Result<Value> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| anyhow!("Cannot reach control server at {}: {}", addr, e))?;
    let (rd, mut wr) = stream.into_split();

    let mut line = json!({ "command": command, "message": message, "callback": 1 }).to_string();
    line.push('\n');
    wr.write_all(line.as_bytes()).await?;

    let mut reader = BufReader::new(rd);
    let mut reply = String::new();
    let n = timeout(wait, reader.read_line(&mut reply))
        .await
        .map_err(|_| anyhow!("No reply from control server within {:?}", wait))??;
    if n == 0 {
        return Err(anyhow!("Control server closed the connection"));
    }
    let mut parsed: Value = serde_json::from_str(reply.trim())?;
    Ok(parsed
        .get_mut("response")
        .map(Value::take)
        .unwrap_or(Value::Null))
}
