mod common;

use common::*;
use meshcore_gateway::gateway::{RpcGateway, RpcOutcome, RpcRequest};
use meshcore_gateway::lifecycle::ConnectionState;
use meshcore_gateway::status::{keys, MemorySink, StatusSink};
use meshcore_gateway::transport::{CapabilityTable, LiveConnection, TransportFactory};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};

/// A gateway over a directly constructed live connection.
fn gateway_fixture(shared: CapabilityTable) -> (RpcGateway, LiveConnection, Arc<MemorySink>, watch::Sender<bool>) {
    let sink = Arc::new(MemorySink::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gateway = RpcGateway::new(sink.clone(), shutdown_rx);
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let factory = FakeFactory::new(shared);
    let client = factory.create(
        "radio.local",
        5000,
        meshcore_gateway::transport::EventSender::new(1, events_tx),
    );
    (gateway, LiveConnection::new(1, client), sink, shutdown_tx)
}

fn call(method: &str, args: Vec<Value>) -> RpcRequest {
    RpcRequest::new(method, args)
}

#[tokio::test]
async fn get_contacts_returns_and_publishes_result() {
    let (gw, live, sink, _sd) = gateway_fixture(device_capabilities(CallCounter::default()));
    let out = gw.invoke(Some(&live), call("getContacts", vec![])).await;

    assert_eq!(out, RpcOutcome::Ok { result: json!([{"id": "a"}]) });
    assert_eq!(out.to_response(), json!({"ok": true, "result": [{"id": "a"}]}));
    assert_eq!(
        sink.get_value(keys::RPC_LAST_RESULT),
        Some(json!("[{\"id\":\"a\"}]"))
    );

    let last_call = sink.get_value(keys::RPC_LAST_CALL).unwrap();
    let parsed: Value = serde_json::from_str(last_call.as_str().unwrap()).unwrap();
    assert_eq!(parsed, json!({"method": "getContacts", "args": []}));

    let order: Vec<String> = sink.history().into_iter().map(|(k, _)| k).collect();
    assert_eq!(
        order,
        vec![keys::RPC_LAST_CALL, keys::RPC_LAST_ERROR, keys::RPC_LAST_RESULT]
    );
}

#[tokio::test]
async fn unknown_method_fails_without_touching_contacts() {
    let (gw, live, sink, _sd) = gateway_fixture(device_capabilities(CallCounter::default()));
    sink.set_value(keys::CONTACTS, json!("[{\"id\":\"a\"}]"), true);

    let out = gw.invoke(Some(&live), call("noSuchMethod", vec![])).await;
    assert_eq!(
        out.to_response(),
        json!({"ok": false, "error": "unknown method: noSuchMethod"})
    );
    assert_eq!(
        sink.get_value(keys::RPC_LAST_ERROR),
        Some(json!("unknown method: noSuchMethod"))
    );
    assert_eq!(sink.get_value(keys::CONTACTS), Some(json!("[{\"id\":\"a\"}]")));
    assert_eq!(sink.get_value(keys::RPC_LAST_RESULT), None);
}

#[tokio::test]
async fn lookup_is_exact_and_private_names_are_not_callable() {
    let (gw, live, _sink, _sd) = gateway_fixture(device_capabilities(CallCounter::default()));
    let out = gw.invoke(Some(&live), call("getcontacts", vec![])).await;
    assert_eq!(out, RpcOutcome::err("unknown method: getcontacts"));
    let out = gw.invoke(Some(&live), call("_secret", vec![])).await;
    assert_eq!(out, RpcOutcome::err("unknown method: _secret"));
    let out = gw.invoke(Some(&live), call("constructor", vec![])).await;
    assert_eq!(out, RpcOutcome::err("unknown method: constructor"));
}

#[tokio::test]
async fn no_live_connection_is_not_connected() {
    let (gw, _live, sink, _sd) = gateway_fixture(device_capabilities(CallCounter::default()));
    let out = gw.invoke(None, call("getContacts", vec![])).await;
    assert_eq!(out.to_response(), json!({"ok": false, "error": "not connected"}));
    assert_eq!(sink.get_value(keys::RPC_LAST_ERROR), Some(json!("not connected")));
    // The in-flight marker is still written first.
    assert!(sink.get_value(keys::RPC_LAST_CALL).is_some());
}

#[tokio::test]
async fn capability_error_message_passes_through() {
    let (gw, live, sink, _sd) = gateway_fixture(device_capabilities(CallCounter::default()));
    let out = gw.invoke(Some(&live), call("fail", vec![])).await;
    assert_eq!(out, RpcOutcome::err("radio busy"));
    assert_eq!(sink.writes_to(keys::RPC_LAST_ERROR), vec![json!(""), json!("radio busy")]);
}

#[tokio::test]
async fn method_is_trimmed_and_args_forwarded() {
    let (gw, live, sink, _sd) = gateway_fixture(device_capabilities(CallCounter::default()));
    let req = RpcRequest::from_message(&json!({"method": "  echo\t", "args": [1, "two", null]}));
    let out = gw.invoke(Some(&live), req).await;
    assert_eq!(out, RpcOutcome::Ok { result: json!([1, "two", null]) });
    assert_eq!(
        sink.get_value(keys::RPC_LAST_RESULT),
        Some(json!("[1,\"two\",null]"))
    );

    let req = RpcRequest::from_message(&json!({"method": "echo", "args": {"not": "an array"}}));
    let out = gw.invoke(Some(&live), req).await;
    assert_eq!(out, RpcOutcome::Ok { result: json!([]) });
}

#[tokio::test]
async fn absent_result_is_published_as_null() {
    let (gw, live, sink, _sd) = gateway_fixture(device_capabilities(CallCounter::default()));
    let out = gw.invoke(Some(&live), call("nothing", vec![])).await;
    assert_eq!(out, RpcOutcome::Ok { result: Value::Null });
    assert_eq!(sink.get_value(keys::RPC_LAST_RESULT), Some(json!("null")));
}

#[tokio::test]
async fn instance_capability_shadows_shared_one() {
    let mut instance = CapabilityTable::new();
    instance.register("echo", |_| async { Ok(json!("from instance")) });
    let sink = Arc::new(MemorySink::new());
    let (_tx, rx) = watch::channel(false);
    let gw = RpcGateway::new(sink, rx);
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let factory = FakeFactory::new(device_capabilities(CallCounter::default())).with_instance(instance);
    let client = factory.create(
        "h",
        1,
        meshcore_gateway::transport::EventSender::new(7, events_tx),
    );
    let live = LiveConnection::new(7, client);

    let out = gw.invoke(Some(&live), call("echo", vec![json!(1)])).await;
    assert_eq!(out, RpcOutcome::Ok { result: json!("from instance") });
}

#[tokio::test]
async fn completion_after_shutdown_does_not_publish() {
    let gate = Arc::new(Notify::new());
    let mut caps = CapabilityTable::new();
    let g = gate.clone();
    caps.register("slow", move |_| {
        let g = g.clone();
        async move {
            g.notified().await;
            Ok(json!("late"))
        }
    });
    let (gw, live, sink, shutdown_tx) = gateway_fixture(caps);

    let pending = tokio::spawn({
        let gw = gw.clone();
        let live = live.clone();
        async move { gw.invoke(Some(&live), call("slow", vec![])).await }
    });
    tokio::task::yield_now().await;
    shutdown_tx.send_replace(true);
    gate.notify_one();

    let out = pending.await.unwrap();
    assert_eq!(out, RpcOutcome::Ok { result: json!("late") });
    assert_eq!(sink.get_value(keys::RPC_LAST_RESULT), None);
}

#[tokio::test]
async fn calls_through_service_run_concurrently() {
    let gate = Arc::new(Notify::new());
    let mut caps = device_capabilities(CallCounter::default());
    let g = gate.clone();
    caps.register("slow", move |_| {
        let g = g.clone();
        async move {
            g.notified().await;
            Ok(json!("slow done"))
        }
    });
    let h = start(FakeFactory::new(caps), config(5000));
    wait_for_state(&h.service, ConnectionState::Connected).await;

    let slow = tokio::spawn({
        let service = h.service.clone();
        async move { service.invoke(RpcRequest::new("slow", vec![])).await }
    });
    settle().await;

    // A second call completes while the first is still parked.
    let fast = h.service.invoke(RpcRequest::new("echo", vec![json!("x")])).await;
    assert_eq!(fast, RpcOutcome::Ok { result: json!(["x"]) });
    assert!(!slow.is_finished());

    gate.notify_one();
    assert_eq!(
        slow.await.unwrap(),
        RpcOutcome::Ok { result: json!("slow done") }
    );
    h.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn service_reports_not_connected_while_connecting() {
    let factory = FakeFactory::new(device_capabilities(CallCounter::default()))
        .with_script(vec![ConnectStep::Hang], ConnectStep::Hang);
    let h = start(factory, config(5000));
    settle().await;
    assert_eq!(h.service.state(), ConnectionState::Connecting);
    let out = h.service.invoke(RpcRequest::new("getContacts", vec![])).await;
    assert_eq!(out, RpcOutcome::err("not connected"));
    h.service.shutdown().await;
}
