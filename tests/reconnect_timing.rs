mod common;

use common::*;
use meshcore_gateway::lifecycle::ConnectionState;
use meshcore_gateway::status::{keys, StatusSink};
use meshcore_gateway::transport::CapabilityTable;
use serde_json::json;
use tokio::time::{sleep, Duration};

#[tokio::test(start_paused = true)]
async fn one_retry_per_interval_while_device_is_down() {
    let factory = FakeFactory::new(CapabilityTable::new())
        .with_script(vec![], ConnectStep::Fail("host unreachable".into()));
    let h = start(factory, config(5000));
    settle().await;
    assert_eq!(h.factory.created_count(), 1);
    assert_eq!(h.service.state(), ConnectionState::Disconnected);

    sleep(Duration::from_millis(4_999)).await;
    settle().await;
    assert_eq!(h.factory.created_count(), 1);

    sleep(Duration::from_millis(1)).await;
    settle().await;
    assert_eq!(h.factory.created_count(), 2);

    sleep(Duration::from_millis(10_000)).await;
    settle().await;
    assert_eq!(h.factory.created_count(), 4);

    let at = h.factory.created_at();
    for pair in at.windows(2) {
        assert_eq!(pair[1] - pair[0], Duration::from_millis(5_000));
    }
    assert_eq!(
        h.sink.get_value(keys::LAST_ERROR),
        Some(json!("host unreachable"))
    );
    // Every failed instance was closed before the next one was created.
    for i in 0..3 {
        assert_eq!(h.factory.client(i).close_count(), 1);
    }

    h.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_and_error_from_same_attempt_schedule_one_retry() {
    let factory = FakeFactory::new(CapabilityTable::new()).with_script(
        vec![ConnectStep::DropThenFail("handshake aborted".into())],
        ConnectStep::Hang,
    );
    let h = start(factory, config(5000));
    settle().await;
    assert_eq!(h.service.state(), ConnectionState::Disconnected);
    assert!(h
        .sink
        .writes_to(keys::LAST_ERROR)
        .contains(&json!("handshake aborted")));

    sleep(Duration::from_millis(5_000)).await;
    settle().await;
    assert_eq!(h.factory.created_count(), 2);

    // The second attempt hangs; nothing else may be pending behind it.
    sleep(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(h.factory.created_count(), 2);
    assert_eq!(h.service.state(), ConnectionState::Connecting);

    h.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn connect_error_is_published_whichever_report_lands_first() {
    // The event and the failed attempt race into the owner; run it enough
    // times to see both orders.
    for _ in 0..40 {
        let factory = FakeFactory::new(CapabilityTable::new()).with_script(
            vec![ConnectStep::DropThenFail("handshake aborted".into())],
            ConnectStep::Hang,
        );
        let h = start(factory, config(5000));
        settle().await;
        assert_eq!(h.service.state(), ConnectionState::Disconnected);
        assert_eq!(
            h.sink.get_value(keys::LAST_ERROR),
            Some(json!("handshake aborted"))
        );
        assert_eq!(h.sink.get_value(keys::CONNECTION), Some(json!(false)));

        sleep(Duration::from_millis(5_000)).await;
        settle().await;
        assert_eq!(h.factory.created_count(), 2);
        h.service.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn reconnect_after_drop_waits_full_interval() {
    let h = start(FakeFactory::new(CapabilityTable::new()), config(5000));
    wait_for_state(&h.service, ConnectionState::Connected).await;

    sleep(Duration::from_secs(17)).await;
    h.factory.client(0).drop_link();
    h.factory.client(0).drop_link();
    wait_for_state(&h.service, ConnectionState::Disconnected).await;

    sleep(Duration::from_millis(4_999)).await;
    settle().await;
    assert_eq!(h.factory.created_count(), 1);

    wait_for_state(&h.service, ConnectionState::Connected).await;
    let at = h.factory.created_at();
    assert_eq!(at.len(), 2);
    assert_eq!(at[1] - at[0], Duration::from_millis(22_000));

    h.service.shutdown().await;
}
