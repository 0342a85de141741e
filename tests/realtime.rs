//! Realtime connection tests against a mock WebSocket server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use resilient_client::realtime::{ConnectionState, RealtimeMessage};
use resilient_client::{ResilienceConfig, ResilienceFacade};

mod common;

use common::MockRealtimeServer;

fn realtime_config(url: String) -> ResilienceConfig {
    let mut config = ResilienceConfig::default();
    config.realtime.enabled = true;
    config.realtime.primary_url = url;
    config.realtime.heartbeat_interval_ms = 200;
    config.realtime.response_timeout_ms = 1_000;
    config.realtime.reconnect_attempts = 50;
    config.realtime.reconnect_base_ms = 20;
    config.realtime.reconnect_max_ms = 100;
    config.auth.token = "test-token".into();
    config.auth.identity = "tester".into();
    config
}

async fn wait_until<F: Fn() -> bool>(limit: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_connects_and_exchanges_messages() {
    let mut server = MockRealtimeServer::start().await;
    let facade = ResilienceFacade::builder(realtime_config(server.url())).build().unwrap();

    let inbound = Arc::new(Mutex::new(Vec::new()));
    let sink = inbound.clone();
    let _sub = facade
        .subscribe_realtime(move |msg| sink.lock().unwrap().push(msg.clone()))
        .unwrap();

    facade.connect_realtime().unwrap();
    let manager = facade.realtime_manager().unwrap();
    assert!(manager.wait_for(ConnectionState::Connected, Duration::from_secs(5)).await);

    facade
        .send_realtime(&RealtimeMessage::new("comment", serde_json::json!({"text": "hi"})))
        .unwrap();
    let frame = server.next_received(Duration::from_secs(2)).await.expect("frame delivered");
    assert!(frame.contains("\"comment\""));

    server.push(r#"{"type":"post_created","payload":{"id":7}}"#);
    assert!(wait_until(Duration::from_secs(2), || !inbound.lock().unwrap().is_empty()).await);
    let received = inbound.lock().unwrap()[0].clone();
    assert_eq!(received.kind, "post_created");
    assert_eq!(received.payload["id"], 7);

    facade.shutdown().await;
    assert_eq!(facade.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_reconnects_and_delivers_buffered_messages_in_order() {
    let mut server = MockRealtimeServer::start().await;
    let facade = ResilienceFacade::builder(realtime_config(server.url())).build().unwrap();

    facade.connect_realtime().unwrap();
    let manager = facade.realtime_manager().unwrap().clone();
    assert!(manager.wait_for(ConnectionState::Connected, Duration::from_secs(5)).await);

    // Outage: close the link and refuse new upgrades
    server.set_accepting(false);
    server.drop_connections();
    assert!(wait_until(Duration::from_secs(2), || manager.state() != ConnectionState::Connected).await);

    for text in ["first", "second", "third"] {
        facade
            .send_realtime(&RealtimeMessage::new("note", serde_json::json!({ "text": text })))
            .unwrap();
    }
    assert_eq!(manager.buffered(), 3);

    server.set_accepting(true);
    assert!(manager.wait_for(ConnectionState::Connected, Duration::from_secs(5)).await);

    let mut delivered = Vec::new();
    while delivered.len() < 3 {
        let frame = server.next_received(Duration::from_secs(2)).await.expect("buffered frame delivered");
        let msg = RealtimeMessage::parse(&frame).unwrap();
        delivered.push(msg.payload["text"].as_str().unwrap().to_string());
    }
    assert_eq!(delivered, vec!["first", "second", "third"]);
    assert_eq!(manager.buffered(), 0);
    assert!(server.connections() >= 2);

    facade.shutdown().await;
}

#[tokio::test]
async fn test_gives_up_after_reconnect_attempts() {
    let server = MockRealtimeServer::start().await;
    let mut config = realtime_config(server.url());
    config.realtime.reconnect_attempts = 2;
    let facade = ResilienceFacade::builder(config).build().unwrap();

    let degraded = Arc::new(Mutex::new(None));
    let slot = degraded.clone();
    let _sub = facade
        .on_degraded(move |d| *slot.lock().unwrap() = Some(d.attempts))
        .unwrap();

    server.set_accepting(false);
    facade.connect_realtime().unwrap();
    let manager = facade.realtime_manager().unwrap().clone();
    assert!(manager.wait_for(ConnectionState::Failed, Duration::from_secs(5)).await);
    assert!(degraded.lock().unwrap().is_some());
    assert!(facade.connect_realtime().is_err());

    // Leaving degraded mode requires an explicit reset
    server.set_accepting(true);
    facade.reset_realtime().unwrap();
    assert!(manager.wait_for(ConnectionState::Connected, Duration::from_secs(5)).await);

    facade.shutdown().await;
}

#[tokio::test]
async fn test_rejected_credentials_fail_handshake() {
    let server = MockRealtimeServer::start().await;
    let mut config = realtime_config(server.url());
    config.auth.token = String::new();
    config.realtime.reconnect_attempts = 1;
    let facade = ResilienceFacade::builder(config).build().unwrap();

    facade.connect_realtime().unwrap();
    let manager = facade.realtime_manager().unwrap().clone();
    assert!(manager.wait_for(ConnectionState::Failed, Duration::from_secs(5)).await);

    facade.shutdown().await;
}
