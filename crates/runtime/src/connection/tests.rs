use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use super::*;

fn fast_config() -> ConnectionConfig {
	ConnectionConfig {
		connect_timeout: Duration::from_secs(2),
		read_timeout: Duration::from_secs(5),
		health_check_interval: Duration::from_secs(30),
		auto_reconnect: true,
		retry: RetryPolicy::new(Duration::from_millis(10), 5),
	}
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
	tokio::time::timeout(Duration::from_secs(5), rx.recv())
		.await
		.expect("timed out waiting for connection event")
		.expect("event channel closed")
}

async fn listener() -> (TcpListener, RemoteEndpoint) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	(listener, RemoteEndpoint::new("127.0.0.1", port))
}

/// An endpoint nothing is listening on.
async fn closed_endpoint() -> RemoteEndpoint {
	let (listener, endpoint) = listener().await;
	drop(listener);
	endpoint
}

#[test]
fn test_endpoint_parse_and_display() {
	let endpoint: RemoteEndpoint = "192.168.1.10:8765".parse().unwrap();
	assert_eq!(endpoint, RemoteEndpoint::new("192.168.1.10", 8765));
	assert_eq!(endpoint.to_string(), "192.168.1.10:8765");

	let v6: RemoteEndpoint = "[fe80::1]:9000".parse().unwrap();
	assert_eq!(v6.host, "fe80::1");
	assert_eq!(v6.to_string(), "[fe80::1]:9000");

	assert!("no-port".parse::<RemoteEndpoint>().is_err());
	assert!(":80".parse::<RemoteEndpoint>().is_err());
	assert!("host:99999".parse::<RemoteEndpoint>().is_err());
}

#[tokio::test]
async fn test_send_when_disconnected_fails_fast() {
	let (manager, _events) = ConnectionManager::new(fast_config());
	assert_eq!(manager.state(), ConnectionState::Disconnected);
	assert!(matches!(manager.send("{}").await, Err(Error::NotConnected)));
}

#[tokio::test]
async fn test_connect_receives_lines_and_sends() {
	let (listener, endpoint) = listener().await;
	let (manager, mut events) = ConnectionManager::new(fast_config());

	let server = tokio::spawn(async move {
		let (socket, _) = listener.accept().await.unwrap();
		let (read, mut write) = socket.into_split();
		write.write_all(b"{\"command\":\"query_capabilities\",\"ack_id\":\"1\"}\n").await.unwrap();
		let mut lines = BufReader::new(read).lines();
		lines.next_line().await.unwrap().unwrap()
	});

	manager.connect(endpoint.clone()).await.unwrap();
	assert!(manager.is_connected());
	assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected(endpoint.clone()));
	assert_eq!(
		next_event(&mut events).await,
		ConnectionEvent::Message(r#"{"command":"query_capabilities","ack_id":"1"}"#.to_string())
	);

	manager.send(r#"{"ack_id":"1","status":"ok"}"#).await.unwrap();
	assert_eq!(server.await.unwrap(), r#"{"ack_id":"1","status":"ok"}"#);

	let status = manager.status();
	assert_eq!(status.state, ConnectionState::Connected);
	assert_eq!(status.endpoint, Some(endpoint));
	assert_eq!(status.retry_attempt, 0);
}

#[tokio::test]
async fn test_reconnection_attempts_are_bounded() {
	let endpoint = closed_endpoint().await;
	let (manager, mut events) = ConnectionManager::new(fast_config());

	assert!(manager.connect(endpoint.clone()).await.is_err());

	loop {
		if let ConnectionEvent::RetriesExhausted(exhausted) = next_event(&mut events).await {
			assert_eq!(exhausted, endpoint);
			break;
		}
	}

	// Initial attempt plus five retries.
	assert_eq!(manager.connect_attempts(), 6);
	let status = manager.status();
	assert_eq!(status.state, ConnectionState::Disconnected);
	assert!(status.retries_exhausted);

	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(manager.connect_attempts(), 6);
}

#[tokio::test]
async fn test_disconnect_cancels_pending_retry() {
	let endpoint = closed_endpoint().await;
	let mut config = fast_config();
	config.retry = RetryPolicy::new(Duration::from_millis(200), 5);
	let (manager, _events) = ConnectionManager::new(config);

	assert!(manager.connect(endpoint).await.is_err());
	assert_eq!(manager.status().retry_attempt, 1);

	manager.disconnect().await;
	tokio::time::sleep(Duration::from_millis(400)).await;

	assert_eq!(manager.connect_attempts(), 1);
	assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
	let (manager, _events) = ConnectionManager::new(fast_config());
	manager.disconnect().await;
	manager.disconnect().await;
	assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_no_retry_when_auto_reconnect_disabled() {
	let endpoint = closed_endpoint().await;
	let mut config = fast_config();
	config.auto_reconnect = false;
	let (manager, _events) = ConnectionManager::new(config);

	let err = manager.connect(endpoint).await.unwrap_err();
	assert!(matches!(err, Error::ConnectFailed { .. }));
	tokio::time::sleep(Duration::from_millis(100)).await;

	assert_eq!(manager.connect_attempts(), 1);
	assert_eq!(manager.state(), ConnectionState::Error);
	assert!(manager.status().last_error.is_some());
}

#[tokio::test]
async fn test_peer_close_triggers_reconnect() {
	let (listener, endpoint) = listener().await;
	let (manager, mut events) = ConnectionManager::new(fast_config());

	let server = tokio::spawn(async move {
		let (first, _) = listener.accept().await.unwrap();
		drop(first);
		let (second, _) = listener.accept().await.unwrap();
		second
	});

	manager.connect(endpoint.clone()).await.unwrap();
	assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected(endpoint.clone()));
	assert!(matches!(next_event(&mut events).await, ConnectionEvent::Lost { .. }));
	assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected(endpoint));

	let _second = server.await.unwrap();
	assert!(manager.is_connected());
	assert_eq!(manager.connect_attempts(), 2);
}

#[tokio::test]
async fn test_idle_connection_sends_heartbeat() {
	let (listener, endpoint) = listener().await;
	let mut config = fast_config();
	config.read_timeout = Duration::from_millis(50);
	config.health_check_interval = Duration::ZERO;
	let (manager, _events) = ConnectionManager::new(config);

	let server = tokio::spawn(async move {
		let (socket, _) = listener.accept().await.unwrap();
		let mut lines = BufReader::new(socket).lines();
		lines.next_line().await.unwrap().unwrap()
	});

	manager.connect(endpoint).await.unwrap();
	let line = tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
	let value: serde_json::Value = serde_json::from_str(&line).unwrap();
	assert_eq!(value["type"], "heartbeat");
	assert_eq!(value["v"], "2.0");
}

#[tokio::test]
async fn test_health_check_rearms_exhausted_budget() {
	let endpoint = closed_endpoint().await;
	let mut config = fast_config();
	config.retry = RetryPolicy::new(Duration::from_millis(10), 0);
	let (manager, mut events) = ConnectionManager::new(config);

	assert!(manager.connect(endpoint.clone()).await.is_err());
	assert_eq!(next_event(&mut events).await, ConnectionEvent::RetriesExhausted(endpoint.clone()));
	assert!(manager.status().retries_exhausted);

	let listener = TcpListener::bind(("127.0.0.1", endpoint.port)).await.unwrap();
	let accept = tokio::spawn(async move { listener.accept().await.map(|(socket, _)| socket) });

	assert!(!manager.check_health().await);
	assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected(endpoint));
	assert!(accept.await.unwrap().is_ok());
	assert!(!manager.status().retries_exhausted);
}

#[tokio::test]
async fn test_oversized_inbound_line_drops_connection() {
	let (listener, endpoint) = listener().await;
	let mut config = fast_config();
	config.auto_reconnect = false;
	let (manager, mut events) = ConnectionManager::new(config);

	let server = tokio::spawn(async move {
		let (mut socket, _) = listener.accept().await.unwrap();
		let junk = vec![b'x'; nodelink_protocol::MAX_LINE_LEN + 16];
		let _ = socket.write_all(&junk).await;
		socket
	});

	manager.connect(endpoint).await.unwrap();
	assert!(matches!(next_event(&mut events).await, ConnectionEvent::Connected(_)));
	match next_event(&mut events).await {
		ConnectionEvent::Lost { reason, .. } => assert!(reason.contains("Framing"), "reason: {reason}"),
		other => panic!("unexpected event: {other:?}"),
	}
	let _socket = server.await.unwrap();
	assert_eq!(manager.state(), ConnectionState::Error);
}

#[tokio::test]
async fn test_subscribe_observes_transitions() {
	let (listener, endpoint) = listener().await;
	let (manager, _events) = ConnectionManager::new(fast_config());
	let mut states = manager.subscribe();
	let _server = tokio::spawn(async move { listener.accept().await.map(|(socket, _)| socket) });

	manager.connect(endpoint).await.unwrap();
	states.wait_for(|state| *state == ConnectionState::Connected).await.unwrap();

	manager.disconnect().await;
	states.wait_for(|state| *state == ConnectionState::Disconnected).await.unwrap();
}
