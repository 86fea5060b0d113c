//! End-to-end tests of the feed manager against an in-process WebSocket server

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

use position_feed::{
    Channel, Config, ConnectionState, FeedError, FeedEvent, FeedManager, FeedMessage, FeedMetrics,
};

type ServerStream = WebSocketStream<TcpStream>;

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    (listener, url)
}

fn test_config(url: &str, channels: Vec<Channel>) -> Config {
    Config {
        ws_endpoint: url.to_string(),
        channels,
        reconnect_delay_ms: 20,
        max_reconnect_delay_ms: 100,
        max_reconnect_attempts: 3,
        heartbeat_interval_ms: 1_000,
        heartbeat_timeout_ms: 5_000,
        connect_timeout_ms: 1_000,
        ..Config::default()
    }
}

fn metrics() -> FeedMetrics {
    FeedMetrics::register(&prometheus::Registry::new()).unwrap()
}

async fn accept(listener: &TcpListener) -> ServerStream {
    let (stream, _) = listener.accept().await.unwrap();
    accept_async(stream).await.unwrap()
}

/// Next client request that is not a heartbeat ping
async fn next_request(ws: &mut ServerStream) -> Value {
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => {
                let request: Value = serde_json::from_str(&text).unwrap();
                if request["op"] != "ping" {
                    return request;
                }
            }
            _ => continue,
        }
    }
}

async fn send(ws: &mut ServerStream, frame: Value) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

async fn ack_all(ws: &mut ServerStream, request: &Value) {
    let id = request["id"].as_u64().unwrap();
    for channel in request["args"].as_array().unwrap() {
        send(ws, json!({"event": "subscribed", "channel": channel, "id": id})).await;
    }
}

/// Read until the client goes away
async fn hold(mut ws: ServerStream) {
    while let Some(Ok(message)) = ws.next().await {
        if message.is_close() {
            break;
        }
    }
}

async fn wait_for<F>(events: &mut broadcast::Receiver<FeedEvent>, mut matches: F) -> FeedEvent
where
    F: FnMut(&FeedEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for feed event")
}

fn btc_position() -> Value {
    json!({
        "symbol": "BTCUSDT", "side": "LONG", "size": "0.5", "entryPrice": "50000",
        "markPrice": "50500", "leverage": 20
    })
}

#[tokio::test]
async fn test_subscribes_and_delivers_typed_messages() {
    let (listener, url) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let request = next_request(&mut ws).await;
        ack_all(&mut ws, &request).await;

        send(&mut ws, json!({"channel": "positions", "type": "snapshot", "data": [btc_position()]})).await;
        // Not subscribed: must be dropped
        send(&mut ws, json!({"channel": "markPrice:ETHUSDT", "data": {"symbol": "ETHUSDT", "markPrice": "3000"}})).await;
        send(&mut ws, json!({"channel": "markPrice:BTCUSDT", "data": {"symbol": "BTCUSDT", "markPrice": "50600"}})).await;

        hold(ws).await;
        request
    });

    let config = test_config(&url, vec![Channel::Positions, Channel::MarkPrice("BTCUSDT".into())]);
    let metrics = metrics();
    let (handle, manager) = FeedManager::new(Arc::new(config), metrics.clone()).unwrap();
    let mut events = handle.events();
    let task = tokio::spawn(manager.run());

    wait_for(&mut events, |e| *e == FeedEvent::Connected).await;

    match wait_for(&mut events, |e| matches!(e, FeedEvent::Message(FeedMessage::Positions { .. }))).await {
        FeedEvent::Message(FeedMessage::Positions { snapshot, positions }) => {
            assert!(snapshot);
            assert_eq!(positions[0].symbol, "BTCUSDT");
        }
        other => panic!("unexpected event {:?}", other),
    }

    match wait_for(&mut events, |e| matches!(e, FeedEvent::Message(FeedMessage::MarkPrice(_)))).await {
        FeedEvent::Message(FeedMessage::MarkPrice(update)) => assert_eq!(update.symbol, "BTCUSDT"),
        other => panic!("unexpected event {:?}", other),
    }

    assert_eq!(handle.state(), ConnectionState::Connected);
    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(handle.state(), ConnectionState::Closed);
    assert_eq!(metrics.dropped_messages.get(), 1);
    assert_eq!(metrics.connects.get(), 1);

    let request = server.await.unwrap();
    assert_eq!(request["op"], "subscribe");
    assert_eq!(request["args"], json!(["positions", "markPrice:BTCUSDT"]));
}

#[tokio::test]
async fn test_reconnect_replays_subscriptions() {
    let (listener, url) = bind().await;

    let server = tokio::spawn(async move {
        let mut first = accept(&listener).await;
        let first_request = next_request(&mut first).await;
        ack_all(&mut first, &first_request).await;
        first.close(None).await.unwrap();
        drop(first);

        let mut second = accept(&listener).await;
        let second_request = next_request(&mut second).await;
        ack_all(&mut second, &second_request).await;
        send(&mut second, json!({"channel": "positions", "data": btc_position()})).await;

        hold(second).await;
        (first_request, second_request)
    });

    let config = test_config(&url, vec![Channel::Positions, Channel::Account]);
    let (handle, manager) = FeedManager::new(Arc::new(config), metrics()).unwrap();
    let mut events = handle.events();
    let task = tokio::spawn(manager.run());

    wait_for(&mut events, |e| matches!(e, FeedEvent::Disconnected { .. })).await;
    match wait_for(&mut events, |e| matches!(e, FeedEvent::Reconnecting { .. })).await {
        FeedEvent::Reconnecting { attempt, delay } => {
            assert_eq!(attempt, 1);
            assert_eq!(delay, Duration::from_millis(20));
        }
        other => panic!("unexpected event {:?}", other),
    }
    wait_for(&mut events, |e| *e == FeedEvent::Connected).await;
    wait_for(&mut events, |e| matches!(e, FeedEvent::Message(FeedMessage::Positions { snapshot: false, .. }))).await;

    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();

    let (first, second) = server.await.unwrap();
    assert_eq!(first["args"], second["args"]);
    assert!(second["id"].as_u64().unwrap() > first["id"].as_u64().unwrap());
}

#[tokio::test]
async fn test_runtime_subscribe_and_rejection() {
    let (listener, url) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let initial = next_request(&mut ws).await;
        ack_all(&mut ws, &initial).await;

        let added = next_request(&mut ws).await;
        send(
            &mut ws,
            json!({"event": "error", "id": added["id"], "code": 404, "message": "channel not available"}),
        )
        .await;
        // A late ack must not revive the rejected channel
        send(&mut ws, json!({"event": "subscribed", "channel": "account", "id": added["id"]})).await;

        // The next request after the rejection
        let next = next_request(&mut ws).await;
        hold(ws).await;
        (added, next)
    });

    let config = test_config(&url, vec![Channel::Positions]);
    let (handle, manager) = FeedManager::new(Arc::new(config), metrics()).unwrap();
    let mut events = handle.events();
    let task = tokio::spawn(manager.run());

    wait_for(&mut events, |e| matches!(e, FeedEvent::Message(FeedMessage::Subscribed { .. }))).await;
    handle.subscribe(Channel::Account).await.unwrap();

    match wait_for(&mut events, |e| matches!(e, FeedEvent::SubscriptionRejected { .. })).await {
        FeedEvent::SubscriptionRejected { channel, reason } => {
            assert_eq!(channel, Channel::Account);
            assert_eq!(reason, "channel not available");
        }
        other => panic!("unexpected event {:?}", other),
    }

    // Nothing to unsubscribe from on the venue side
    handle.unsubscribe(Channel::Account).await.unwrap();
    handle.subscribe(Channel::MarkPrice("BTCUSDT".into())).await.unwrap();

    let (added, next) = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap_or_else(|e| panic!("server task failed: {}", e));
    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(added["op"], "subscribe");
    assert_eq!(added["args"], json!(["account"]));
    assert_eq!(next["op"], "subscribe");
    assert_eq!(next["args"], json!(["markPrice:BTCUSDT"]));
}

#[tokio::test]
async fn test_silent_connection_is_dropped() {
    let (listener, url) = bind().await;

    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let ws = accept(&listener).await;
        // Refuse further connections so the reconnect fails fast
        drop(listener);
        // Never answer anything
        let _ = release_rx.await;
        drop(ws);
    });

    let mut config = test_config(&url, vec![Channel::Positions]);
    config.heartbeat_interval_ms = 50;
    config.heartbeat_timeout_ms = 200;
    let (handle, manager) = FeedManager::new(Arc::new(config), metrics()).unwrap();
    let mut events = handle.events();
    let task = tokio::spawn(manager.run());

    match wait_for(&mut events, |e| matches!(e, FeedEvent::Disconnected { .. })).await {
        FeedEvent::Disconnected { reason } => assert!(reason.contains("No frame received"), "{}", reason),
        other => panic!("unexpected event {:?}", other),
    }

    // The manager may already have given up and dropped its receiver
    let _ = handle.shutdown().await;
    let _ = release_tx.send(());
    server.await.unwrap();

    // Shutdown may land during a retry or after attempts run out
    let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Ok(()) | Err(FeedError::MaxReconnectAttemptsExceeded { .. })
    ));
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    // Bind then release a port so nothing is listening on it
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let mut config = test_config(&format!("ws://{}/ws", addr), vec![Channel::Positions]);
    config.max_reconnect_attempts = 2;
    config.reconnect_delay_ms = 10;

    let (handle, manager) = FeedManager::new(Arc::new(config), metrics()).unwrap();
    let mut events = handle.events();

    let result = tokio::time::timeout(Duration::from_secs(5), manager.run())
        .await
        .unwrap();
    assert!(matches!(
        result,
        Err(FeedError::MaxReconnectAttemptsExceeded { attempts: 2 })
    ));
    assert_eq!(handle.state(), ConnectionState::Closed);

    let mut attempts = Vec::new();
    let mut gave_up = None;
    while let Ok(event) = events.try_recv() {
        match event {
            FeedEvent::Reconnecting { attempt, delay } => attempts.push((attempt, delay)),
            FeedEvent::GaveUp { attempts } => gave_up = Some(attempts),
            FeedEvent::Connected => panic!("nothing should accept the connection"),
            _ => {}
        }
    }
    assert_eq!(
        attempts,
        vec![(1, Duration::from_millis(10)), (2, Duration::from_millis(20))]
    );
    assert_eq!(gave_up, Some(2));
}

/// Accepts TCP connections and never answers on them
async fn silent_listener() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    (addr, task)
}

#[tokio::test]
async fn test_hung_rest_bootstrap_does_not_block_stream_or_shutdown() {
    let (listener, url) = bind().await;
    let (rest_addr, rest) = silent_listener().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let request = next_request(&mut ws).await;
        ack_all(&mut ws, &request).await;
        send(&mut ws, json!({"channel": "positions", "data": btc_position()})).await;
        hold(ws).await;
    });

    let mut config = test_config(&url, vec![Channel::Positions]);
    config.rest_endpoint = Some(format!("http://{}", rest_addr));
    config.rest_timeout_ms = 10_000;
    let (handle, manager) = FeedManager::new(Arc::new(config), metrics()).unwrap();
    let mut events = handle.events();
    let task = tokio::spawn(manager.run());

    wait_for(&mut events, |e| *e == FeedEvent::Connected).await;
    wait_for(&mut events, |e| matches!(e, FeedEvent::Message(FeedMessage::Positions { snapshot: false, .. }))).await;

    handle.shutdown().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(3), task)
        .await
        .expect("shutdown stalled behind the REST fetch")
        .unwrap();
    assert!(result.is_ok());

    server.await.unwrap();
    rest.abort();
}

/// Reconnect attempt numbers seen across two sessions the server cuts short
async fn attempts_after_two_drops(backoff_reset_secs: u64) -> Vec<u32> {
    let (listener, url) = bind().await;

    let server = tokio::spawn(async move {
        for _ in 0..2 {
            let mut ws = accept(&listener).await;
            let request = next_request(&mut ws).await;
            ack_all(&mut ws, &request).await;
            ws.close(None).await.unwrap();
        }
        let ws = accept(&listener).await;
        hold(ws).await;
    });

    let mut config = test_config(&url, vec![Channel::Positions]);
    config.backoff_reset_secs = backoff_reset_secs;
    let (handle, manager) = FeedManager::new(Arc::new(config), metrics()).unwrap();
    let mut events = handle.events();
    let task = tokio::spawn(manager.run());

    let mut attempts = Vec::new();
    while attempts.len() < 2 {
        if let FeedEvent::Reconnecting { attempt, .. } =
            wait_for(&mut events, |e| matches!(e, FeedEvent::Reconnecting { .. })).await
        {
            attempts.push(attempt);
        }
    }
    wait_for(&mut events, |e| *e == FeedEvent::Connected).await;

    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
    server.await.unwrap();
    attempts
}

#[tokio::test]
async fn test_stable_session_resets_reconnect_counter() {
    // Every session counts as stable
    assert_eq!(attempts_after_two_drops(0).await, vec![1, 1]);
}

#[tokio::test]
async fn test_short_sessions_keep_counting_attempts() {
    assert_eq!(attempts_after_two_drops(300).await, vec![1, 2]);
}

#[tokio::test]
async fn test_subscribe_while_reconnecting_joins_replay() {
    let (listener, url) = bind().await;

    let server = tokio::spawn(async move {
        let mut first = accept(&listener).await;
        let first_request = next_request(&mut first).await;
        ack_all(&mut first, &first_request).await;
        first.close(None).await.unwrap();
        drop(first);

        let mut second = accept(&listener).await;
        let second_request = next_request(&mut second).await;
        ack_all(&mut second, &second_request).await;
        hold(second).await;
        (first_request, second_request)
    });

    let mut config = test_config(&url, vec![Channel::Positions]);
    config.reconnect_delay_ms = 300;
    config.max_reconnect_delay_ms = 1_000;
    let (handle, manager) = FeedManager::new(Arc::new(config), metrics()).unwrap();
    let mut events = handle.events();
    let task = tokio::spawn(manager.run());

    wait_for(&mut events, |e| matches!(e, FeedEvent::Reconnecting { .. })).await;
    handle.subscribe(Channel::Account).await.unwrap();
    wait_for(&mut events, |e| *e == FeedEvent::Connected).await;

    let (first, second) = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap_or_else(|e| panic!("server task failed: {}", e));
    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(first["args"], json!(["positions"]));
    let replayed = second["args"].as_array().unwrap();
    assert_eq!(second["op"], "subscribe");
    assert_eq!(replayed.len(), 2);
    assert!(replayed.contains(&json!("positions")));
    assert!(replayed.contains(&json!("account")));
}

#[tokio::test]
async fn test_dropping_every_handle_stops_the_feed() {
    let (listener, url) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let request = next_request(&mut ws).await;
        ack_all(&mut ws, &request).await;
        hold(ws).await;
    });

    let config = test_config(&url, vec![Channel::Positions]);
    let (handle, manager) = FeedManager::new(Arc::new(config), metrics()).unwrap();
    let mut events = handle.events();
    let second_handle = handle.clone();
    let task = tokio::spawn(manager.run());

    wait_for(&mut events, |e| *e == FeedEvent::Connected).await;
    drop(handle);
    drop(second_handle);

    let result = tokio::time::timeout(Duration::from_secs(3), task)
        .await
        .expect("feed kept running without handles")
        .unwrap();
    assert!(result.is_ok());

    // The socket is closed on the way out
    tokio::time::timeout(Duration::from_secs(3), server)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_dropping_every_handle_stops_offline_feed() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let mut config = test_config(&format!("ws://{}/ws", addr), vec![Channel::Positions]);
    // Retry forever so only the dropped handle can end the loop
    config.max_reconnect_attempts = 0;
    let (handle, manager) = FeedManager::new(Arc::new(config), metrics()).unwrap();
    let mut events = handle.events();
    let task = tokio::spawn(manager.run());

    wait_for(&mut events, |e| matches!(e, FeedEvent::Reconnecting { .. })).await;
    drop(handle);

    let result = tokio::time::timeout(Duration::from_secs(3), task)
        .await
        .expect("feed kept retrying without handles")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_connect_times_out_without_handshake() {
    let (addr, server) = silent_listener().await;

    let mut client = position_feed::websocket::WebSocketClient::new(&format!("ws://{}/ws", addr));
    let started = std::time::Instant::now();
    let result = client.connect(Duration::from_millis(200)).await;

    assert!(matches!(result, Err(FeedError::ConnectionTimeout)));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!client.is_connected());
    server.abort();
}

#[tokio::test]
async fn test_runtime_unsubscribe_drops_channel_data() {
    let (listener, url) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let request = next_request(&mut ws).await;
        ack_all(&mut ws, &request).await;

        let removed = next_request(&mut ws).await;
        send(&mut ws, json!({"event": "unsubscribed", "channel": "markPrice:BTCUSDT"})).await;
        send(&mut ws, json!({"channel": "markPrice:BTCUSDT", "data": {"symbol": "BTCUSDT", "markPrice": "50600"}})).await;
        send(&mut ws, json!({"channel": "positions", "data": btc_position()})).await;

        hold(ws).await;
        removed
    });

    let config = test_config(&url, vec![Channel::Positions, Channel::MarkPrice("BTCUSDT".into())]);
    let metrics = metrics();
    let (handle, manager) = FeedManager::new(Arc::new(config), metrics.clone()).unwrap();
    let mut events = handle.events();
    let task = tokio::spawn(manager.run());

    wait_for(&mut events, |e| *e == FeedEvent::Connected).await;
    handle.unsubscribe(Channel::MarkPrice("BTCUSDT".into())).await.unwrap();

    wait_for(&mut events, |e| {
        assert!(
            !matches!(e, FeedEvent::Message(FeedMessage::MarkPrice(_))),
            "mark price delivered after unsubscribe"
        );
        matches!(e, FeedEvent::Message(FeedMessage::Positions { .. }))
    })
    .await;
    assert_eq!(metrics.dropped_messages.get(), 1);

    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();

    let removed = server.await.unwrap();
    assert_eq!(removed["op"], "unsubscribe");
    assert_eq!(removed["args"], json!(["markPrice:BTCUSDT"]));
}

#[tokio::test]
async fn test_heartbeat_sends_pings() {
    let (listener, url) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let mut pings = Vec::new();
        while pings.len() < 3 {
            let Message::Text(text) = ws.next().await.unwrap().unwrap() else {
                continue;
            };
            let frame: Value = serde_json::from_str(&text).unwrap();
            match frame["op"].as_str() {
                Some("subscribe") => ack_all(&mut ws, &frame).await,
                Some("ping") => {
                    let ts = frame["ts"].as_i64().expect("ping carries a timestamp");
                    send(&mut ws, json!({"event": "pong", "ts": ts})).await;
                    pings.push(ts);
                }
                _ => {}
            }
        }
        (ws, pings)
    });

    let mut config = test_config(&url, vec![Channel::Positions]);
    config.heartbeat_interval_ms = 100;
    config.heartbeat_timeout_ms = 1_000;
    let metrics = metrics();
    let (handle, manager) = FeedManager::new(Arc::new(config), metrics.clone()).unwrap();
    let mut events = handle.events();
    let task = tokio::spawn(manager.run());

    let (ws, pings) = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap_or_else(|e| panic!("server task failed: {}", e));
    assert_eq!(pings.len(), 3);
    assert!(pings.windows(2).all(|pair| pair[0] <= pair[1]));

    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
    drop(ws);

    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, FeedEvent::Disconnected { .. }),
            "answered heartbeats must keep the session"
        );
    }
    assert_eq!(metrics.connects.get(), 1);
}
