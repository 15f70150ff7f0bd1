//! Handshake over a real socket against a minimal in-process live query server.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use live_query::{
    ChannelHandler, ClientConfig, ConnectionState, EventKind, HandlerEvent, LiveQuery,
    SubscriptionRegistry,
};

/// Accept one client, answer its handshake, push one update after the
/// subscription, and forward every received frame to `seen`.
async fn run_server(listener: TcpListener, seen: mpsc::UnboundedSender<Value>) {
    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = accept_async(stream).await.unwrap();

    while let Some(Ok(msg)) = ws.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        let request: Value = serde_json::from_str(text.as_str()).unwrap();
        let _ = seen.send(request.clone());

        let replies = match request["op"].as_str() {
            Some("connect") => vec![json!({"op": "connected", "clientId": "c-1"})],
            Some("subscribe") => vec![
                json!({"op": "subscribed", "requestId": request["requestId"]}),
                json!({"op": "update", "requestId": request["requestId"], "object": {"locX": 5}}),
            ],
            Some("unsubscribe") => {
                vec![json!({"op": "unsubscribed", "requestId": request["requestId"]})]
            }
            _ => Vec::new(),
        };
        for reply in replies {
            ws.send(Message::Text(reply.to_string().into())).await.unwrap();
        }
    }
}

#[tokio::test]
async fn handshake_over_websocket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_server(listener, seen_tx));

    let mut config = ClientConfig::new(format!("ws://{addr}"), "APP123");
    config.teardown.poll_interval = Duration::from_millis(5);
    let registry = SubscriptionRegistry::with_websocket(config);

    let (handler, mut events) = ChannelHandler::new();
    let handle = registry
        .add_subscription("players", LiveQuery::new("PlayerData"), handler)
        .await
        .unwrap();

    let mut kinds = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !kinds.contains(&EventKind::Update) {
        assert!(tokio::time::Instant::now() < deadline, "no update received");
        registry.pump_all().await;
        while let Ok(item) = events.try_recv() {
            if let HandlerEvent::Event(event) = item {
                kinds.push(event.kind());
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        kinds,
        vec![EventKind::Connected, EventKind::Subscribed, EventKind::Update]
    );
    assert_eq!(handle.lock().await.state(), ConnectionState::Open);

    registry.unsubscribe_all().await;
    assert!(registry.is_empty().await);
    assert_eq!(handle.lock().await.state(), ConnectionState::Closed);

    let mut ops = Vec::new();
    while let Ok(frame) = seen_rx.try_recv() {
        ops.push(frame["op"].as_str().unwrap().to_string());
    }
    assert_eq!(ops, vec!["connect", "subscribe", "unsubscribe"]);
}
