//! Integration tests for the proxy against a minimal in-process WebSocket
//! server (no mocks): correlation, server push, session restore, logout.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use spothoot_client::{
    ClientError, MemoryStore, Proxy, ReplyData, SessionStore, SERVICE_READY, SESSION_KEY,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

type ServerWs = WebSocketStream<TcpStream>;

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, format!("ws://127.0.0.1:{}", port))
}

async fn accept(listener: &TcpListener) -> ServerWs {
    let (tcp_stream, _) = listener.accept().await.unwrap();
    accept_async(tcp_stream).await.unwrap()
}

/// Next text frame from the client, parsed as JSON.
async fn next_json(ws: &mut ServerWs) -> Value {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(t))) => return serde_json::from_str(&t).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("client went away: {:?}", other),
        }
    }
}

async fn send_json(ws: &mut ServerWs, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Keep the socket open until the client hangs up.
async fn drain(ws: &mut ServerWs) {
    while let Some(Ok(_)) = ws.next().await {}
}

async fn connected(store: Arc<MemoryStore>, url: &str) -> Proxy {
    let proxy = Proxy::new(store);
    let mut ready = proxy.subscribe(SERVICE_READY);
    proxy.connect(url).await.expect("connect should succeed");
    tokio::time::timeout(Duration::from_secs(2), ready.recv())
        .await
        .expect("service-ready should fire")
        .expect("subscription open");
    assert!(proxy.is_ready());
    proxy
}

#[tokio::test]
async fn login_round_trip_stores_session() {
    let (listener, url) = listen().await;
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let req = next_json(&mut ws).await;
        assert_eq!(req["action"], "login");
        assert_eq!(req["data"], json!({"code": "abc"}));
        send_json(
            &mut ws,
            json!({"request_id": req["request_id"], "data": r#"{"id":5,"name":"Al"}"#}),
        )
        .await;
        drain(&mut ws).await;
    });

    let store = Arc::new(MemoryStore::new());
    let proxy = connected(store.clone(), &url).await;
    assert!(!proxy.is_logged_in());

    let user = proxy.login("abc").await.expect("login should succeed");
    assert_eq!(user.name(), Some("Al"));
    assert!(proxy.is_logged_in());
    assert_eq!(proxy.pending_calls(), 0);

    let stored = store.get(SESSION_KEY).unwrap().expect("session persisted");
    let stored: Value = serde_json::from_str(&stored).unwrap();
    assert_eq!(stored, json!({"id": 5, "name": "Al"}));
}

#[tokio::test]
async fn server_push_reaches_subscribers_without_touching_calls() {
    let (listener, url) = listen().await;
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let req = next_json(&mut ws).await;
        assert_eq!(req["action"], "getUsers");
        send_json(&mut ws, json!({"action": "scoreUpdate", "data": {"score": 10}})).await;
        send_json(
            &mut ws,
            json!({"request_id": req["request_id"], "action": "getUsers", "data": r#"[{"id":1,"name":"Al"}]"#}),
        )
        .await;
        drain(&mut ws).await;
    });

    let proxy = connected(Arc::new(MemoryStore::new()), &url).await;
    let mut first = proxy.subscribe("scoreUpdate");
    let mut second = proxy.subscribe("scoreUpdate");

    let users = proxy.get_users().await.expect("getUsers should succeed");
    assert_eq!(users, ReplyData::Parsed(json!([{"id": 1, "name": "Al"}])));

    for sub in [&mut first, &mut second] {
        let event = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.action, "scoreUpdate");
        assert_eq!(event.request_id, None);
        assert_eq!(event.data, json!({"score": 10}));
    }
}

#[tokio::test]
async fn rejected_session_is_cleared_on_connect() {
    let (listener, url) = listen().await;
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let req = next_json(&mut ws).await;
        assert_eq!(req["action"], "setUser");
        assert_eq!(req["request_id"], 0);
        assert_eq!(req["data"], json!({"id": 5}));
        send_json(&mut ws, json!({"request_id": 0, "action": "setUser", "data": false})).await;
        drain(&mut ws).await;
    });

    let store = Arc::new(MemoryStore::new());
    store.set(SESSION_KEY, r#"{"id":5,"name":"Al"}"#).unwrap();
    let proxy = connected(store.clone(), &url).await;

    tokio::time::timeout(Duration::from_secs(2), async {
        while store.get(SESSION_KEY).unwrap().as_deref() != Some("") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stored session should be cleared");
    // In-memory record is left as restored.
    assert!(proxy.is_logged_in());
}

#[tokio::test]
async fn logout_clears_session_and_notifies_server() {
    let (listener, url) = listen().await;
    let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let req = next_json(&mut ws).await;
        send_json(
            &mut ws,
            json!({"request_id": req["request_id"], "data": r#"{"id":5,"name":"Al"}"#}),
        )
        .await;
        let logout = next_json(&mut ws).await;
        let _ = seen_tx.send(logout);
        drain(&mut ws).await;
    });

    let store = Arc::new(MemoryStore::new());
    let proxy = connected(store.clone(), &url).await;
    proxy.login("abc").await.unwrap();
    assert!(proxy.is_logged_in());

    proxy.logout().unwrap();
    assert!(!proxy.is_logged_in());
    assert!(proxy.user().is_empty());
    assert_eq!(store.get(SESSION_KEY).unwrap().as_deref(), Some(""));

    let logout = tokio::time::timeout(Duration::from_secs(2), seen_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(logout, json!({"action": "logout", "request_id": 1}));
}

#[tokio::test]
async fn malformed_frame_stops_reader() {
    let (listener, url) = listen().await;
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        ws.send(Message::Text("definitely not json".into()))
            .await
            .unwrap();
        drain(&mut ws).await;
    });

    let proxy = connected(Arc::new(MemoryStore::new()), &url).await;
    let result = tokio::time::timeout(Duration::from_secs(2), proxy.closed())
        .await
        .unwrap();
    assert!(matches!(result, Err(ClientError::MalformedMessage(_))));
}

#[tokio::test]
async fn connect_twice_is_rejected() {
    let (listener, url) = listen().await;
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        drain(&mut ws).await;
    });

    let proxy = connected(Arc::new(MemoryStore::new()), &url).await;
    assert!(matches!(
        proxy.connect(&url).await,
        Err(ClientError::AlreadyConnected)
    ));
}

#[tokio::test]
async fn connect_to_absent_server_fails() {
    let (listener, url) = listen().await;
    drop(listener);
    let proxy = Proxy::new(Arc::new(MemoryStore::new()));
    assert!(matches!(
        proxy.connect(&url).await,
        Err(ClientError::Transport(_))
    ));
    assert!(!proxy.is_ready());
}

#[tokio::test]
async fn shutdown_flushes_queued_frames_before_closing() {
    let (listener, url) = listen().await;
    let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let mut actions = Vec::new();
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(t) = msg {
                let frame: Value = serde_json::from_str(&t).unwrap();
                actions.push(frame["action"].as_str().unwrap_or_default().to_string());
            }
        }
        let _ = seen_tx.send(actions);
    });

    let store = Arc::new(MemoryStore::new());
    let proxy = connected(store.clone(), &url).await;
    drop(proxy.invoke("getUsers", None).unwrap());
    drop(proxy.invoke("getPlaylists", None).unwrap());
    proxy.logout().unwrap();
    proxy.shutdown().await;

    assert!(matches!(
        proxy.invoke("getUsers", None),
        Err(ClientError::Disconnected)
    ));
    let actions = tokio::time::timeout(Duration::from_secs(2), seen_rx)
        .await
        .expect("server should see the close")
        .unwrap();
    assert_eq!(actions, vec!["getUsers", "getPlaylists", "logout"]);
}
