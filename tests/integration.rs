//! End-to-end scenarios: a real server and client over TCP and Unix sockets

use std::time::Duration;

use beamnet::network::{Endpoint, ReconnectPolicy, ServerOptions};
use beamnet::{Client, ClientError, ClientOptions, ClientState, ErrorCode, Payload, RequestError, Server};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct SumArgs {
    a: i64,
    b: i64,
}

async fn start_server(endpoint: Endpoint) -> (Server, mpsc::UnboundedReceiver<Option<Payload>>, Endpoint) {
    let mut server = Server::new();
    let (greet_tx, greet_rx) = mpsc::unbounded_channel();

    server
        .on_message("greet", move |payload| {
            let _ = greet_tx.send(payload);
        })
        .await;

    server
        .on_request("sum", |payload| async move {
            let args = match payload.as_ref().map(Payload::parse::<SumArgs>) {
                Some(Ok(args)) => args,
                _ => return Err(RequestError::new(7u32, "bad input")),
            };
            Ok(Some(Payload::from(json!(args.a + args.b))))
        })
        .await;

    let local_addr = server.listen(&ServerOptions::new(endpoint)).await.unwrap();
    let endpoint: Endpoint = local_addr.parse().unwrap();
    (server, greet_rx, endpoint)
}

async fn connect(endpoint: Endpoint) -> Client {
    let options = ClientOptions::new(endpoint).with_reconnect(ReconnectPolicy::Off);
    let client = Client::new(options).unwrap();
    client.connect().await.unwrap();
    client
}

async fn exercise(server: &Server, mut greet_rx: mpsc::UnboundedReceiver<Option<Payload>>, client: &Client) {
    // One-way message reaches the handler exactly once
    client.send("greet", json!({ "text": "hi" })).await.unwrap();
    let greeting = timeout(WAIT, greet_rx.recv()).await.unwrap().unwrap();
    assert_eq!(greeting, Some(Payload::from(json!({ "text": "hi" }))));

    // Request / response
    let sum = timeout(WAIT, client.request("sum", json!({ "a": 2, "b": 3 })))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sum, Some(Payload::from(json!(5))));

    // Typed failure
    match timeout(WAIT, client.request("sum", "not numbers")).await.unwrap() {
        Err(ClientError::Request(e)) => {
            assert_eq!(e.code, ErrorCode::Numeric(7));
            assert_eq!(e.message, "bad input");
        }
        other => panic!("Unexpected result: {:?}", other),
    }

    // Pushes
    let (tick_tx, mut tick_rx) = mpsc::unbounded_channel();
    let subscription = client
        .subscribe("tick", move |payload| {
            let _ = tick_tx.send(payload);
        })
        .await
        .unwrap();
    // A request round-trip orders the SUBSCRIBE ahead of the push
    client.request("sum", json!({ "a": 0, "b": 0 })).await.unwrap();
    assert_eq!(server.subscribers("tick").await.len(), 1);

    assert_eq!(server.push("tick", json!({ "n": 1 })).await, 1);
    let tick = timeout(WAIT, tick_rx.recv()).await.unwrap().unwrap();
    assert_eq!(tick, Some(Payload::from(json!({ "n": 1 }))));

    subscription.unsubscribe().await.unwrap();
    client.request("sum", json!({ "a": 0, "b": 0 })).await.unwrap();
    assert!(server.subscribers("tick").await.is_empty());
    assert_eq!(server.push_subscribed("tick", json!({ "n": 2 })).await, 0);

    // Broadcast still reaches the connection, but no handler is left
    assert_eq!(server.push("tick", json!({ "n": 3 })).await, 1);
    client.request("sum", json!({ "a": 0, "b": 0 })).await.unwrap();
    assert!(tick_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_tcp_round_trip() {
    let (mut server, greet_rx, endpoint) = start_server(Endpoint::tcp("127.0.0.1", 0)).await;
    let client = connect(endpoint).await;

    exercise(&server, greet_rx, &client).await;

    client.close().await;
    server.stop().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("beamnet.sock");
    let (mut server, greet_rx, endpoint) = start_server(Endpoint::unix(&path)).await;
    assert_eq!(endpoint, Endpoint::unix(&path));
    let client = connect(endpoint).await;

    exercise(&server, greet_rx, &client).await;

    client.close().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_missing_handler_and_absent_result() {
    let (mut server, _greet_rx, endpoint) = start_server(Endpoint::tcp("127.0.0.1", 0)).await;
    server.on_request("nothing", |_| async { Ok(None) }).await;
    let client = connect(endpoint).await;

    assert_eq!(client.request_empty("nothing").await.unwrap(), None);

    match client.request("unknown", "x").await {
        Err(ClientError::Request(e)) => assert_eq!(e.code, ErrorCode::from("ENOHANDLER")),
        other => panic!("Unexpected result: {:?}", other),
    }

    client.close().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_server_restart_triggers_reconnect() {
    let (mut server, _greet_rx, endpoint) = start_server(Endpoint::tcp("127.0.0.1", 0)).await;
    let options = ClientOptions::new(endpoint.clone())
        .with_reconnect(ReconnectPolicy::Fixed(Duration::from_millis(20)));
    let client = Client::new(options).unwrap();
    client.connect().await.unwrap();
    assert!(client.request("sum", json!({ "a": 1, "b": 1 })).await.is_ok());

    server.stop().await.unwrap();
    drop(server);
    client.wait_for_state(ClientState::RetryScheduled).await;

    let (mut server, _greet_rx, _) = start_server(endpoint).await;
    let sum = timeout(WAIT, client.request("sum", json!({ "a": 20, "b": 22 })))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sum, Some(Payload::from(json!(42))));

    client.close().await;
    server.stop().await.unwrap();
}
