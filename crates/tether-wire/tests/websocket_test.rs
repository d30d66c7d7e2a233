//! End-to-end over real WebSockets on the loopback interface.

use serde_json::{json, Value};
use std::time::Duration;
use tether_wire::{
    Client, ClientConfig, CloseCode, CodecKind, Invoke, Server, ServerConfig, ServerEvent,
    WireError,
};
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(10);

async fn start_server(codec: CodecKind) -> (Server, String) {
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        protocols: vec!["tether".to_string()],
        codec,
        ..Default::default()
    };
    let server = Server::websocket(config).unwrap();
    server.handle("add", |args: Vec<Value>| async move {
        let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
        Ok::<_, std::io::Error>(json!(sum))
    });
    server.handle("fail", |_args: Vec<Value>| async move { Err::<Value, _>("boom") });
    let addr = server.open().await.unwrap().expect("tcp listener has an address");
    (server, format!("ws://{addr}/rpc"))
}

fn client(url: String, codec: CodecKind) -> Client {
    Client::websocket(ClientConfig {
        url,
        protocols: vec!["tether".to_string()],
        codec,
        ..Default::default()
    })
    .unwrap()
}

async fn next_connection(rx: &mut broadcast::Receiver<ServerEvent>) -> tether_wire::Peer {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(ServerEvent::Connection { peer }) = rx.recv().await {
                return peer;
            }
        }
    })
    .await
    .expect("no connection")
}

#[tokio::test]
async fn test_calls_both_ways_msgpack() {
    let (server, url) = start_server(CodecKind::Msgpack).await;
    let mut events = server.subscribe();
    let client = client(url, CodecKind::Msgpack);
    client.handle("name", |_args: Vec<Value>| async move {
        Ok::<_, std::io::Error>(json!("loopback"))
    });
    client.open().await.unwrap();

    assert_eq!(
        client.invoke("add", vec![json!(2), json!(40)]).await.unwrap(),
        json!(42)
    );
    assert!(matches!(
        client.invoke("fail", vec![]).await,
        Err(WireError::Remote(ref e)) if e.message == "boom"
    ));

    let peer = next_connection(&mut events).await;
    assert_eq!(peer.info().path.as_deref(), Some("/rpc"));
    assert_eq!(peer.info().protocol.as_deref(), Some("tether"));
    assert!(peer.info().remote_addr.is_some());
    assert_eq!(peer.invoke("name", vec![]).await.unwrap(), json!("loopback"));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_json_codec_and_client_close_code() {
    let (server, url) = start_server(CodecKind::Json).await;
    let mut events = server.subscribe();
    let client = client(url, CodecKind::Json);
    client.open().await.unwrap();

    assert_eq!(client.invoke("add", vec![json!(1), json!(1)]).await.unwrap(), json!(2));
    next_connection(&mut events).await;

    client.close().await;
    let code = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(ServerEvent::ClientClose { code, .. }) = events.recv().await {
                return code;
            }
        }
    })
    .await
    .expect("no client close");
    assert_eq!(code, CloseCode::NORMAL);
    assert_eq!(server.peer_count(), 0);
    server.close().await;
}

#[tokio::test]
async fn test_broadcast_over_websockets() {
    let (server, url) = start_server(CodecKind::Msgpack).await;
    let mut events = server.subscribe();
    let mut clients = Vec::new();
    for i in 0..3 {
        let client = client(url.clone(), CodecKind::Msgpack);
        client.handle("ping", move |_args: Vec<Value>| async move {
            Ok::<_, std::io::Error>(json!(i))
        });
        client.open().await.unwrap();
        next_connection(&mut events).await;
        clients.push(client);
    }

    let results = server
        .broadcast(tether_wire::Message::request("ping", vec![]))
        .await;
    assert_eq!(results.len(), 3);
    let mut values: Vec<i64> = results
        .into_values()
        .map(|r| r.unwrap().arguments()[0].as_i64().unwrap())
        .collect();
    values.sort();
    assert_eq!(values, vec![0, 1, 2]);
    server.close().await;
}
