//! End-to-end tests against a real listener with a tungstenite client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tether_core::{
    Connection, CorrelationId, Handler, HandlerError, Message, Payload, Reply, Request,
    ServerConfig,
};
use tether_transport_websocket::{AxumSocket, WebSocketServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Echo;

impl Handler<AxumSocket> for Echo {
    fn on_request<'a>(
        &'a self,
        conn: &'a Arc<Connection<AxumSocket>>,
        request: Request,
    ) -> BoxFuture<'a, Result<Payload, HandlerError>> {
        Box::pin(async move {
            match request.name.as_str() {
                "echo" => Ok(request.payload),
                "peer" => Ok(Payload::utf8(
                    conn.remote_addr()
                        .map(|addr| addr.ip().to_string())
                        .unwrap_or_default(),
                )),
                other => Err(HandlerError::domain("NOT_FOUND", other)),
            }
        })
    }
}

async fn start(config: ServerConfig) -> (WebSocketServer, SocketAddr) {
    let server = WebSocketServer::new(config, Echo);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(tether_transport_websocket::serve(listener, server.clone()));
    (server, addr)
}

type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

async fn next_message(client: &mut Client) -> Message {
    loop {
        let frame = tokio::time::timeout(TIMEOUT, client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        if let WsMessage::Binary(data) = frame {
            if let Some(message) = Message::decode(&Bytes::from(data)).unwrap() {
                return message;
            }
        }
    }
}

async fn request(client: &mut Client, id: u64, name: &str, payload: Payload) -> Reply {
    let frame = Message::Request {
        id: CorrelationId::from_u64(id),
        name: name.into(),
        payload,
    }
    .encode()
    .unwrap();
    client.send(WsMessage::Binary(frame.to_vec())).await.unwrap();
    loop {
        if let Message::Reply { id: got, reply } = next_message(client).await {
            if got == CorrelationId::from_u64(id) {
                return reply;
            }
        }
    }
}

#[tokio::test]
async fn configuration_then_echo() {
    let (_server, addr) = start(ServerConfig::default()).await;
    let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
        .await
        .unwrap();

    match next_message(&mut client).await {
        Message::Configuration(config) => assert_eq!(config.protocol_version, "1.0"),
        other => panic!("expected configuration, got {other:?}"),
    }
    assert_eq!(
        request(&mut client, 1, "echo", Payload::utf8("over the wire")).await,
        Reply::Success(Payload::utf8("over the wire"))
    );
    assert_eq!(
        request(&mut client, 2, "peer", Payload::empty()).await,
        Reply::Success(Payload::utf8("127.0.0.1"))
    );
}

#[tokio::test]
async fn client_close_ends_the_connection() {
    let (server, addr) = start(ServerConfig::default()).await;
    let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
        .await
        .unwrap();
    next_message(&mut client).await;
    assert_eq!(server.connection_count(), 1);

    client.close(None).await.unwrap();
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while server.connection_count() != 0 {
        assert!(tokio::time::Instant::now() < deadline, "connection never closed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn metadata_method_returns_json() {
    let (_server, addr) = start(ServerConfig::default().with_read_timeout(Duration::from_secs(30)))
        .await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"TETHER / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    tokio::time::timeout(TIMEOUT, stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    let body = &response[response.find("\r\n\r\n").unwrap() + 4..];
    let metadata: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(metadata["protocolVersion"], "1.0");
    assert_eq!(metadata["readTimeoutSeconds"], 30);
}

#[tokio::test]
async fn other_methods_are_not_allowed() {
    let (_server, addr) = start(ServerConfig::default()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    tokio::time::timeout(TIMEOUT, stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 405"), "{response}");
}

#[tokio::test]
async fn upgrades_refused_during_shutdown() {
    let (server, addr) = start(ServerConfig::default()).await;
    server.begin_shutdown();

    match tokio_tungstenite::connect_async(format!("ws://{addr}/")).await {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 503);
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("upgrade accepted during shutdown"),
    }
}

#[tokio::test]
async fn shutdown_closes_open_sockets() {
    let (server, addr) = start(ServerConfig::default()).await;
    let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
        .await
        .unwrap();
    next_message(&mut client).await;

    tokio::time::timeout(TIMEOUT, server.shutdown()).await.unwrap();

    // The server's close frame (or the end of the stream) follows.
    loop {
        match tokio::time::timeout(TIMEOUT, client.next()).await.unwrap() {
            Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
            Some(Ok(_)) => continue,
        }
    }
}
