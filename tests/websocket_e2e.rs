//! End-to-end tests: client and server talking over in-memory pipes and
//! loopback TCP.

mod common;

use common::{connected_pair, init_test_logging, text_of};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wsengine::{
    connect_with, ClientConfig, ClientInfo, CloseEvent, Event, HandshakeError, HttpRequest, MaxWindowBits, Message,
    PerMessageDeflateConfig, ReadyState, Rejection, ServerConfig, Verdict, WebSocket, WebSocketServer,
};

const URL: &str = "ws://localhost/chat";

fn plain_client() -> ClientConfig {
    ClientConfig::default().per_message_deflate(None)
}

async fn next_message<IO>(ws: &mut WebSocket<IO>) -> Message
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    loop {
        match ws.recv().await {
            Some(Event::Message(message)) => return message,
            Some(Event::Ping(_) | Event::Pong(_)) => {}
            other => panic!("expected a message, got {other:?}"),
        }
    }
}

async fn close_event<IO>(ws: &mut WebSocket<IO>) -> CloseEvent
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    while let Some(event) = ws.recv().await {
        if let Event::Close(close) = event {
            return close;
        }
    }
    panic!("connection ended without a close event");
}

// ============================================================================
// In-memory pipes
// ============================================================================

#[tokio::test]
async fn handshake_then_exchange_messages() {
    init_test_logging();
    let server = WebSocketServer::new(ServerConfig::default());
    let (mut client, mut served, request) = connected_pair(&server, URL, plain_client()).await;

    assert_eq!(request.path(), "/chat");
    assert_eq!(client.ready_state(), ReadyState::Open);
    assert_eq!(client.url(), Some(URL));
    assert_eq!(client.extensions(), None);
    assert_eq!(server.clients(), 1);

    client.send_text("hello").await.unwrap();
    match next_message(&mut served).await {
        Message::Text(text) => assert_eq!(text_of(&text), "hello"),
        other => panic!("expected text, got {other:?}"),
    }

    served.send_binary(vec![1u8, 2, 3]).await.unwrap();
    assert_eq!(next_message(&mut client).await, Message::binary(vec![1u8, 2, 3]));
}

#[tokio::test]
async fn ping_is_answered_automatically() {
    init_test_logging();
    let server = WebSocketServer::new(ServerConfig::default());
    let (mut client, mut served, _) = connected_pair(&server, URL, plain_client()).await;

    client.ping("are you there").unwrap().await.unwrap();
    match served.recv().await {
        Some(Event::Ping(payload)) => assert_eq!(&payload[..], b"are you there"),
        other => panic!("expected ping, got {other:?}"),
    }
    match client.recv().await {
        Some(Event::Pong(payload)) => assert_eq!(&payload[..], b"are you there"),
        other => panic!("expected pong, got {other:?}"),
    }
}

#[tokio::test]
async fn compression_negotiates_window_bits() {
    init_test_logging();
    let server = WebSocketServer::new(
        ServerConfig::default().per_message_deflate(Some(
            PerMessageDeflateConfig::new().server_max_window_bits(MaxWindowBits::Bits(10)),
        )),
    );
    let client_config = ClientConfig::default().per_message_deflate(Some(
        PerMessageDeflateConfig::new().client_max_window_bits(MaxWindowBits::Bits(12)),
    ));
    let (mut client, mut served, _) = connected_pair(&server, URL, client_config).await;

    let expected = "permessage-deflate; server_max_window_bits=10; client_max_window_bits=12";
    assert_eq!(served.extensions(), Some(expected));
    assert_eq!(client.extensions(), Some(expected));

    let big = "the quick brown fox jumps over the lazy dog ".repeat(2_000);
    for _ in 0..3 {
        client.send_text(big.clone()).await.unwrap();
        match next_message(&mut served).await {
            Message::Text(text) => assert_eq!(text_of(&text), big),
            other => panic!("expected text, got {other:?}"),
        }
    }

    served.send_binary(big.clone().into_bytes()).await.unwrap();
    assert_eq!(next_message(&mut client).await.as_bytes(), big.as_bytes());
}

#[tokio::test]
async fn recv_dropped_mid_inflate_loses_nothing() {
    init_test_logging();
    let deflate = PerMessageDeflateConfig::new().threshold(0);
    let server = WebSocketServer::new(ServerConfig::default().per_message_deflate(Some(deflate.clone())));
    let client_config = ClientConfig::default().per_message_deflate(Some(deflate));
    let (client, mut served, _) = connected_pair(&server, URL, client_config).await;

    let bodies: Vec<String> = (0..20).map(|i| format!("message {i} ").repeat(1_000)).collect();
    for body in &bodies {
        client.send_text(body.clone()).await.unwrap();
    }

    let mut received = Vec::new();
    let mut cancelled = 0usize;
    tokio::time::timeout(Duration::from_secs(10), async {
        while received.len() < bodies.len() {
            match tokio::time::timeout(Duration::ZERO, served.recv()).await {
                Err(_) => {
                    cancelled += 1;
                    tokio::task::yield_now().await;
                }
                Ok(Some(Event::Message(Message::Text(text)))) => received.push(text_of(&text).to_owned()),
                Ok(other) => panic!("expected text, got {other:?}"),
            }
        }
    })
    .await
    .unwrap();

    assert!(cancelled > 0);
    assert_eq!(received, bodies);
    assert_eq!(served.ready_state(), ReadyState::Open);
}

#[tokio::test]
async fn compression_without_context_takeover() {
    init_test_logging();
    let no_takeover = PerMessageDeflateConfig::new()
        .server_no_context_takeover(true)
        .client_no_context_takeover(true)
        .threshold(0);
    let server = WebSocketServer::new(ServerConfig::default().per_message_deflate(Some(no_takeover.clone())));
    let client_config = ClientConfig::default().per_message_deflate(Some(no_takeover));
    let (mut client, mut served, _) = connected_pair(&server, URL, client_config).await;

    assert!(client.extensions().unwrap().contains("client_no_context_takeover"));
    for round in 0..4 {
        let message = format!("round {round}: {}", "abc".repeat(500));
        served.send_text(message.clone()).await.unwrap();
        assert_eq!(next_message(&mut client).await.as_text(), Some(message.as_str()));
    }
}

#[tokio::test]
async fn server_picks_subprotocol() {
    init_test_logging();
    let server = WebSocketServer::new(
        ServerConfig::default().handle_protocols(|offered: &[String], _: &HttpRequest| {
            offered.iter().find(|protocol| protocol.as_str() == "superchat").cloned()
        }),
    );
    let client_config = plain_client().protocol("chat").protocol("superchat");
    let (client, served, request) = connected_pair(&server, URL, client_config).await;

    assert_eq!(request.header("sec-websocket-protocol"), Some("chat, superchat"));
    assert_eq!(client.protocol(), Some("superchat"));
    assert_eq!(served.protocol(), Some("superchat"));
}

#[tokio::test]
async fn close_handshake_reports_code_on_both_sides() {
    init_test_logging();
    let server = WebSocketServer::new(ServerConfig::default());
    let (mut client, mut served, _) = connected_pair(&server, URL, plain_client()).await;

    client.close(Some(4000), "done").unwrap();
    assert_eq!(client.ready_state(), ReadyState::Closing);
    assert!(client.send_text("late").await.is_err());

    let (client_close, served_close) = tokio::join!(close_event(&mut client), close_event(&mut served));
    assert_eq!(client_close.code, 4000);
    assert_eq!(client_close.reason_str(), Some("done"));
    assert_eq!(served_close.code, 4000);
    assert_eq!(served_close.reason_str(), Some("done"));

    assert_eq!(client.ready_state(), ReadyState::Closed);
    assert!(client.recv().await.is_none());
    assert_eq!(server.clients(), 0);
}

#[tokio::test]
async fn close_without_code_reports_1005() {
    init_test_logging();
    let server = WebSocketServer::new(ServerConfig::default());
    let (mut client, mut served, _) = connected_pair(&server, URL, plain_client()).await;

    served.close(None, "").unwrap();
    let (client_close, served_close) = tokio::join!(close_event(&mut client), close_event(&mut served));
    assert_eq!(client_close.code, 1005);
    assert_eq!(served_close.code, 1005);
}

#[tokio::test]
async fn abrupt_disconnect_reports_1006() {
    init_test_logging();
    let server = WebSocketServer::new(ServerConfig::default());
    let (mut client, mut served, _) = connected_pair(&server, URL, plain_client()).await;

    client.terminate();
    assert_eq!(close_event(&mut client).await.code, 1006);
    assert_eq!(close_event(&mut served).await.code, 1006);
}

#[tokio::test(start_paused = true)]
async fn unanswered_close_times_out() {
    init_test_logging();
    let server = WebSocketServer::new(ServerConfig::default());
    let client_config = plain_client().connection(
        wsengine::ConnectionConfig::default().close_timeout(Duration::from_secs(2)),
    );
    let (mut client, served, _) = connected_pair(&server, URL, client_config).await;

    // The server never polls, so the close frame is never answered.
    client.close(Some(1000), "").unwrap();
    let started = tokio::time::Instant::now();
    let close = close_event(&mut client).await;
    assert_eq!(close.code, 1006);
    assert!(started.elapsed() >= Duration::from_secs(2));
    drop(served);
}

#[tokio::test]
async fn server_close_waits_for_tracked_clients() {
    init_test_logging();
    let server = WebSocketServer::new(ServerConfig::default());
    let (mut client, mut served, _) = connected_pair(&server, URL, plain_client()).await;

    server.close();
    assert_eq!(server.state(), wsengine::ServerState::Closing);

    served.close(Some(1001), "going away").unwrap();
    let (client_close, _) = tokio::join!(close_event(&mut client), close_event(&mut served));
    assert_eq!(client_close.code, 1001);

    tokio::time::timeout(Duration::from_secs(5), server.closed()).await.unwrap();
}

// ============================================================================
// Loopback TCP
// ============================================================================

#[tokio::test]
async fn tcp_echo_roundtrip() {
    init_test_logging();
    let mut server = WebSocketServer::bind("127.0.0.1:0", ServerConfig::default().path("/echo"))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();

    let echo = tokio::spawn(async move {
        let (mut ws, request) = server.accept().await.unwrap();
        assert_eq!(request.path(), "/echo");
        while let Some(event) = ws.recv().await {
            if let Event::Message(message) = event {
                let _ = ws.send_message(message).await;
            }
        }
        server
    });

    let mut client = connect_with(&format!("ws://{addr}/echo?x=1"), ClientConfig::default())
        .await
        .unwrap();
    for text in ["one", "two", "three"] {
        client.send_text(text).await.unwrap();
        assert_eq!(next_message(&mut client).await.as_text(), Some(text));
    }
    client.close(Some(1000), "").unwrap();
    assert_eq!(close_event(&mut client).await.code, 1000);

    let server = echo.await.unwrap();
    server.close();
    server.closed().await;
}

#[tokio::test]
async fn tcp_plain_request_gets_426() {
    init_test_logging();
    let server = WebSocketServer::bind("127.0.0.1:0", ServerConfig::default()).await.unwrap();
    let addr = server.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 426 Upgrade Required\r\n"), "{response}");
    assert!(response.ends_with("Upgrade Required"));
}

#[tokio::test]
async fn tcp_verify_client_rejection() {
    init_test_logging();
    let config = ServerConfig::default().verify_client(|info: &ClientInfo<'_>| {
        if info.request.header("authorization").is_some() {
            Verdict::Accept
        } else {
            Verdict::Reject(Rejection::new(401).message("credentials required"))
        }
    });
    let mut server = WebSocketServer::bind("127.0.0.1:0", config).await.unwrap();
    let addr = server.local_addr().unwrap();

    let err = connect_with(&format!("ws://{addr}/"), plain_client()).await.unwrap_err();
    assert!(matches!(err, HandshakeError::UnexpectedResponse(401)), "{err}");

    let accepted = tokio::spawn(async move { server.accept().await.map(|(ws, _)| ws.protocol().map(str::to_owned)) });
    let client = connect_with(&format!("ws://user:secret@{addr}/"), plain_client())
        .await
        .unwrap();
    assert_eq!(client.ready_state(), ReadyState::Open);
    assert!(accepted.await.unwrap().is_ok());
}

#[tokio::test]
async fn tcp_redirect_is_followed() {
    init_test_logging();
    let mut target = WebSocketServer::bind("127.0.0.1:0", ServerConfig::default()).await.unwrap();
    let target_addr = target.local_addr().unwrap();

    let redirector = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let redirector_addr = redirector.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = redirector.accept().await.unwrap();
        let _ = wsengine::handshake::read_http_head(&mut stream).await.unwrap();
        let response = format!("HTTP/1.1 302 Found\r\nLocation: ws://{target_addr}/landed\r\nContent-Length: 0\r\n\r\n");
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
    });

    let accepted = tokio::spawn(async move { target.accept().await.map(|(_, request)| request.path().to_owned()) });
    let client = connect_with(
        &format!("ws://{redirector_addr}/start"),
        plain_client().follow_redirects(true),
    )
    .await
    .unwrap();
    assert_eq!(client.url(), Some(format!("ws://{target_addr}/landed").as_str()));
    assert_eq!(accepted.await.unwrap().unwrap(), "/landed");
}

#[tokio::test]
async fn tcp_accept_ends_after_close() {
    init_test_logging();
    let mut server = WebSocketServer::bind("127.0.0.1:0", ServerConfig::default()).await.unwrap();
    server.close();
    assert!(matches!(server.accept().await, Err(HandshakeError::ServerClosed)));
}
