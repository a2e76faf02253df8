//! End-to-end tests over loopback sockets: echo, fragmentation, liveness,
//! limits, capacity, and the handshake wire format.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;

use websock::protocol::handshake::{HandshakeRequest, HandshakeResponse};
use websock::{
    CloseCode, Error, Frame, Handler, Message, OpCode, WebSocket, WsConnection, WsParameters,
    WsStatus,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum Event {
    Open,
    Message(Message),
    Error(String),
    Close(WsStatus),
}

struct Recorder {
    tx: UnboundedSender<Event>,
}

impl Recorder {
    fn channel() -> (Arc<Self>, UnboundedReceiver<Event>) {
        let (tx, rx) = unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl Handler for Recorder {
    async fn on_open(&self, _conn: &WsConnection) {
        let _ = self.tx.send(Event::Open);
    }

    async fn on_message(&self, _conn: &WsConnection, message: Message) {
        let _ = self.tx.send(Event::Message(message));
    }

    async fn on_error(&self, _conn: Option<&WsConnection>, error: &Error) {
        let _ = self.tx.send(Event::Error(error.to_string()));
    }

    async fn on_close(&self, _conn: &WsConnection, status: WsStatus) {
        let _ = self.tx.send(Event::Close(status));
    }
}

/// Echoes every data message back, recording nothing.
struct EchoServer;

#[async_trait]
impl Handler for EchoServer {
    async fn on_message(&self, conn: &WsConnection, message: Message) {
        // A peer may close mid-echo; that is not this handler's problem.
        let _ = match message {
            Message::Text(text) => conn.send_text(text).await,
            Message::Binary(data) => conn.send_binary(data).await,
            _ => Ok(()),
        };
    }
}

async fn next_close(rx: &mut UnboundedReceiver<Event>) -> WsStatus {
    loop {
        match timeout(WAIT, rx.recv()).await.expect("event").expect("channel open") {
            Event::Close(status) => return status,
            _ => continue,
        }
    }
}

async fn next_message(rx: &mut UnboundedReceiver<Event>) -> Message {
    loop {
        match timeout(WAIT, rx.recv()).await.expect("event").expect("channel open") {
            Event::Message(message) => return message,
            Event::Close(status) => panic!("closed before message: {status}"),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn echo_round_trip_and_normal_close() {
    let endpoint = WebSocket::new();
    let server = endpoint
        .server(0, Arc::new(EchoServer), WsParameters::new())
        .await
        .unwrap();

    let (client_handler, mut client_rx) = Recorder::channel();
    let conn = endpoint
        .connect(
            &format!("ws://127.0.0.1:{}/", server.port()),
            client_handler,
            WsParameters::new(),
        )
        .await
        .unwrap();

    assert!(matches!(
        timeout(WAIT, client_rx.recv()).await.unwrap().unwrap(),
        Event::Open
    ));

    conn.send_text("hello").await.unwrap();
    assert_eq!(next_message(&mut client_rx).await, Message::text("hello"));

    conn.close(CloseCode::Normal, "").await.unwrap();
    let status = next_close(&mut client_rx).await;
    assert_eq!(status.code, CloseCode::Normal);
    assert_eq!(status.reason, "");
    assert!(status.clean);
    assert!(!status.remote);
    assert_eq!(conn.status().unwrap().code, CloseCode::Normal);
    assert!(!conn.is_open());

    server.close("").await;
}

#[tokio::test]
async fn close_is_idempotent() {
    let endpoint = WebSocket::new();
    let server = endpoint
        .server(0, Arc::new(EchoServer), WsParameters::new())
        .await
        .unwrap();

    let (handler, mut rx) = Recorder::channel();
    let conn = endpoint
        .connect(
            &format!("ws://127.0.0.1:{}/", server.port()),
            handler,
            WsParameters::new(),
        )
        .await
        .unwrap();

    conn.close(CloseCode::Normal, "first").await.unwrap();
    conn.close(CloseCode::GoingAway, "second").await.unwrap();

    let status = next_close(&mut rx).await;
    assert_eq!(status.code, CloseCode::Normal);
    assert_eq!(status.reason, "first");

    // Exactly one on_close: the channel yields nothing further.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(rx.try_recv(), Err(_)));
    server.close("").await;
}

#[tokio::test]
async fn send_fails_when_not_open() {
    let endpoint = WebSocket::new();
    let server = endpoint
        .server(0, Arc::new(EchoServer), WsParameters::new())
        .await
        .unwrap();

    let (handler, mut rx) = Recorder::channel();
    let conn = endpoint
        .connect(
            &format!("ws://127.0.0.1:{}/", server.port()),
            handler,
            WsParameters::new(),
        )
        .await
        .unwrap();

    conn.close(CloseCode::Normal, "").await.unwrap();
    assert!(matches!(
        conn.send_text("late").await,
        Err(Error::NotOpen)
    ));
    next_close(&mut rx).await;
    server.close("").await;
}

/// Scenario: a 512-byte message with a 128-byte payload buffer becomes
/// exactly four frames (BINARY, CONTINUATION x3; FIN only on the last),
/// and the peer reassembles the identical payload.
#[tokio::test]
async fn fragmented_binary_wire_format() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let raw_server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        // Minimal upgrade using the library's own handshake types.
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            socket.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        let request = HandshakeRequest::parse(&head).unwrap();
        let mut response = Vec::new();
        HandshakeResponse::accept(&request, None)
            .write(&mut response)
            .unwrap();
        socket.write_all(&response).await.unwrap();

        // Collect the four data frames.
        let mut wire = Vec::new();
        let mut frames = Vec::new();
        let mut chunk = [0u8; 4096];
        while frames.len() < 4 {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "peer closed early");
            wire.extend_from_slice(&chunk[..n]);
            loop {
                match Frame::parse(&wire) {
                    Ok((frame, consumed, masked)) => {
                        assert!(masked, "client frames must be masked");
                        wire.drain(..consumed);
                        frames.push(frame);
                    }
                    Err(Error::IncompleteFrame { .. }) => break,
                    Err(e) => panic!("bad frame: {e}"),
                }
            }
        }
        frames
    });

    let endpoint = WebSocket::new();
    let mut params = WsParameters::new();
    params.set_payload_buffer_length(128);
    let (handler, _rx) = Recorder::channel();
    let conn = endpoint
        .connect(&format!("ws://127.0.0.1:{port}/"), handler, params)
        .await
        .unwrap();

    let payload: Vec<u8> = (0..512u32).map(|i| (i % 251) as u8).collect();
    conn.send_binary(payload.clone()).await.unwrap();

    let frames = raw_server.await.unwrap();
    assert_eq!(frames.len(), 4);
    assert_eq!(
        frames.iter().map(|f| f.opcode).collect::<Vec<_>>(),
        [
            OpCode::Binary,
            OpCode::Continuation,
            OpCode::Continuation,
            OpCode::Continuation
        ]
    );
    assert_eq!(
        frames.iter().map(|f| f.fin).collect::<Vec<_>>(),
        [false, false, false, true]
    );
    let reassembled: Vec<u8> = frames.into_iter().flat_map(|f| f.payload).collect();
    assert_eq!(reassembled, payload);
}

#[tokio::test]
async fn send_stream_fragments_and_reassembles() {
    let endpoint = WebSocket::new();
    let (server_handler, mut server_rx) = Recorder::channel();
    let mut params = WsParameters::new();
    params.set_payload_buffer_length(256);
    let server = endpoint.server(0, server_handler, params.clone()).await.unwrap();

    let (client_handler, _client_rx) = Recorder::channel();
    let conn = endpoint
        .connect(
            &format!("ws://127.0.0.1:{}/", server.port()),
            client_handler,
            params,
        )
        .await
        .unwrap();

    let payload: Vec<u8> = (0..2000u32).map(|i| (i % 256) as u8).collect();
    conn.send_stream(false, payload.as_slice()).await.unwrap();

    // First event is the server-side open.
    loop {
        match timeout(WAIT, server_rx.recv()).await.unwrap().unwrap() {
            Event::Message(Message::Binary(received)) => {
                assert_eq!(received, payload);
                break;
            }
            Event::Open => continue,
            other => panic!("unexpected event: {other:?}"),
        }
    }
    server.close("").await;
}

/// Scenario: a silent peer draws one PING, then a liveness teardown with a
/// local status of 1006.
#[tokio::test]
async fn ping_liveness_times_out_silent_peer() {
    let endpoint = WebSocket::new();
    let (server_handler, mut server_rx) = Recorder::channel();
    let mut params = WsParameters::new();
    params.set_connection_timeout(Duration::from_millis(300), true);
    let server = endpoint.server(0, server_handler, params).await.unwrap();

    // Raw client: handshake by hand, then total silence.
    let mut socket = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();
    let request = HandshakeRequest::build("/", "localhost", "AQIDBAUGBwgJCgsMDQ4PEA==", &[]).unwrap();
    socket.write_all(&request).await.unwrap();
    let mut response = vec![0u8; 1024];
    let n = socket.read(&mut response).await.unwrap();
    assert!(response[..n].starts_with(b"HTTP/1.1 101"));

    // The server must emit at least one PING before giving up.
    let mut first_frame = [0u8; 2];
    socket.read_exact(&mut first_frame).await.unwrap();
    assert_eq!(first_frame[0] & 0x0F, 0x9, "expected a PING frame");

    let status = next_close(&mut server_rx).await;
    assert_eq!(status.code, CloseCode::Abnormal);
    assert!(!status.clean);
    server.close("").await;
}

/// Scenario: an 11-byte message against a 10-byte limit closes with 1009 on
/// both sides.
#[tokio::test]
async fn oversize_message_closes_1009() {
    let endpoint = WebSocket::new();
    let (server_handler, mut server_rx) = Recorder::channel();
    let mut server_params = WsParameters::new();
    server_params.set_max_message_length(10);
    let server = endpoint.server(0, server_handler, server_params).await.unwrap();

    let (client_handler, mut client_rx) = Recorder::channel();
    let conn = endpoint
        .connect(
            &format!("ws://127.0.0.1:{}/", server.port()),
            client_handler,
            WsParameters::new(),
        )
        .await
        .unwrap();

    conn.send_text("0123456789A").await.unwrap();

    let server_status = next_close(&mut server_rx).await;
    assert_eq!(server_status.code, CloseCode::MessageTooBig);

    let client_status = next_close(&mut client_rx).await;
    assert_eq!(client_status.code, CloseCode::MessageTooBig);
    assert!(client_status.remote);
    server.close("").await;
}

/// Scenario: TEXT with bytes [0xC3, 0x28] closes with 1007.
#[tokio::test]
async fn invalid_utf8_closes_1007() {
    let endpoint = WebSocket::new();
    let (server_handler, mut server_rx) = Recorder::channel();
    let server = endpoint
        .server(0, server_handler, WsParameters::new())
        .await
        .unwrap();

    let mut socket = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();
    let request = HandshakeRequest::build("/", "localhost", "AQIDBAUGBwgJCgsMDQ4PEA==", &[]).unwrap();
    socket.write_all(&request).await.unwrap();
    let mut response = vec![0u8; 1024];
    let n = socket.read(&mut response).await.unwrap();
    assert!(response[..n].starts_with(b"HTTP/1.1 101"));

    // Masked TEXT frame carrying an invalid sequence.
    let mut wire = Vec::new();
    Frame::new(true, OpCode::Text, vec![0xC3, 0x28]).write(&mut wire, Some([1, 2, 3, 4]));
    socket.write_all(&wire).await.unwrap();

    let status = next_close(&mut server_rx).await;
    assert_eq!(status.code, CloseCode::InvalidPayload);

    // The wire carries a CLOSE with 1007 before teardown.
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    let frame = loop {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "no close frame before EOF");
        buf.extend_from_slice(&chunk[..n]);
        match Frame::parse(&buf) {
            Ok((frame, _, _)) => break frame,
            Err(Error::IncompleteFrame { .. }) => continue,
            Err(e) => panic!("bad frame: {e}"),
        }
    };
    assert_eq!(frame.opcode, OpCode::Close);
    assert_eq!(u16::from_be_bytes([frame.payload[0], frame.payload[1]]), 1007);
    server.close("").await;
}

/// Scenario: the third handshake against `max_connections = 2` is answered
/// with CLOSE 1013 while the first two stay open.
#[tokio::test]
async fn capacity_overflow_refused_with_1013() {
    let endpoint = WebSocket::new();
    let mut server_params = WsParameters::new();
    server_params.set_max_connections(2);
    let server = endpoint
        .server(0, Arc::new(EchoServer), server_params)
        .await
        .unwrap();
    let uri = format!("ws://127.0.0.1:{}/", server.port());

    let (h1, _rx1) = Recorder::channel();
    let first = endpoint.connect(&uri, h1, WsParameters::new()).await.unwrap();
    let (h2, _rx2) = Recorder::channel();
    let second = endpoint.connect(&uri, h2, WsParameters::new()).await.unwrap();

    // Let the server register both before the third arrives.
    timeout(WAIT, async {
        while server.list_connections().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let (h3, mut rx3) = Recorder::channel();
    let third = endpoint.connect(&uri, h3, WsParameters::new()).await.unwrap();

    let status = next_close(&mut rx3).await;
    assert_eq!(status.code, CloseCode::TryAgainLater);
    assert!(!third.is_open());

    assert!(first.is_open());
    assert!(second.is_open());
    assert_eq!(server.list_connections().len(), 2);

    // The survivors still work.
    first.send_text("still here").await.unwrap();
    server.close("").await;
}

/// Scenario: the RFC 6455 Section 1.3 sample key produces the sample
/// accept value on the wire.
#[tokio::test]
async fn handshake_accept_key_on_the_wire() {
    let endpoint = WebSocket::new();
    let server = endpoint
        .server(0, Arc::new(EchoServer), WsParameters::new())
        .await
        .unwrap();

    let mut socket = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();
    let request =
        HandshakeRequest::build("/chat", "localhost", "dGhlIHNhbXBsZSBub25jZQ==", &[]).unwrap();
    socket.write_all(&request).await.unwrap();

    let mut response = vec![0u8; 1024];
    let n = socket.read(&mut response).await.unwrap();
    let text = std::str::from_utf8(&response[..n]).unwrap();
    assert!(text.starts_with("HTTP/1.1 101 Switching Protocols"));
    assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    server.close("").await;
}

#[tokio::test]
async fn subprotocol_negotiated_end_to_end() {
    let endpoint = WebSocket::new();
    let mut server_params = WsParameters::new();
    server_params.set_subprotocols(["superchat"]);
    let server = endpoint
        .server(0, Arc::new(EchoServer), server_params)
        .await
        .unwrap();

    let (handler, _rx) = Recorder::channel();
    let mut client_params = WsParameters::new();
    client_params.set_subprotocols(["chat", "superchat"]);
    let conn = endpoint
        .connect(
            &format!("ws://127.0.0.1:{}/", server.port()),
            handler,
            client_params,
        )
        .await
        .unwrap();

    assert_eq!(conn.subprotocol(), Some("superchat"));
    server.close("").await;
}

#[tokio::test]
async fn extensions_offer_is_rejected_with_400() {
    let endpoint = WebSocket::new();
    let (server_handler, _server_rx) = Recorder::channel();
    let server = endpoint
        .server(0, server_handler, WsParameters::new())
        .await
        .unwrap();

    let mut socket = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();
    socket
        .write_all(
            b"GET / HTTP/1.1\r\n\
              Host: localhost\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\
              Sec-WebSocket-Extensions: permessage-deflate\r\n\r\n",
        )
        .await
        .unwrap();

    let mut response = vec![0u8; 256];
    let n = socket.read(&mut response).await.unwrap();
    assert!(response[..n].starts_with(b"HTTP/1.1 400"));
    server.close("").await;
}

#[tokio::test]
async fn close_all_drains_servers_and_connections() {
    let endpoint = WebSocket::new();
    let server = endpoint
        .server(0, Arc::new(EchoServer), WsParameters::new())
        .await
        .unwrap();

    let (handler, mut rx) = Recorder::channel();
    let conn = endpoint
        .connect(
            &format!("ws://127.0.0.1:{}/", server.port()),
            handler,
            WsParameters::new(),
        )
        .await
        .unwrap();
    assert_eq!(endpoint.list_servers().len(), 1);
    assert_eq!(endpoint.list_connections().len(), 1);

    endpoint.close_all("maintenance").await;

    let status = next_close(&mut rx).await;
    assert_eq!(status.code, CloseCode::GoingAway);
    assert_eq!(status.reason, "maintenance");
    assert!(!conn.is_open());
    assert!(!server.is_running());
    assert!(endpoint.list_servers().is_empty());

    timeout(WAIT, async {
        while !endpoint.list_connections().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connections must deregister after close");
}

#[tokio::test]
async fn server_listens_on_ephemeral_port() {
    let endpoint = WebSocket::new();
    let server = endpoint
        .server(0, Arc::new(EchoServer), WsParameters::new())
        .await
        .unwrap();
    assert_ne!(server.port(), 0);
    assert!(!server.is_secure());
    assert!(server.is_running());
    server.close("").await;
    assert!(!server.is_running());
}
