//! End-to-end tests driving the data-stream server over real sockets

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::connection::{DataStreamHandle, ProtocolHandler};
use super::frame::FrameCrypto;
use super::parser::{DataStreamDict, DataStreamValue, decode_payload, encode_payload};
use super::server::DataStreamServer;
use super::session::SessionKeys;
use super::{names, status};

/// Controller half of a data-stream connection
struct TestClient {
    stream: TcpStream,
    crypto: FrameCrypto,
    buffer: BytesMut,
}

impl TestClient {
    async fn connect(port: u16, keys: &SessionKeys) -> Self {
        // The client encrypts in the controller→accessory direction, so
        // its key pair is the accessory's, mirrored.
        let mirrored = SessionKeys {
            accessory_to_controller: keys.controller_to_accessory,
            controller_to_accessory: keys.accessory_to_controller,
        };
        Self {
            stream: TcpStream::connect(("127.0.0.1", port)).await.unwrap(),
            crypto: FrameCrypto::new(&mirrored).unwrap(),
            buffer: BytesMut::new(),
        }
    }

    async fn send(&mut self, header: &DataStreamDict, message: &DataStreamDict) {
        let payload = encode_payload(header, message).unwrap();
        let frame = self.crypto.encode_frame(&payload).unwrap();
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn send_request(&mut self, protocol: &str, topic: &str, id: i64) {
        let mut header = DataStreamDict::new();
        header.insert("protocol".to_string(), protocol.into());
        header.insert("request".to_string(), topic.into());
        header.insert("id".to_string(), id.into());
        self.send(&header, &DataStreamDict::new()).await;
    }

    async fn recv(&mut self) -> (DataStreamDict, DataStreamDict) {
        loop {
            if let Some(payload) = self.crypto.decode_frame(&mut self.buffer).unwrap() {
                return decode_payload(&payload).unwrap();
            }
            let n = self.stream.read_buf(&mut self.buffer).await.unwrap();
            assert!(n > 0, "connection closed while awaiting frame");
        }
    }

    async fn hello(&mut self) {
        self.send_request(names::CONTROL, names::HELLO, 1).await;
        let (header, _) = self.recv().await;
        assert_eq!(
            header.get("response").and_then(DataStreamValue::as_str),
            Some(names::HELLO)
        );
        assert_eq!(
            header.get("status").and_then(DataStreamValue::as_int),
            Some(status::SUCCESS)
        );
    }
}

async fn prepare(
    server: &Arc<DataStreamServer>,
    shared_secret: &[u8; 32],
) -> (u16, SessionKeys) {
    let controller_salt = [0x5Au8; 32];
    let info = server
        .prepare_session(shared_secret, &controller_salt)
        .await
        .unwrap();
    let keys = SessionKeys::derive(shared_secret, &controller_salt, &info.accessory_salt).unwrap();
    (info.port, keys)
}

#[tokio::test]
async fn first_frame_identifies_the_matching_session() {
    let server = DataStreamServer::new();

    // Three pending sessions with distinct secrets.
    let (_, _keys_a) = prepare(&server, &[0x01u8; 32]).await;
    let (port, keys_b) = prepare(&server, &[0x02u8; 32]).await;
    let (_, _keys_c) = prepare(&server, &[0x03u8; 32]).await;
    assert_eq!(server.pending_sessions(), 3);

    let mut client = TestClient::connect(port, &keys_b).await;
    client.hello().await;

    // Exactly the matching session was claimed.
    assert_eq!(server.pending_sessions(), 2);
}

#[tokio::test]
async fn unidentifiable_connection_is_dropped() {
    let server = DataStreamServer::new();
    let (port, _keys) = prepare(&server, &[0x04u8; 32]).await;

    // Wrong keys: the first frame decrypts under no pending session.
    let wrong = SessionKeys {
        accessory_to_controller: [0xEE; 32],
        controller_to_accessory: [0xEF; 32],
    };
    let mut client = TestClient::connect(port, &wrong).await;
    client.send_request(names::CONTROL, names::HELLO, 1).await;

    // The server must close the socket without answering.
    let mut buf = [0u8; 64];
    let n = client.stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "unidentifiable connection must be closed");
    assert_eq!(server.pending_sessions(), 1);
}

#[tokio::test]
async fn first_message_must_be_hello() {
    let server = DataStreamServer::new();
    let (port, keys) = prepare(&server, &[0x05u8; 32]).await;

    let mut client = TestClient::connect(port, &keys).await;
    client.send_request("target", "whatever", 9).await;

    let mut buf = [0u8; 64];
    let n = client.stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "non-hello first message must close the connection");
}

/// Echoes the request message back with an `answered` marker
struct EchoHandler;

#[async_trait]
impl ProtocolHandler for EchoHandler {
    async fn handle_request(
        &self,
        _connection: &DataStreamHandle,
        mut message: DataStreamDict,
    ) -> Result<DataStreamDict, i64> {
        message.insert("answered".to_string(), true.into());
        Ok(message)
    }

    async fn handle_event(&self, _connection: &DataStreamHandle, _message: DataStreamDict) {}
}

#[tokio::test]
async fn requests_dispatch_to_global_handlers() {
    let server = DataStreamServer::new();
    server.register_handler("target", "probe", Arc::new(EchoHandler));

    let (port, keys) = prepare(&server, &[0x06u8; 32]).await;
    let mut client = TestClient::connect(port, &keys).await;
    client.hello().await;

    let mut header = DataStreamDict::new();
    header.insert("protocol".to_string(), "target".into());
    header.insert("request".to_string(), "probe".into());
    header.insert("id".to_string(), 77i64.into());
    let mut message = DataStreamDict::new();
    message.insert("ping".to_string(), 5i64.into());
    client.send(&header, &message).await;

    let (response_header, response_message) = client.recv().await;
    assert_eq!(
        response_header.get("id").and_then(DataStreamValue::as_int),
        Some(77)
    );
    assert_eq!(
        response_header.get("status").and_then(DataStreamValue::as_int),
        Some(status::SUCCESS)
    );
    assert_eq!(
        response_message.get("ping").and_then(DataStreamValue::as_int),
        Some(5)
    );
    assert_eq!(
        response_message.get("answered"),
        Some(&DataStreamValue::Bool(true))
    );
}

#[tokio::test]
async fn unhandled_request_gets_missing_protocol_status() {
    let server = DataStreamServer::new();
    let (port, keys) = prepare(&server, &[0x07u8; 32]).await;
    let mut client = TestClient::connect(port, &keys).await;
    client.hello().await;

    client.send_request("nobody", "home", 5).await;
    let (header, _) = client.recv().await;
    assert_eq!(
        header.get("status").and_then(DataStreamValue::as_int),
        Some(status::MISSING_PROTOCOL)
    );
}

#[tokio::test]
async fn accessory_can_send_requests_and_events_through_the_handle() {
    let server = DataStreamServer::new();
    let mut connections = server.subscribe_connections();

    let (port, keys) = prepare(&server, &[0x08u8; 32]).await;
    let mut client = TestClient::connect(port, &keys).await;
    client.hello().await;

    let handle = connections.recv().await.expect("connected handle");

    // Accessory → controller event.
    let mut message = DataStreamDict::new();
    message.insert("streamId".to_string(), 1i64.into());
    handle.send_event("camera", "frame", message).unwrap();

    let (header, event_message) = client.recv().await;
    assert_eq!(
        header.get("event").and_then(DataStreamValue::as_str),
        Some("frame")
    );
    assert_eq!(
        event_message.get("streamId").and_then(DataStreamValue::as_int),
        Some(1)
    );

    // Accessory → controller request, answered by the client.
    let request_task = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .send_request("camera", "ack", DataStreamDict::new())
                .await
        })
    };

    let (request_header, _) = client.recv().await;
    let id = request_header
        .get("id")
        .and_then(DataStreamValue::as_int)
        .unwrap();
    let mut response_header = DataStreamDict::new();
    response_header.insert("protocol".to_string(), "camera".into());
    response_header.insert("response".to_string(), "ack".into());
    response_header.insert("id".to_string(), id.into());
    response_header.insert("status".to_string(), status::SUCCESS.into());
    let mut response_message = DataStreamDict::new();
    response_message.insert("ok".to_string(), true.into());
    client.send(&response_header, &response_message).await;

    let (response_status, response) = request_task.await.unwrap().unwrap();
    assert_eq!(response_status, status::SUCCESS);
    assert_eq!(response.get("ok"), Some(&DataStreamValue::Bool(true)));
}

#[tokio::test]
async fn listener_tears_down_once_idle() {
    let server = DataStreamServer::new();
    let (port, keys) = prepare(&server, &[0x09u8; 32]).await;
    assert_eq!(server.port(), Some(port));

    let mut client = TestClient::connect(port, &keys).await;
    client.hello().await;
    assert_eq!(server.pending_sessions(), 0);

    // Last connection goes away; the listener should follow.
    drop(client);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while server.port().is_some() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "listener did not tear down"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
