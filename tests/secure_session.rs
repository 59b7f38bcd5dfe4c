//! Full handshake integration: pair-setup, pair-verify, encrypted
//! request/response and event delivery against a live listener, driven
//! by the crate's own client-side primitives.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use hap_accessory::protocol::crypto::{
    ChaCha20Poly1305Cipher, ControlChannelKeys, Ed25519KeyPair, HkdfSha512, Nonce, SrpClient,
    SrpParams, X25519KeyPair, X25519PublicKey,
};
use hap_accessory::protocol::pairing::{AccessoryIdentity, MemoryControllerStore, tlv_type};
use hap_accessory::protocol::tlv::{TlvEncoder, TlvReader};
use hap_accessory::transport::{CharacteristicEvent, RecordLayer};
use hap_accessory::router::{
    AccessoryDelegate, CharacteristicRead, CharacteristicReadResult, CharacteristicWrite,
    CharacteristicWriteResult, HapStatus, ResourceRequest, ResourceResponse,
};
use hap_accessory::{HapServer, ServerConfig};

const PINCODE: &str = "031-45-154";

struct LightDelegate;

#[async_trait]
impl AccessoryDelegate for LightDelegate {
    async fn accessories(&self) -> Result<Value, HapStatus> {
        Ok(json!({
            "accessories": [{
                "aid": 1,
                "services": [{
                    "iid": 8,
                    "type": "43",
                    "characteristics": [{ "iid": 9, "type": "25", "value": false }],
                }],
            }]
        }))
    }

    async fn read_characteristics(
        &self,
        reads: Vec<CharacteristicRead>,
    ) -> Vec<CharacteristicReadResult> {
        reads
            .into_iter()
            .map(|r| CharacteristicReadResult {
                aid: r.aid,
                iid: r.iid,
                value: Some(json!(false)),
                status: None,
                characteristic_type: None,
                meta: None,
            })
            .collect()
    }

    async fn write_characteristics(
        &self,
        writes: Vec<CharacteristicWrite>,
    ) -> Vec<CharacteristicWriteResult> {
        writes
            .into_iter()
            .map(|w| CharacteristicWriteResult {
                aid: w.aid,
                iid: w.iid,
                status: HapStatus::Success,
                value: None,
            })
            .collect()
    }

    async fn identify(&self) -> Result<(), HapStatus> {
        Ok(())
    }

    async fn resource(&self, _request: ResourceRequest) -> Result<ResourceResponse, HapStatus> {
        Err(HapStatus::ResourceDoesNotExist)
    }
}

/// Minimal HTTP response reassembly for the test client
struct ResponseParser {
    buffer: Vec<u8>,
}

impl ResponseParser {
    fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn next_response(&mut self) -> Option<(String, Vec<u8>)> {
        let header_end = self
            .buffer
            .windows(4)
            .position(|window| window == b"\r\n\r\n")?;
        let header_text = String::from_utf8_lossy(&self.buffer[..header_end]).to_string();
        let status_line = header_text.lines().next().unwrap_or_default().to_string();

        let content_length = header_text
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("Content-Length")
                    .then(|| value.trim().parse::<usize>().ok())?
            })
            .unwrap_or(0);

        let total = header_end + 4 + content_length;
        if self.buffer.len() < total {
            return None;
        }
        let body = self.buffer[header_end + 4..total].to_vec();
        self.buffer.drain(..total);
        Some((status_line, body))
    }
}

/// Controller end of the connection: plaintext during the handshake,
/// chunked AEAD afterwards.
struct Controller {
    stream: TcpStream,
    parser: ResponseParser,
    /// Client-side record decryption (accessory → controller direction)
    record_in: RecordLayer,
    /// Outbound encryption state
    encrypt: Option<(ChaCha20Poly1305Cipher, u64)>,
}

impl Controller {
    async fn connect(port: u16) -> Self {
        Self {
            stream: TcpStream::connect(("127.0.0.1", port)).await.unwrap(),
            parser: ResponseParser::new(),
            record_in: RecordLayer::new(),
            encrypt: None,
        }
    }

    /// Install session keys; called right after pair-verify M4
    fn enable_encryption(&mut self, keys: &ControlChannelKeys) {
        // The controller decrypts accessory→controller frames and
        // encrypts controller→accessory ones, so its record layer sees
        // the keys mirrored.
        self.record_in
            .activate(&ControlChannelKeys {
                accessory_to_controller: keys.controller_to_accessory,
                controller_to_accessory: keys.accessory_to_controller,
            })
            .unwrap();
        self.encrypt = Some((
            ChaCha20Poly1305Cipher::new(&keys.controller_to_accessory).unwrap(),
            0,
        ));
    }

    async fn send(&mut self, request: &[u8]) {
        match &mut self.encrypt {
            None => self.stream.write_all(request).await.unwrap(),
            Some((cipher, counter)) => {
                let mut wire = Vec::new();
                for chunk in request.chunks(1024) {
                    let aad = (u16::try_from(chunk.len()).unwrap()).to_le_bytes();
                    let sealed = cipher
                        .encrypt_with_aad(&Nonce::from_counter(*counter), &aad, chunk)
                        .unwrap();
                    *counter += 1;
                    wire.extend_from_slice(&aad);
                    wire.extend_from_slice(&sealed);
                }
                self.stream.write_all(&wire).await.unwrap();
            }
        }
    }

    async fn recv(&mut self) -> (String, Vec<u8>) {
        loop {
            if let Some(response) = self.parser.next_response() {
                return response;
            }
            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed mid-response");
            self.record_in.feed(&buf[..n]);
            while let Some(plaintext) = self.record_in.decrypt().unwrap() {
                self.parser.feed(&plaintext);
            }
        }
    }

    async fn post(&mut self, path: &str, content_type: &str, body: &[u8]) -> (String, Vec<u8>) {
        let mut request = format!(
            "POST {path} HTTP/1.1\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        request.extend_from_slice(body);
        self.send(&request).await;
        self.recv().await
    }

    async fn put(&mut self, path: &str, body: &[u8]) -> (String, Vec<u8>) {
        let mut request = format!(
            "PUT {path} HTTP/1.1\r\nContent-Type: application/hap+json\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        request.extend_from_slice(body);
        self.send(&request).await;
        self.recv().await
    }

    async fn get(&mut self, path: &str) -> (String, Vec<u8>) {
        self.send(format!("GET {path} HTTP/1.1\r\n\r\n").as_bytes())
            .await;
        self.recv().await
    }
}

struct ControllerIdentity {
    pairing_id: String,
    keypair: Ed25519KeyPair,
}

/// Run pair-setup M1..M6 over the wire.
async fn pair_setup(controller: &mut Controller, identity: &ControllerIdentity) {
    let m1 = TlvEncoder::new()
        .add_u8(tlv_type::STATE, 1)
        .add_u8(tlv_type::METHOD, 0)
        .build();
    let (status, body) = controller
        .post("/pair-setup", "application/pairing+tlv8", &m1)
        .await;
    assert!(status.contains("200"), "M2: {status}");
    let m2 = TlvReader::decode(&body).unwrap();
    assert!(m2.get(tlv_type::ERROR).is_none(), "M2 error");
    let salt = m2.get(tlv_type::SALT).unwrap().to_vec();
    let server_public = m2.get(tlv_type::PUBLIC_KEY).unwrap().to_vec();

    let srp = SrpClient::new(&SrpParams::RFC5054_3072).unwrap();
    let verifier = srp
        .process_challenge(b"Pair-Setup", PINCODE.as_bytes(), &salt, &server_public)
        .unwrap();
    let m3 = TlvEncoder::new()
        .add_u8(tlv_type::STATE, 3)
        .add(tlv_type::PUBLIC_KEY, srp.public_key())
        .add(tlv_type::PROOF, verifier.client_proof())
        .build();
    let (_, body) = controller
        .post("/pair-setup", "application/pairing+tlv8", &m3)
        .await;
    let m4 = TlvReader::decode(&body).unwrap();
    assert!(m4.get(tlv_type::ERROR).is_none(), "M4 error");
    let session_key = verifier
        .verify_server(m4.get(tlv_type::PROOF).unwrap())
        .unwrap();

    let encrypt_key = HkdfSha512::new(Some(b"Pair-Setup-Encrypt-Salt"), session_key.as_bytes())
        .expand_fixed::<32>(b"Pair-Setup-Encrypt-Info")
        .unwrap();
    let controller_x =
        HkdfSha512::new(Some(b"Pair-Setup-Controller-Sign-Salt"), session_key.as_bytes())
            .expand_fixed::<32>(b"Pair-Setup-Controller-Sign-Info")
            .unwrap();

    let ltpk = identity.keypair.public_key();
    let mut info = Vec::new();
    info.extend_from_slice(&controller_x);
    info.extend_from_slice(identity.pairing_id.as_bytes());
    info.extend_from_slice(ltpk.as_bytes());
    let signature = identity.keypair.sign(&info);

    let sub_tlv = TlvEncoder::new()
        .add(tlv_type::IDENTIFIER, identity.pairing_id.as_bytes())
        .add(tlv_type::PUBLIC_KEY, ltpk.as_bytes())
        .add(tlv_type::SIGNATURE, &signature.to_bytes())
        .build();
    let cipher = ChaCha20Poly1305Cipher::new(&encrypt_key).unwrap();
    let sealed = cipher
        .encrypt(&Nonce::from_label(b"PS-Msg05"), &sub_tlv)
        .unwrap();

    let m5 = TlvEncoder::new()
        .add_u8(tlv_type::STATE, 5)
        .add(tlv_type::ENCRYPTED_DATA, &sealed)
        .build();
    let (_, body) = controller
        .post("/pair-setup", "application/pairing+tlv8", &m5)
        .await;
    let m6 = TlvReader::decode(&body).unwrap();
    assert_eq!(m6.get_u8(tlv_type::STATE), Some(6));
    assert!(m6.get(tlv_type::ERROR).is_none(), "M6 error");
    assert!(m6.get(tlv_type::ENCRYPTED_DATA).is_some());
}

/// Run pair-verify M1..M4 and switch the controller to encrypted mode.
async fn pair_verify(controller: &mut Controller, identity: &ControllerIdentity) {
    let keypair = X25519KeyPair::generate();
    let m1 = TlvEncoder::new()
        .add_u8(tlv_type::STATE, 1)
        .add(tlv_type::PUBLIC_KEY, keypair.public_key().as_bytes())
        .build();
    let (_, body) = controller
        .post("/pair-verify", "application/pairing+tlv8", &m1)
        .await;
    let m2 = TlvReader::decode(&body).unwrap();
    assert!(m2.get(tlv_type::ERROR).is_none(), "M2 error");
    let server_public = m2.get(tlv_type::PUBLIC_KEY).unwrap().to_vec();

    let shared = keypair.diffie_hellman(&X25519PublicKey::from_bytes(&server_public).unwrap());
    let session_key = HkdfSha512::new(Some(b"Pair-Verify-Encrypt-Salt"), shared.as_bytes())
        .expand_fixed::<32>(b"Pair-Verify-Encrypt-Info")
        .unwrap();

    let mut info = Vec::new();
    info.extend_from_slice(keypair.public_key().as_bytes());
    info.extend_from_slice(identity.pairing_id.as_bytes());
    info.extend_from_slice(&server_public);
    let signature = identity.keypair.sign(&info);

    let sub_tlv = TlvEncoder::new()
        .add(tlv_type::IDENTIFIER, identity.pairing_id.as_bytes())
        .add(tlv_type::SIGNATURE, &signature.to_bytes())
        .build();
    let cipher = ChaCha20Poly1305Cipher::new(&session_key).unwrap();
    let sealed = cipher
        .encrypt(&Nonce::from_label(b"PV-Msg03"), &sub_tlv)
        .unwrap();

    let m3 = TlvEncoder::new()
        .add_u8(tlv_type::STATE, 3)
        .add(tlv_type::ENCRYPTED_DATA, &sealed)
        .build();
    let (_, body) = controller
        .post("/pair-verify", "application/pairing+tlv8", &m3)
        .await;
    let m4 = TlvReader::decode(&body).unwrap();
    assert_eq!(m4.get_u8(tlv_type::STATE), Some(4));
    assert!(m4.get(tlv_type::ERROR).is_none(), "M4 error");

    controller.enable_encryption(&ControlChannelKeys::derive(shared.as_bytes()).unwrap());
}

async fn start_accessory() -> (HapServer, u16) {
    let identity = AccessoryIdentity {
        pairing_id: "11:22:33:44:55:66".to_string(),
        keypair: Ed25519KeyPair::generate(),
    };
    let config = ServerConfig {
        pincode: PINCODE.to_string(),
        ..ServerConfig::default()
    };
    let mut server = HapServer::new(
        config,
        identity,
        Arc::new(MemoryControllerStore::new()),
        Arc::new(LightDelegate),
    );
    let addr = server.start().await.unwrap();
    (server, addr.port())
}

#[tokio::test]
async fn full_pairing_and_encrypted_session() {
    let (_server, port) = start_accessory().await;
    let identity = ControllerIdentity {
        pairing_id: "controller-0001".to_string(),
        keypair: Ed25519KeyPair::generate(),
    };

    let mut controller = Controller::connect(port).await;
    pair_setup(&mut controller, &identity).await;
    pair_verify(&mut controller, &identity).await;

    // All traffic is now encrypted; the accessory database comes back.
    let (status, body) = controller.get("/accessories").await;
    assert!(status.starts_with("HTTP/1.1 200"), "got: {status}");
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["accessories"][0]["aid"], json!(1));

    // Characteristic read over the encrypted channel.
    let (status, body) = controller.get("/characteristics?id=1.9").await;
    assert!(status.starts_with("HTTP/1.1 200"), "got: {status}");
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["characteristics"][0]["value"], json!(false));
}

#[tokio::test]
async fn events_are_delivered_after_subscription() {
    let (server, port) = start_accessory().await;
    let identity = ControllerIdentity {
        pairing_id: "controller-0002".to_string(),
        keypair: Ed25519KeyPair::generate(),
    };

    let mut controller = Controller::connect(port).await;
    pair_setup(&mut controller, &identity).await;
    pair_verify(&mut controller, &identity).await;

    // Subscribe to 1.9.
    let body = json!({ "characteristics": [{ "aid": 1, "iid": 9, "ev": true }] });
    let (status, _) = controller
        .put("/characteristics", body.to_string().as_bytes())
        .await;
    assert!(status.starts_with("HTTP/1.1 204"), "got: {status}");

    // Accessory-side change fans out as an EVENT/1.0 frame.
    server.publish_event(
        CharacteristicEvent {
            aid: 1,
            iid: 9,
            value: json!(true),
            immediate: true,
        },
        None,
    );

    let (status_line, body) = tokio::time::timeout(Duration::from_secs(5), controller.recv())
        .await
        .expect("event frame not delivered");
    assert!(status_line.starts_with("EVENT/1.0 200"), "got: {status_line}");
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["characteristics"][0]["aid"], json!(1));
    assert_eq!(parsed["characteristics"][0]["value"], json!(true));
}

#[tokio::test]
async fn second_pairing_attempt_is_rejected_while_paired() {
    let (_server, port) = start_accessory().await;
    let identity = ControllerIdentity {
        pairing_id: "controller-0003".to_string(),
        keypair: Ed25519KeyPair::generate(),
    };

    let mut controller = Controller::connect(port).await;
    pair_setup(&mut controller, &identity).await;

    // A second controller cannot pair-setup while paired.
    let mut second = Controller::connect(port).await;
    let m1 = TlvEncoder::new()
        .add_u8(tlv_type::STATE, 1)
        .add_u8(tlv_type::METHOD, 0)
        .build();
    let (_, body) = second
        .post("/pair-setup", "application/pairing+tlv8", &m1)
        .await;
    let m2 = TlvReader::decode(&body).unwrap();
    assert_eq!(m2.get_u8(tlv_type::ERROR), Some(0x06), "expected Unavailable");
}

#[tokio::test]
async fn wrong_controller_key_cannot_pair_verify() {
    let (_server, port) = start_accessory().await;
    let identity = ControllerIdentity {
        pairing_id: "controller-0004".to_string(),
        keypair: Ed25519KeyPair::generate(),
    };

    let mut controller = Controller::connect(port).await;
    pair_setup(&mut controller, &identity).await;

    // Pair-verify with a different long-term key must fail at M3.
    let imposter = ControllerIdentity {
        pairing_id: identity.pairing_id.clone(),
        keypair: Ed25519KeyPair::generate(),
    };

    let keypair = X25519KeyPair::generate();
    let m1 = TlvEncoder::new()
        .add_u8(tlv_type::STATE, 1)
        .add(tlv_type::PUBLIC_KEY, keypair.public_key().as_bytes())
        .build();
    let (_, body) = controller
        .post("/pair-verify", "application/pairing+tlv8", &m1)
        .await;
    let m2 = TlvReader::decode(&body).unwrap();
    let server_public = m2.get(tlv_type::PUBLIC_KEY).unwrap().to_vec();

    let shared = keypair.diffie_hellman(&X25519PublicKey::from_bytes(&server_public).unwrap());
    let session_key = HkdfSha512::new(Some(b"Pair-Verify-Encrypt-Salt"), shared.as_bytes())
        .expand_fixed::<32>(b"Pair-Verify-Encrypt-Info")
        .unwrap();

    let mut info = Vec::new();
    info.extend_from_slice(keypair.public_key().as_bytes());
    info.extend_from_slice(imposter.pairing_id.as_bytes());
    info.extend_from_slice(&server_public);
    let signature = imposter.keypair.sign(&info);

    let sub_tlv = TlvEncoder::new()
        .add(tlv_type::IDENTIFIER, imposter.pairing_id.as_bytes())
        .add(tlv_type::SIGNATURE, &signature.to_bytes())
        .build();
    let cipher = ChaCha20Poly1305Cipher::new(&session_key).unwrap();
    let sealed = cipher
        .encrypt(&Nonce::from_label(b"PV-Msg03"), &sub_tlv)
        .unwrap();

    let m3 = TlvEncoder::new()
        .add_u8(tlv_type::STATE, 3)
        .add(tlv_type::ENCRYPTED_DATA, &sealed)
        .build();
    let (_, body) = controller
        .post("/pair-verify", "application/pairing+tlv8", &m3)
        .await;
    let m4 = TlvReader::decode(&body).unwrap();
    assert_eq!(m4.get_u8(tlv_type::ERROR), Some(0x02), "expected Authentication");

    // The connection survives; unauthenticated requests still get 470.
    let (status, _) = controller.get("/accessories").await;
    assert!(status.starts_with("HTTP/1.1 470"), "got: {status}");
}
