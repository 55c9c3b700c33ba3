#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use imessage_client::{
    aps::{read_frame, MAX_INBOUND_FRAME_LEN},
    handshake::{HandshakeState, Handshaker},
    ids::identity::{self_signed_certificate, DeviceIdentity, IdsConfig, OpensslKeyGenerator},
    CommandId, ConnectionState, CourierIdentity, CourierTransport, DeviceInfo, Frame, PushError, RegistrationData,
};
use openssl::{
    pkey::{PKey, Private},
    rsa::{Padding, Rsa},
    symm::{encrypt, Cipher},
};
use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
use uuid::Uuid;

pub fn push_key() -> PKey<Private> {
    PKey::from_rsa(Rsa::generate(1280).unwrap()).unwrap()
}

pub fn courier_identity() -> CourierIdentity {
    let key = push_key();
    let cert = self_signed_certificate(&key, &Uuid::new_v4()).unwrap();
    CourierIdentity::new(key, cert).unwrap()
}

pub fn registration() -> RegistrationData {
    RegistrationData {
        validation_data: vec![7; 64],
        valid_until: Utc::now() + Duration::hours(1),
        nacserv_commit: "test".into(),
        device_info: DeviceInfo::default(),
    }
}

pub async fn next_frame(stream: &mut DuplexStream) -> Frame {
    read_frame(stream, MAX_INBOUND_FRAME_LEN).await.unwrap()
}

pub async fn send_frame(stream: &mut DuplexStream, frame: &Frame) {
    stream.write_all(&frame.encode().unwrap()).await.unwrap();
    stream.flush().await.unwrap();
}

/// Hybrid-encrypts `plaintext` the way senders do and wraps it in an envelope.
pub fn pair_envelope(key: &PKey<Private>, plaintext: &[u8]) -> Vec<u8> {
    let aes_key = [0x42u8; 16];
    let ciphertext = encrypt(Cipher::aes_128_ctr(), &aes_key, Some(&[0u8; 16]), plaintext).unwrap();
    let head = ciphertext.len().min(100);
    let mut block = aes_key.to_vec();
    block.extend_from_slice(&ciphertext[..head]);

    let rsa = key.rsa().unwrap();
    let mut body = vec![0u8; rsa.size() as usize];
    let n = rsa.public_encrypt(&block, &mut body, Padding::PKCS1_OAEP).unwrap();
    body.truncate(n);
    body.extend_from_slice(&ciphertext[head..]);

    let mut out = vec![0x02];
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(&body);
    out.push(0);
    out
}

pub fn message_plist(text: &str, sender: &str, group: Option<&str>) -> Vec<u8> {
    let mut dict = plist::Dictionary::new();
    dict.insert("t".into(), text.into());
    dict.insert("p".into(), vec![plist::Value::from(sender)].into());
    if let Some(group) = group {
        dict.insert("gid".into(), group.into());
    }
    dict.insert("v".into(), 1u64.into());
    let mut out = Vec::new();
    plist::to_writer_binary(&mut out, &plist::Value::Dictionary(dict)).unwrap();
    out
}

/// Hands out pre-made duplex streams in order and records the last requested shard.
pub struct DuplexTransport {
    streams: Mutex<VecDeque<DuplexStream>>,
    pub shard: Mutex<Option<u32>>,
}

impl DuplexTransport {
    pub fn pair() -> (Self, DuplexStream) {
        let (transport, mut servers) = Self::with_streams(1);
        (transport, servers.remove(0))
    }

    /// One client stream per future connect; the server ends come back in the same order.
    pub fn with_streams(count: usize) -> (Self, Vec<DuplexStream>) {
        let (clients, servers): (VecDeque<_>, Vec<_>) = (0..count).map(|_| duplex(64 * 1024)).unzip();
        (DuplexTransport { streams: Mutex::new(clients), shard: Mutex::new(None) }, servers)
    }
}

#[async_trait]
impl CourierTransport for DuplexTransport {
    type Stream = DuplexStream;

    async fn open(&self, shard: u32) -> Result<DuplexStream, PushError> {
        *self.shard.lock().unwrap() = Some(shard);
        self.streams.lock().unwrap().pop_front().ok_or(PushError::ConnectionClosed)
    }
}

/// Skips IDS and returns fixed key material.
pub struct StubHandshaker {
    pub state: HandshakeState,
    pub calls: Arc<AtomicU32>,
}

impl StubHandshaker {
    pub fn new() -> Self {
        let identity = DeviceIdentity::generate(&OpensslKeyGenerator, &DeviceInfo::default()).unwrap();
        let cert = self_signed_certificate(&identity.push_key, &identity.device_uuid).unwrap();
        let courier_identity = CourierIdentity::new(identity.push_key.clone(), cert).unwrap();
        let reg = registration();
        StubHandshaker {
            state: HandshakeState {
                validation_data: reg.validation_data,
                device_info: reg.device_info,
                ids: IdsConfig::new(identity),
                courier_identity,
                connection_state: ConnectionState::default(),
            },
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn encryption_key(&self) -> PKey<Private> {
        self.state.ids.identity.encryption_key.clone()
    }
}

#[async_trait]
impl Handshaker for StubHandshaker {
    async fn handshake(&self, _registration: &RegistrationData) -> Result<HandshakeState, PushError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.clone())
    }
}

pub fn connect_ack(token: &[u8]) -> Frame {
    Frame::new(CommandId::ConnectAck).with_field(1, vec![0]).with_field(3, token).with_field(4, 4096u16.to_be_bytes())
}

/// Answers the client's connect frame with a successful ack.
pub async fn accept_connect(server: &mut DuplexStream, token: &[u8]) -> Frame {
    let connect = next_frame(server).await;
    assert_eq!(connect.command(), Some(CommandId::Connect));
    send_frame(server, &connect_ack(token)).await;
    connect
}
