pub mod codec;
pub mod commands;
pub mod topics;

use std::{
    io::ErrorKind,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, info, warn};
use openssl::{
    pkey::{PKey, Private},
    x509::X509,
};
use rand::{CryptoRng, Rng, RngCore};
use rustls::{
    pki_types::{CertificateDer, ServerName},
    ClientConfig, RootCertStore,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::{
        mpsc::{self, error::TrySendError},
        watch, Mutex,
    },
    time::timeout,
};
use tokio_rustls::{client::TlsStream, TlsConnector};

use self::{
    codec::{decode_fields, read_frame_len, CommandId, ConnectionFlags, Frame},
    commands::{
        keep_alive_frame, ConnectAck, ConnectCommand, FilterTopicsCommand, IncomingSendMessage, SetStateCommand,
        CONNECT_INITIAL_STATE,
    },
    topics::Topic,
};
use crate::{config::CourierConfig, util::sign_sha1, PushError};

pub const COURIER_HOST_COUNT: u32 = 50;
pub const COURIER_HOSTNAME: &str = "courier.push.apple.com";
pub const COURIER_PORT: u16 = 5223;
pub const COURIER_ALPN: &str = "apns-security-v3";
/// Default deadline for every outbound write.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_MESSAGE_SIZE: u16 = 4 * 1024;
pub const DEFAULT_MAX_LARGE_MESSAGE_SIZE: u16 = 15 * 1024;
/// Upper bound on a single inbound frame body.
pub const MAX_INBOUND_FRAME_LEN: usize = 1 << 20;
/// `set_state` value that marks the connection as active.
pub const STATE_ACTIVE: u8 = 1;

/// Transport token and limits negotiated with the courier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub token: Option<Vec<u8>>,
    pub max_message_size: u16,
    pub max_large_message_size: u16,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState {
            token: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_large_message_size: DEFAULT_MAX_LARGE_MESSAGE_SIZE,
        }
    }
}

impl ConnectionState {
    /// State after a successful connect-ack. Absent or zero values keep the
    /// previous ones.
    pub fn after_connect(&self, ack: &ConnectAck) -> ConnectionState {
        ConnectionState {
            token: ack.token.clone().filter(|t| !t.is_empty()).or_else(|| self.token.clone()),
            max_message_size: match ack.max_message_size {
                0 => self.max_message_size,
                size => size,
            },
            max_large_message_size: match ack.large_message_size {
                0 => self.max_large_message_size,
                size => size,
            },
        }
    }
}

/// Key and certificate that authenticate the connect frame.
#[derive(Clone)]
pub struct CourierIdentity {
    pub private_key: PKey<Private>,
    pub certificate: X509,
}

impl CourierIdentity {
    pub fn new(private_key: PKey<Private>, certificate: X509) -> Result<Self, PushError> {
        let matches = certificate.public_key().map(|public| public.public_eq(&*private_key)).unwrap_or(false);
        if !matches {
            return Err(PushError::MissingIdentity);
        }
        Ok(CourierIdentity { private_key, certificate })
    }
}

/// A push delivered on one of our topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushNotification {
    pub topic: Option<Topic>,
    pub topic_hash: Vec<u8>,
    pub payload: Vec<u8>,
    pub message_id: Option<Vec<u8>>,
    pub timestamp: Option<u64>,
}

impl From<IncomingSendMessage> for PushNotification {
    fn from(msg: IncomingSendMessage) -> Self {
        let topic_hash = msg.topic_hash.unwrap_or_default();
        PushNotification {
            topic: Topic::from_hash(&topic_hash),
            topic_hash,
            payload: msg.payload,
            message_id: msg.message_id,
            timestamp: msg
                .timestamp
                .and_then(|t| t.get(..8).and_then(|b| b.try_into().ok()))
                .map(u64::from_be_bytes),
        }
    }
}

/// Opens the byte stream to a numbered courier shard.
#[async_trait]
pub trait CourierTransport: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn open(&self, shard: u32) -> Result<Self::Stream, PushError>;

    fn host_count(&self) -> u32 {
        COURIER_HOST_COUNT
    }

    fn write_deadline(&self) -> Duration {
        WRITE_DEADLINE
    }
}

pub struct TlsTransport {
    config: CourierConfig,
    tls: Arc<ClientConfig>,
}

impl TlsTransport {
    pub fn new(config: CourierConfig) -> Result<Self, PushError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        for der in &config.extra_roots {
            roots.add(CertificateDer::from(der.clone()))?;
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut tls = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        tls.alpn_protocols = vec![config.alpn.as_bytes().to_vec()];

        Ok(TlsTransport { config, tls: Arc::new(tls) })
    }
}

#[async_trait]
impl CourierTransport for TlsTransport {
    type Stream = TlsStream<TcpStream>;

    async fn open(&self, shard: u32) -> Result<Self::Stream, PushError> {
        let host = self.config.host_for(shard);
        let server_name = ServerName::try_from(self.config.hostname.clone())
            .map_err(|_| PushError::InvalidServerName(self.config.hostname.clone()))?;

        debug!("Dialing {host}:{}", self.config.port);
        let tcp = TcpStream::connect((host.as_str(), self.config.port)).await?;
        tcp.set_nodelay(true)?;
        let stream = TlsConnector::from(self.tls.clone()).connect(server_name, tcp).await?;
        Ok(stream)
    }

    fn host_count(&self) -> u32 {
        self.config.host_count
    }

    fn write_deadline(&self) -> Duration {
        self.config.write_deadline()
    }
}

/// Reads one frame. EOF before the command byte is a clean close.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_len: usize) -> Result<Frame, PushError> {
    let mut id = [0u8; 1];
    match reader.read_exact(&mut id).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(PushError::ConnectionClosed),
        Err(e) => return Err(e.into()),
    }
    if id[0] == 0 {
        return Ok(Frame::default());
    }

    let mut len = [0u8; 4];
    reader.read_exact(&mut len).await?;
    let len = read_frame_len(&len);
    if len > max_len {
        return Err(PushError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Frame { id: id[0], fields: decode_fields(&body)? })
}

async fn write_with_deadline<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
    deadline: Duration,
) -> Result<(), PushError> {
    let write = async {
        writer.write_all(bytes).await?;
        writer.flush().await
    };
    timeout(deadline, write).await.map_err(|_| PushError::WriteTimeout)??;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CourierPhase {
    Active { topics_filtered: bool, state_sent: bool },
    Closed,
}

/// An authenticated courier socket.
///
/// Only exists after a successful connect handshake; `close` moves it to
/// [`CourierPhase::Closed`], after which every write fails with
/// [`PushError::NotConnected`].
pub struct CourierConnection<S = TlsStream<TcpStream>> {
    state: ConnectionState,
    write_deadline: Duration,
    phase: Mutex<CourierPhase>,
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    closed: watch::Sender<bool>,
    inbound_tx: std::sync::Mutex<Option<mpsc::Sender<PushNotification>>>,
    inbound_rx: std::sync::Mutex<Option<mpsc::Receiver<PushNotification>>>,
    dropped: AtomicU64,
}

impl<S> CourierConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Dials a random shard and authenticates with a signed nonce. Returns
    /// the live connection and the state the courier assigned.
    pub async fn connect<T, R>(
        transport: &T,
        identity: &CourierIdentity,
        state: &ConnectionState,
        inbound_capacity: usize,
        rng: &mut R,
    ) -> Result<(Self, ConnectionState), PushError>
    where
        T: CourierTransport<Stream = S>,
        R: RngCore + CryptoRng,
    {
        let shard = rng.gen_range(1..=transport.host_count().max(1));
        let mut nonce = [0u8; 20];
        rng.fill_bytes(&mut nonce);
        nonce[0] = 0;

        info!("Connecting to courier shard {shard}");
        let stream = transport.open(shard).await?;
        Self::handshake_with_deadline(stream, identity, state, &nonce, inbound_capacity, transport.write_deadline())
            .await
    }

    /// Connect exchange over an already-open stream, with the default write
    /// deadline.
    pub async fn handshake(
        stream: S,
        identity: &CourierIdentity,
        state: &ConnectionState,
        nonce: &[u8],
        inbound_capacity: usize,
    ) -> Result<(Self, ConnectionState), PushError> {
        Self::handshake_with_deadline(stream, identity, state, nonce, inbound_capacity, WRITE_DEADLINE).await
    }

    pub async fn handshake_with_deadline(
        mut stream: S,
        identity: &CourierIdentity,
        state: &ConnectionState,
        nonce: &[u8],
        inbound_capacity: usize,
        write_deadline: Duration,
    ) -> Result<(Self, ConnectionState), PushError> {
        let signature = sign_sha1(&identity.private_key, nonce)?;
        let certificate = identity.certificate.to_der()?;
        let token = state.token.clone().unwrap_or_default();
        let connect = ConnectCommand {
            token: &token,
            state: CONNECT_INITIAL_STATE,
            flags: ConnectionFlags::BASE | ConnectionFlags::ROOT,
            certificate: &certificate,
            nonce,
            signature: &signature,
        }
        .to_frame();
        write_with_deadline(&mut stream, &connect.encode()?, write_deadline).await?;

        let reply = read_frame(&mut stream, MAX_INBOUND_FRAME_LEN).await?;
        if reply.command() != Some(CommandId::ConnectAck) {
            return Err(PushError::UnexpectedCommand(reply.id));
        }
        let ack = ConnectAck::from_frame(&reply);
        if !ack.is_success() {
            warn!("Courier rejected connect: {:?}", ack.status);
            return Err(PushError::ConnectRejected(ack.status.unwrap_or_default()));
        }

        let next = state.after_connect(&ack);
        info!(
            "Connected to courier (token {} bytes, max message {}, large {})",
            next.token.as_ref().map_or(0, Vec::len),
            next.max_message_size,
            next.max_large_message_size
        );

        let (reader, writer) = tokio::io::split(stream);
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity.max(1));
        let conn = CourierConnection {
            state: next.clone(),
            write_deadline,
            phase: Mutex::new(CourierPhase::Active { topics_filtered: false, state_sent: false }),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: watch::channel(false).0,
            inbound_tx: std::sync::Mutex::new(Some(inbound_tx)),
            inbound_rx: std::sync::Mutex::new(Some(inbound_rx)),
            dropped: AtomicU64::new(0),
        };
        Ok((conn, next))
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub async fn phase(&self) -> CourierPhase {
        *self.phase.lock().await
    }

    /// Hands out the inbound push queue. Only the first call gets it.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<PushNotification>> {
        self.inbound_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Pushes dropped because the inbound queue was full.
    pub fn dropped_notifications(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn filter(&self, topics: &[Topic]) -> Result<(), PushError> {
        let hashes: Vec<[u8; 20]> = topics.iter().map(|t| t.hash()).collect();
        let token = self.state.token.clone().unwrap_or_default();
        let frame = FilterTopicsCommand { token: &token, topic_hashes: &hashes }.to_frame();

        let mut phase = self.phase.lock().await;
        let CourierPhase::Active { topics_filtered, .. } = &mut *phase else {
            return Err(PushError::NotConnected);
        };
        self.write_frame(&frame).await?;
        *topics_filtered = true;
        info!("Filtered topics {}", topics.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(", "));
        Ok(())
    }

    pub async fn set_state(&self, state: u8) -> Result<(), PushError> {
        let mut phase = self.phase.lock().await;
        let CourierPhase::Active { state_sent, .. } = &mut *phase else {
            return Err(PushError::NotConnected);
        };
        self.write_frame(&SetStateCommand { state }.to_frame()).await?;
        *state_sent = true;
        info!("Set courier state {state}");
        Ok(())
    }

    /// Reads and dispatches frames until `cancel` fires, the connection is
    /// closed, or a read or keep-alive write fails. Cancellation is checked
    /// between frames; `close` also interrupts a blocked read.
    pub async fn read_loop(&self, mut cancel: watch::Receiver<bool>) -> Result<(), PushError> {
        let result = self.run_read_loop(&mut cancel).await;
        self.release_inbound();
        result
    }

    async fn run_read_loop(&self, cancel: &mut watch::Receiver<bool>) -> Result<(), PushError> {
        let mut closed = self.closed.subscribe();
        let mut reader = self.reader.lock().await;
        loop {
            if *cancel.borrow() {
                return Ok(());
            }
            if *closed.borrow() {
                return Err(PushError::ConnectionClosed);
            }

            let frame = tokio::select! {
                frame = read_frame(&mut *reader, MAX_INBOUND_FRAME_LEN) => frame?,
                _ = closed.wait_for(|closed| *closed) => return Err(PushError::ConnectionClosed),
            };
            self.dispatch(frame).await?;
        }
    }

    async fn dispatch(&self, frame: Frame) -> Result<(), PushError> {
        if frame.is_empty() {
            return Ok(());
        }
        match frame.command() {
            Some(CommandId::SendMessage) => {
                let notification = PushNotification::from(IncomingSendMessage::from_frame(&frame));
                debug!("Push on {:?} ({} bytes)", notification.topic, notification.payload.len());
                self.deliver(notification);
            }
            Some(CommandId::KeepAlive) => {
                self.write_frame(&keep_alive_frame()).await?;
                debug!("Answered keep-alive");
            }
            Some(
                CommandId::ConnectAck
                | CommandId::FilterTopicsAck
                | CommandId::SendMessageAck
                | CommandId::KeepAliveAck,
            ) => debug!("Courier ack {}", frame.id),
            _ => warn!("Ignoring unknown courier command {}", frame.id),
        }
        Ok(())
    }

    fn deliver(&self, notification: PushNotification) {
        let guard = self.inbound_tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            warn!("Inbound queue released, dropping push");
            return;
        };
        match tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Inbound queue full, dropping push");
            }
            Err(TrySendError::Closed(_)) => warn!("Inbound receiver gone, dropping push"),
        }
    }

    fn release_inbound(&self) {
        self.inbound_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    async fn write_frame(&self, frame: &Frame) -> Result<(), PushError> {
        let bytes = frame.encode()?;
        let mut writer = self.writer.lock().await;
        write_with_deadline(&mut *writer, &bytes, self.write_deadline).await
    }

    /// Closes the socket. A blocked `read_loop` returns
    /// [`PushError::ConnectionClosed`].
    pub async fn close(&self) {
        self.closed.send_replace(true);
        *self.phase.lock().await = CourierPhase::Closed;
        self.release_inbound();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Courier shutdown: {e}");
        }
        info!("Courier connection closed");
    }
}
