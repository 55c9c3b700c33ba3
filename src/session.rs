use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rand::{rngs::StdRng, SeedableRng};
use tokio::{
    sync::{
        mpsc::{
            self,
            error::{TryRecvError, TrySendError},
        },
        watch, Mutex, OnceCell,
    },
    task::JoinHandle,
};

use crate::{
    aps::{
        topics::Topic, ConnectionState, CourierConnection, CourierTransport, PushNotification, TlsTransport,
        STATE_ACTIVE,
    },
    config::{RegistrationData, SessionConfig},
    handshake::{HandshakeState, Handshaker, RegistrationHandshaker},
    imessage::{decrypt::Decryptor, Message, MessageSummary},
    store::LastSeenStore,
    PushError,
};

/// Decrypts inbound pushes and queues them for the next poll.
struct Router {
    decryptor: Decryptor,
    tx: mpsc::Sender<Message>,
    placeholders: bool,
    dropped: Arc<AtomicU64>,
}

impl Router {
    fn route(&self, notification: PushNotification) -> Result<(), PushError> {
        let now = Utc::now();
        let message = match self.decryptor.decrypt(&notification.payload) {
            Ok(decrypted) => Message::from_decrypted(decrypted, now),
            Err(e) => {
                warn!("Failed to decrypt push on {:?} ({} bytes): {e}", notification.topic, notification.payload.len());
                if !self.placeholders {
                    return Ok(());
                }
                Message::placeholder(&e, notification.payload.len(), now)
            }
        };
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(PushError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(PushError::ConnectionClosed),
        }
    }

    async fn run(self, mut inbound: mpsc::Receiver<PushNotification>) {
        while let Some(notification) = inbound.recv().await {
            if let Err(e) = self.route(notification) {
                warn!("Dropping message: {e}");
            }
        }
        debug!("Inbound queue closed, router stopping");
    }
}

struct Running<S> {
    conn: Arc<CourierConnection<S>>,
    connection_state: ConnectionState,
    cancel: watch::Sender<bool>,
    read_task: JoinHandle<()>,
    router_task: JoinHandle<()>,
    messages: mpsc::Receiver<Message>,
}

impl<S> Drop for Running<S> {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
        self.read_task.abort();
        self.router_task.abort();
    }
}

/// One registered device polling for iMessages.
///
/// The handshake runs lazily, once, on first use. The courier connection is
/// started on the first fetch and lives until [`Session::close`].
pub struct Session<T: CourierTransport = TlsTransport> {
    registration: RegistrationData,
    config: SessionConfig,
    store: Arc<dyn LastSeenStore>,
    handshaker: Box<dyn Handshaker>,
    transport: T,
    state: OnceCell<HandshakeState>,
    running: Mutex<Option<Running<T::Stream>>>,
    /// Token and limits from the most recent connect-ack, reused on reconnect.
    last_connection: Mutex<Option<ConnectionState>>,
    rng: Mutex<StdRng>,
    dropped: Arc<AtomicU64>,
}

fn validate(registration: &RegistrationData) -> Result<(), PushError> {
    if registration.validation_data.is_empty() {
        return Err(PushError::InvalidRegistrationData);
    }
    if registration.is_expired() {
        return Err(PushError::RegistrationExpired);
    }
    Ok(())
}

impl Session<TlsTransport> {
    pub fn new(
        registration: RegistrationData,
        store: Arc<dyn LastSeenStore>,
        config: SessionConfig,
    ) -> Result<Self, PushError> {
        validate(&registration)?;
        let transport = TlsTransport::new(config.courier.clone())?;
        let handshaker = Box::new(RegistrationHandshaker::new()?);
        Session::with_parts(registration, store, config, handshaker, transport)
    }
}

impl<T: CourierTransport> Session<T> {
    pub fn with_parts(
        registration: RegistrationData,
        store: Arc<dyn LastSeenStore>,
        config: SessionConfig,
        handshaker: Box<dyn Handshaker>,
        transport: T,
    ) -> Result<Self, PushError> {
        validate(&registration)?;
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Session {
            registration,
            config,
            store,
            handshaker,
            transport,
            state: OnceCell::new(),
            running: Mutex::new(None),
            last_connection: Mutex::new(None),
            rng: Mutex::new(rng),
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Runs the handshake if it has not run yet.
    pub async fn ensure_handshake(&self) -> Result<&HandshakeState, PushError> {
        self.state.get_or_try_init(|| self.handshaker.handshake(&self.registration)).await
    }

    async fn start(&self) -> Result<Running<T::Stream>, PushError> {
        let state = self.ensure_handshake().await?;
        let mut last_connection = self.last_connection.lock().await;
        let previous = last_connection.clone().unwrap_or_else(|| state.connection_state.clone());
        let (conn, connection_state) = {
            let mut rng = self.rng.lock().await;
            CourierConnection::connect(
                &self.transport,
                &state.courier_identity,
                &previous,
                self.config.notification_queue_capacity,
                &mut *rng,
            )
            .await?
        };
        *last_connection = Some(connection_state.clone());
        drop(last_connection);
        conn.filter(&[Topic::Madrid]).await?;
        conn.set_state(STATE_ACTIVE).await?;
        let inbound = conn.take_inbound().ok_or(PushError::NotConnected)?;

        let conn = Arc::new(conn);
        let (cancel, cancel_rx) = watch::channel(false);
        let read_task = tokio::spawn({
            let conn = conn.clone();
            async move {
                match conn.read_loop(cancel_rx).await {
                    Ok(()) => info!("Courier read loop cancelled"),
                    Err(e) => error!("Courier read loop ended: {e}"),
                }
            }
        });

        let (tx, messages) = mpsc::channel(self.config.message_queue_capacity.max(1));
        let router = Router {
            decryptor: Decryptor::new(state.ids.identity.encryption_key.clone()),
            tx,
            placeholders: self.config.placeholder_on_decrypt_failure,
            dropped: self.dropped.clone(),
        };
        let router_task = tokio::spawn(router.run(inbound));

        info!("Session started");
        Ok(Running { conn, connection_state, cancel, read_task, router_task, messages })
    }

    /// Drains every message received since the last call.
    ///
    /// Connects on first use. Once the courier connection has died and its
    /// queue is drained this returns [`PushError::ConnectionClosed`]; the
    /// next call reconnects with the last assigned token.
    pub async fn fetch_messages(&self) -> Result<Vec<Message>, PushError> {
        let mut guard = self.running.lock().await;
        if guard.is_none() {
            *guard = Some(self.start().await?);
        }
        let Some(running) = guard.as_mut() else {
            return Err(PushError::NotConnected);
        };

        let mut out = vec![];
        let disconnected = loop {
            match running.messages.try_recv() {
                Ok(message) => out.push(message),
                Err(TryRecvError::Empty) => break false,
                Err(TryRecvError::Disconnected) => break true,
            }
        };
        if disconnected && out.is_empty() {
            if let Some(running) = guard.take() {
                self.retire(running);
            }
            warn!("Courier connection lost");
            return Err(PushError::ConnectionClosed);
        }
        Ok(out)
    }

    /// Keeps the courier-side drop count of a connection being discarded.
    fn retire(&self, running: Running<T::Stream>) {
        self.dropped.fetch_add(running.conn.dropped_notifications(), Ordering::Relaxed);
    }

    /// Messages newer than the store's last-seen time for their chat. The
    /// store is advanced to the newest returned timestamp per chat.
    pub async fn fetch_unread(&self) -> Result<Vec<MessageSummary>, PushError> {
        let messages = self.fetch_messages().await?;
        let unread: Vec<Message> = messages
            .into_iter()
            .filter(|m| self.store.last_seen(&m.chat).map_or(true, |seen| m.timestamp > seen))
            .collect();

        let mut newest: HashMap<&str, DateTime<Utc>> = HashMap::new();
        for message in &unread {
            let entry = newest.entry(message.chat.as_str()).or_insert(message.timestamp);
            if message.timestamp > *entry {
                *entry = message.timestamp;
            }
        }
        for (chat, at) in newest {
            self.store.set_last_seen(chat, at)?;
        }

        Ok(unread.iter().map(Message::summary).collect())
    }

    /// Token and limits from the last connect, if the connection is up.
    pub async fn connection_state(&self) -> Option<ConnectionState> {
        self.running.lock().await.as_ref().map(|r| r.connection_state.clone())
    }

    /// Messages lost to full queues, courier side and decrypted side.
    pub async fn dropped_messages(&self) -> u64 {
        let courier = match self.running.lock().await.as_ref() {
            Some(running) => running.conn.dropped_notifications(),
            None => 0,
        };
        courier + self.dropped.load(Ordering::Relaxed)
    }

    /// Stops the read loop and closes the courier connection.
    pub async fn close(&self) {
        let Some(mut running) = self.running.lock().await.take() else {
            return;
        };
        running.cancel.send_replace(true);
        running.conn.close().await;
        if let Err(e) = (&mut running.read_task).await {
            debug!("Read task: {e}");
        }
        if let Err(e) = (&mut running.router_task).await {
            debug!("Router task: {e}");
        }
        self.retire(running);
    }
}
