mod common;

use std::{sync::atomic::Ordering, sync::Arc, time::Duration};

use chrono::Utc;
use common::*;
use imessage_client::{
    util::gzip, CommandId, Frame, LastSeenStore, MemoryStore, MessageSummary, PushError, Session, SessionConfig,
    Topic,
};
use tokio::{io::DuplexStream, task::JoinHandle};

fn push(payload: Vec<u8>) -> Frame {
    Frame::new(CommandId::SendMessage).with_field(2, Topic::Madrid.hash()).with_field(3, payload)
}

/// Plays the courier side of session start-up. Returns the stream and the
/// client's connect frame.
async fn serve_start(mut server: DuplexStream, token: &'static [u8]) -> (DuplexStream, Frame) {
    let connect = accept_connect(&mut server, token).await;
    let filter = next_frame(&mut server).await;
    assert_eq!(filter.command(), Some(CommandId::FilterTopics));
    assert_eq!(filter.fields_with(2).collect::<Vec<_>>(), vec![&Topic::Madrid.hash()[..]]);
    let state = next_frame(&mut server).await;
    assert_eq!(state.command(), Some(CommandId::SetState));
    (server, connect)
}

fn courier() -> (DuplexTransport, JoinHandle<DuplexStream>) {
    let (transport, server) = DuplexTransport::pair();
    let task = tokio::spawn(async move { serve_start(server, b"session-token").await.0 });
    (transport, task)
}

async fn collect_unread<T: imessage_client::CourierTransport>(session: &Session<T>, want: usize) -> Vec<MessageSummary> {
    let mut out = vec![];
    for _ in 0..200 {
        out.extend(session.fetch_unread().await.unwrap());
        if out.len() >= want {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    out
}

#[tokio::test]
async fn pushes_become_unread_summaries() {
    let handshaker = StubHandshaker::new();
    let key = handshaker.encryption_key();
    let calls = handshaker.calls.clone();
    let (transport, courier_task) = courier();
    let store = Arc::new(MemoryStore::new());
    let config = SessionConfig { rng_seed: Some(7), ..Default::default() };
    let session =
        Session::with_parts(registration(), store.clone(), config, Box::new(handshaker), transport).unwrap();

    assert!(session.fetch_unread().await.unwrap().is_empty());
    let mut server = courier_task.await.unwrap();
    assert_eq!(
        session.connection_state().await.and_then(|s| s.token),
        Some(b"session-token".to_vec())
    );

    let document = gzip(&message_plist("hi there", "mailto:alice@example.com", Some("G1"))).unwrap();
    send_frame(&mut server, &push(pair_envelope(&key, &document))).await;
    send_frame(&mut server, &push(vec![1, 2, 3, 4, 5])).await;

    let summaries = collect_unread(&session, 2).await;
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].sender, "mailto:alice@example.com");
    assert_eq!(summaries[0].preview, "hi there");
    assert_eq!(summaries[1].sender, "unknown-sender");
    assert!(summaries[1].preview.starts_with("[Decrypt failed: "));
    assert!(summaries[1].preview.ends_with("] 5 bytes"));

    assert_eq!(store.last_seen("G1"), Some(summaries[0].timestamp));
    assert!(store.last_seen("unknown-chat").is_some());
    assert!(session.fetch_unread().await.unwrap().is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    session.close().await;
}

#[tokio::test]
async fn seen_chats_and_failed_decrypts_can_be_filtered() {
    let handshaker = StubHandshaker::new();
    let key = handshaker.encryption_key();
    let (transport, courier_task) = courier();
    let store = Arc::new(MemoryStore::new());
    store.set_last_seen("G-old", Utc::now() + chrono::Duration::hours(1)).unwrap();
    let config = SessionConfig { placeholder_on_decrypt_failure: false, ..Default::default() };
    let session =
        Session::with_parts(registration(), store.clone(), config, Box::new(handshaker), transport).unwrap();

    session.fetch_messages().await.unwrap();
    let mut server = courier_task.await.unwrap();

    send_frame(&mut server, &push(vec![0xFF; 10])).await;
    let stale = message_plist("already seen", "tel:+15550100", Some("G-old"));
    send_frame(&mut server, &push(pair_envelope(&key, &stale))).await;
    let fresh = message_plist("direct hello", "tel:+15550101", None);
    send_frame(&mut server, &push(pair_envelope(&key, &fresh))).await;

    let mut messages = vec![];
    for _ in 0..200 {
        messages.extend(session.fetch_messages().await.unwrap());
        if messages.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].chat, "G-old");
    assert_eq!(messages[1].chat, "tel:+15550101");
    assert_eq!(messages[1].service, "iMessage");

    // Re-deliver both to exercise unread filtering.
    send_frame(&mut server, &push(pair_envelope(&key, &stale))).await;
    send_frame(&mut server, &push(pair_envelope(&key, &fresh))).await;
    let unread = collect_unread(&session, 1).await;
    assert_eq!(unread.len(), 1);
    assert_eq!(unread[0].preview, "direct hello");

    session.close().await;
}

#[tokio::test]
async fn full_message_queue_counts_drops() {
    let handshaker = StubHandshaker::new();
    let key = handshaker.encryption_key();
    let (transport, courier_task) = courier();
    let config = SessionConfig { message_queue_capacity: 1, ..Default::default() };
    let session =
        Session::with_parts(registration(), Arc::new(MemoryStore::new()), config, Box::new(handshaker), transport)
            .unwrap();

    session.fetch_messages().await.unwrap();
    let mut server = courier_task.await.unwrap();
    for text in ["one", "two", "three"] {
        let doc = message_plist(text, "tel:+15550102", None);
        send_frame(&mut server, &push(pair_envelope(&key, &doc))).await;
    }

    for _ in 0..200 {
        if session.dropped_messages().await == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(session.dropped_messages().await, 2);
    let messages = session.fetch_messages().await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].text, "one");

    session.close().await;
}

#[tokio::test]
async fn lost_courier_is_reported_and_reconnect_keeps_token() {
    let handshaker = StubHandshaker::new();
    let calls = handshaker.calls.clone();
    let (transport, mut servers) = DuplexTransport::with_streams(2);
    let second = servers.pop().unwrap();
    let first = servers.pop().unwrap();
    let first_task = tokio::spawn(serve_start(first, b"session-token"));
    let session = Session::with_parts(
        registration(),
        Arc::new(MemoryStore::new()),
        SessionConfig::default(),
        Box::new(handshaker),
        transport,
    )
    .unwrap();

    assert!(session.fetch_messages().await.unwrap().is_empty());
    let (server, _) = first_task.await.unwrap();
    drop(server);

    let mut result = Ok(vec![]);
    for _ in 0..200 {
        result = session.fetch_messages().await;
        if result.is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(matches!(result, Err(PushError::ConnectionClosed)));
    assert!(session.connection_state().await.is_none());

    // The ack carries no token, so the one assigned first stays in force.
    let second_task = tokio::spawn(serve_start(second, b""));
    assert!(session.fetch_messages().await.unwrap().is_empty());
    let (_server, connect) = second_task.await.unwrap();
    assert_eq!(connect.find_field(1), Some(&b"session-token"[..]));
    assert_eq!(
        session.connection_state().await.and_then(|s| s.token),
        Some(b"session-token".to_vec())
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    session.close().await;
}

#[test]
fn construction_validates_registration() {
    let (transport, _server) = DuplexTransport::pair();
    let mut empty = registration();
    empty.validation_data.clear();
    let result = Session::with_parts(
        empty,
        Arc::new(MemoryStore::new()),
        SessionConfig::default(),
        Box::new(StubHandshaker::new()),
        transport,
    );
    assert!(matches!(result, Err(PushError::InvalidRegistrationData)));

    let (transport, _server) = DuplexTransport::pair();
    let mut expired = registration();
    expired.valid_until = Utc::now() - chrono::Duration::minutes(1);
    let result = Session::with_parts(
        expired,
        Arc::new(MemoryStore::new()),
        SessionConfig::default(),
        Box::new(StubHandshaker::new()),
        transport,
    );
    assert!(matches!(result, Err(PushError::RegistrationExpired)));
}
