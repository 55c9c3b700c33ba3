//! poll_once
//!
//! Developer helper: loads registration JSON, registers with IDS, connects to
//! the courier, waits for pushes and prints the unread summaries.
//!
//! Usage: poll_once <registration-json> [last-seen-json] [wait-seconds]
//!
//! Without a last-seen file every message counts as unread. Session settings
//! come from `$POLL_SESSION_CONFIG` (JSON) when set.

use std::{env, sync::Arc, time::Duration};

use imessage_client::{
    init_logger, FileStore, IDSError, LastSeenStore, MemoryStore, PushError, RegistrationData, Session,
    SessionConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logger();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <registration-json> [last-seen-json] [wait-seconds]", args[0]);
        std::process::exit(2);
    }

    let registration = RegistrationData::load(&args[1])?;
    eprintln!("[poll-once] registration={} valid_until={}", args[1], registration.valid_until);
    if registration.is_expired() {
        eprintln!("[poll-once] registration data expired; regenerate it on a Mac");
        std::process::exit(1);
    }

    let store: Arc<dyn LastSeenStore> = match args.get(2) {
        Some(path) => {
            eprintln!("[poll-once] store={path}");
            Arc::new(FileStore::open(path)?)
        }
        None => Arc::new(MemoryStore::new()),
    };
    let wait = args.get(3).map(|s| s.parse::<u64>()).transpose()?.unwrap_or(10);

    let config = match env::var("POLL_SESSION_CONFIG") {
        Ok(path) => SessionConfig::load(path)?,
        Err(_) => SessionConfig::default(),
    };

    let session = Session::new(registration, store, config)?;
    let mut summaries = match session.fetch_unread().await {
        Ok(summaries) => summaries,
        Err(PushError::Ids(e @ IDSError::Status { .. })) if e.is_two_factor_required() => {
            eprintln!("[poll-once] IDS requires two-factor authentication");
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    eprintln!("[poll-once] connected, waiting {wait}s for pushes");
    tokio::time::sleep(Duration::from_secs(wait)).await;
    summaries.extend(session.fetch_unread().await?);

    if summaries.is_empty() {
        println!("No new messages.");
    }
    for summary in &summaries {
        println!("[{}] {}: {}", summary.timestamp.format("%Y-%m-%d %H:%M:%S"), summary.sender, summary.preview);
    }

    let dropped = session.dropped_messages().await;
    if dropped > 0 {
        eprintln!("[poll-once] {dropped} message(s) dropped on full queues");
    }
    session.close().await;
    Ok(())
}
