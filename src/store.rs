use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::RwLock,
};

use chrono::{DateTime, SecondsFormat, Utc};
use log::warn;

use crate::PushError;

/// Last-seen timestamp per chat, used to filter unread messages.
pub trait LastSeenStore: Send + Sync {
    fn last_seen(&self, chat: &str) -> Option<DateTime<Utc>>;
    fn set_last_seen(&self, chat: &str, at: DateTime<Utc>) -> Result<(), PushError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    seen: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LastSeenStore for MemoryStore {
    fn last_seen(&self, chat: &str) -> Option<DateTime<Utc>> {
        self.seen.read().unwrap_or_else(|e| e.into_inner()).get(chat).copied()
    }

    fn set_last_seen(&self, chat: &str, at: DateTime<Utc>) -> Result<(), PushError> {
        if chat.is_empty() {
            return Err(PushError::EmptyChatId);
        }
        self.seen.write().unwrap_or_else(|e| e.into_inner()).insert(chat.to_string(), at);
        Ok(())
    }
}

/// JSON map of chat to RFC 3339 timestamp, rewritten on every update.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    seen: RwLock<BTreeMap<String, DateTime<Utc>>>,
}

impl FileStore {
    /// Opens the store at `path`. A missing file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PushError> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(PushError::Io(std::io::Error::new(ErrorKind::InvalidInput, "store path is empty")));
        }
        let seen = Self::load(&path)?;
        Ok(FileStore { path, seen: RwLock::new(seen) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<BTreeMap<String, DateTime<Utc>>, PushError> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let raw: BTreeMap<String, String> = serde_json::from_slice(&data)?;
        let mut seen = BTreeMap::new();
        for (chat, stamp) in raw {
            match DateTime::parse_from_rfc3339(&stamp) {
                Ok(parsed) => {
                    seen.insert(chat, parsed.with_timezone(&Utc));
                }
                Err(e) => warn!("Skipping unreadable last-seen entry for {chat}: {e}"),
            }
        }
        Ok(seen)
    }

    fn save(&self, seen: &BTreeMap<String, DateTime<Utc>>) -> Result<(), PushError> {
        let raw: BTreeMap<&str, String> = seen
            .iter()
            .map(|(chat, at)| (chat.as_str(), at.to_rfc3339_opts(SecondsFormat::Nanos, true)))
            .collect();
        let json = serde_json::to_vec_pretty(&raw)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut options = fs::OpenOptions::new();
        options.create(true).truncate(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        file.write_all(&json)?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

impl LastSeenStore for FileStore {
    fn last_seen(&self, chat: &str) -> Option<DateTime<Utc>> {
        self.seen.read().unwrap_or_else(|e| e.into_inner()).get(chat).copied()
    }

    fn set_last_seen(&self, chat: &str, at: DateTime<Utc>) -> Result<(), PushError> {
        if chat.is_empty() {
            return Err(PushError::EmptyChatId);
        }
        let mut seen = self.seen.write().unwrap_or_else(|e| e.into_inner());
        seen.insert(chat.to_string(), at);
        self.save(&seen)
    }
}
