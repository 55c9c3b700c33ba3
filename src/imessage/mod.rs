pub mod decrypt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SERVICE_IMESSAGE: &str = "iMessage";
pub const DIRECT_CHAT: &str = "direct";
pub const UNKNOWN_SENDER: &str = "unknown";
pub const PLACEHOLDER_CHAT: &str = "unknown-chat";
pub const PLACEHOLDER_SENDER: &str = "unknown-sender";

/// Plaintext message document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecryptedMessage {
    #[serde(rename = "t", skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "s", skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(rename = "p", skip_serializing_if = "Vec::is_empty")]
    pub participants: Vec<String>,
    #[serde(rename = "gid", skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(rename = "v", skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(rename = "r", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Unit handed to pollers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub chat: String,
    pub sender: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub service: String,
}

fn fallback_id(at: DateTime<Utc>) -> String {
    format!("msg-{}", at.timestamp())
}

impl Message {
    /// Chat is the group id, else the first participant, else "direct".
    pub fn from_decrypted(msg: DecryptedMessage, received: DateTime<Utc>) -> Self {
        let first = msg.participants.first().filter(|p| !p.is_empty());
        let chat = non_empty(&msg.group_id).or(first.map(String::as_str)).unwrap_or(DIRECT_CHAT).to_string();
        let sender = first.cloned().unwrap_or_else(|| UNKNOWN_SENDER.to_string());
        let id = non_empty(&msg.message_id).map(str::to_string).unwrap_or_else(|| fallback_id(received));
        Message {
            id,
            chat,
            sender,
            text: msg.text.unwrap_or_default(),
            timestamp: received,
            service: SERVICE_IMESSAGE.to_string(),
        }
    }

    /// Stand-in for a push that could not be decrypted.
    pub fn placeholder(error: &dyn std::fmt::Display, payload_len: usize, received: DateTime<Utc>) -> Self {
        Message {
            id: fallback_id(received),
            chat: PLACEHOLDER_CHAT.to_string(),
            sender: PLACEHOLDER_SENDER.to_string(),
            text: format!("[Decrypt failed: {error}] {payload_len} bytes"),
            timestamp: received,
            service: SERVICE_IMESSAGE.to_string(),
        }
    }

    pub fn summary(&self) -> MessageSummary {
        MessageSummary { sender: self.sender.clone(), preview: self.text.clone(), timestamp: self.timestamp }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageSummary {
    pub sender: String,
    pub preview: String,
    pub timestamp: DateTime<Utc>,
}
