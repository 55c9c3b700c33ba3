use std::path::PathBuf;

use thiserror::Error;

use crate::{aps::codec::FramingError, ids::IDSError, imessage::decrypt::DecryptError};

#[derive(Error, Debug)]
pub enum PushError {
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
    #[error("not connected to the courier")]
    NotConnected,
    #[error("courier identity has no usable device certificate")]
    MissingIdentity,
    #[error("unexpected response to connect: command {0}")]
    UnexpectedCommand(u8),
    #[error("connection rejected by courier, status {0:02x?}")]
    ConnectRejected(Vec<u8>),
    #[error("courier write did not complete within the deadline")]
    WriteTimeout,
    #[error("courier connection closed")]
    ConnectionClosed,
    #[error("inbound frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),
    #[error("invalid courier server name {0}")]
    InvalidServerName(String),
    #[error("registration data missing required fields")]
    InvalidRegistrationData,
    #[error("registration data expired")]
    RegistrationExpired,
    #[error("registration data not found: {}", .0.display())]
    MissingRegistration(PathBuf),
    #[error("chat identifier is empty")]
    EmptyChatId,
    #[error("message queue full")]
    QueueFull,
    #[error("IDS: {0}")]
    Ids(#[from] IDSError),
    #[error("decrypt: {0}")]
    Decrypt(#[from] DecryptError),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS: {0}")]
    Tls(#[from] rustls::Error),
    #[error("OpenSSL: {0}")]
    Openssl(#[from] openssl::error::ErrorStack),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("plist: {0}")]
    Plist(#[from] plist::Error),
}
