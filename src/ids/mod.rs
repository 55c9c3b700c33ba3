pub mod http;
pub mod identity;
pub mod types;

use std::fmt;

use thiserror::Error;

/// Status codes returned inside IDS response documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IDSStatus {
    Success,
    /// Two-factor authentication required.
    Unauthenticated,
    InvalidNameOrPassword,
    ActionRefreshCredentials,
    WebTunnelServiceResponseTooLarge,
    Unknown(u64),
}

impl IDSStatus {
    pub fn code(self) -> u64 {
        match self {
            IDSStatus::Success => 0,
            IDSStatus::Unauthenticated => 6004,
            IDSStatus::InvalidNameOrPassword => 6014,
            IDSStatus::ActionRefreshCredentials => 6030,
            IDSStatus::WebTunnelServiceResponseTooLarge => 6054,
            IDSStatus::Unknown(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == IDSStatus::Success
    }
}

impl From<u64> for IDSStatus {
    fn from(code: u64) -> Self {
        match code {
            0 => IDSStatus::Success,
            6004 => IDSStatus::Unauthenticated,
            6014 => IDSStatus::InvalidNameOrPassword,
            6030 => IDSStatus::ActionRefreshCredentials,
            6054 => IDSStatus::WebTunnelServiceResponseTooLarge,
            other => IDSStatus::Unknown(other),
        }
    }
}

impl fmt::Display for IDSStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IDSStatus::Success => f.write_str("success"),
            IDSStatus::Unauthenticated => f.write_str("unauthenticated (2FA required)"),
            IDSStatus::InvalidNameOrPassword => f.write_str("invalid credentials"),
            IDSStatus::ActionRefreshCredentials => f.write_str("refresh credentials required"),
            IDSStatus::WebTunnelServiceResponseTooLarge => f.write_str("response too large"),
            IDSStatus::Unknown(code) => write!(f, "unknown({})", code),
        }
    }
}

#[derive(Error, Debug)]
pub enum IDSError {
    #[error("IDS returned status {status}{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    Status { status: IDSStatus, message: Option<String> },
    #[error("malformed IDS response: {0}")]
    MalformedResponse(String),
    #[error("IDS request failed with HTTP {code}: {body}")]
    HttpStatus { code: u16, body: String },
    #[error("HTTP transport: {0}")]
    Http(#[from] reqwest::Error),
    #[error("plist: {0}")]
    Plist(#[from] plist::Error),
    #[error("OpenSSL: {0}")]
    Openssl(#[from] openssl::error::ErrorStack),
}

impl IDSError {
    pub fn status(&self) -> Option<IDSStatus> {
        match self {
            IDSError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_two_factor_required(&self) -> bool {
        self.status() == Some(IDSStatus::Unauthenticated)
    }

    pub(crate) fn from_status(code: u64, message: Option<String>) -> Result<(), IDSError> {
        let status = IDSStatus::from(code);
        if status.is_success() {
            Ok(())
        } else {
            Err(IDSError::Status { status, message })
        }
    }
}
