use std::{fs, io::ErrorKind, path::Path, time::Duration};

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::{util::base64_bytes, PushError};

/// Output of the external attestation step, as written by the registration provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationData {
    #[serde(with = "base64_bytes")]
    pub validation_data: Vec<u8>,
    pub valid_until: DateTime<Utc>,
    #[serde(default)]
    pub nacserv_commit: String,
    #[serde(default)]
    pub device_info: DeviceInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default)]
    pub hardware_version: String,
    #[serde(default)]
    pub software_name: String,
    #[serde(default)]
    pub software_version: String,
    #[serde(default)]
    pub software_build_id: String,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_device_id: Option<String>,
    #[serde(default)]
    pub hostname: String,
}

impl RegistrationData {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PushError> {
        let path = path.as_ref();
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(PushError::MissingRegistration(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.valid_until
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub host_count: u32,
    pub hostname: String,
    pub port: u16,
    pub alpn: String,
    /// Deadline for every outbound courier write, in seconds.
    pub write_deadline_secs: u64,
    /// Extra DER trust anchors on top of the webpki roots.
    #[serde(skip)]
    pub extra_roots: Vec<Vec<u8>>,
}

impl Default for CourierConfig {
    fn default() -> Self {
        CourierConfig {
            host_count: crate::aps::COURIER_HOST_COUNT,
            hostname: crate::aps::COURIER_HOSTNAME.to_string(),
            port: crate::aps::COURIER_PORT,
            alpn: crate::aps::COURIER_ALPN.to_string(),
            write_deadline_secs: crate::aps::WRITE_DEADLINE.as_secs(),
            extra_roots: vec![],
        }
    }
}

impl CourierConfig {
    /// Numbered shard host, e.g. `17-courier.push.apple.com`.
    pub fn host_for(&self, shard: u32) -> String {
        format!("{}-{}", shard, self.hostname)
    }

    pub fn write_deadline(&self) -> Duration {
        Duration::from_secs(self.write_deadline_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Decrypted messages waiting for the next poll. Overflow is dropped.
    pub message_queue_capacity: usize,
    /// Raw pushes waiting for decryption.
    pub notification_queue_capacity: usize,
    /// Emit a placeholder message when a push cannot be decrypted.
    pub placeholder_on_decrypt_failure: bool,
    /// Seed for courier host and nonce selection; entropy when unset.
    pub rng_seed: Option<u64>,
    pub courier: CourierConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            message_queue_capacity: 64,
            notification_queue_capacity: 64,
            placeholder_on_decrypt_failure: true,
            rng_seed: None,
            courier: CourierConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PushError> {
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

pub fn init_logger() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    if pretty_env_logger::try_init().is_ok() {
        info!("Logger initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_json_parses() {
        let json = r#"{
            "validation_data": "AQIDBA==",
            "valid_until": "2030-01-01T00:00:00Z",
            "nacserv_commit": "abc123",
            "device_info": {
                "hardware_version": "Macmini9,1",
                "software_name": "macOS",
                "software_version": "14.2",
                "software_build_id": "23C64",
                "serial_number": "C02XXXXX",
                "hostname": "mini.local"
            }
        }"#;
        let reg: RegistrationData = serde_json::from_str(json).unwrap();
        assert_eq!(reg.validation_data, vec![1, 2, 3, 4]);
        assert_eq!(reg.device_info.hardware_version, "Macmini9,1");
        assert!(reg.device_info.unique_device_id.is_none());
        assert!(!reg.is_expired());
    }

    #[test]
    fn missing_file_is_distinct() {
        let err = RegistrationData::load("/nonexistent/registration.json").unwrap_err();
        assert!(matches!(err, PushError::MissingRegistration(_)));
    }

    #[test]
    fn session_config_defaults_fill_gaps() {
        let config: SessionConfig = serde_json::from_str(r#"{"rng_seed": 7}"#).unwrap();
        assert_eq!(config.rng_seed, Some(7));
        assert_eq!(config.message_queue_capacity, 64);
        assert_eq!(config.courier.port, 5223);
        assert_eq!(config.courier.host_for(3), "3-courier.push.apple.com");
        assert_eq!(config.courier.write_deadline(), Duration::from_secs(30));

        let config: SessionConfig = serde_json::from_str(r#"{"courier": {"write_deadline_secs": 5}}"#).unwrap();
        assert_eq!(config.courier.write_deadline(), Duration::from_secs(5));
        assert_eq!(config.courier.alpn, "apns-security-v3");
    }
}
