use std::collections::HashMap;

use chrono::{DateTime, Utc};
use openssl::x509::X509;
use plist::Data;
use serde::{Deserialize, Serialize};

use super::IDSError;

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct RegisterReq {
    pub device_name: String,
    pub hardware_version: String,
    pub language: String,
    pub os_version: String,
    pub software_version: String,
    pub private_device_data: PrivateDeviceData,
    pub services: Vec<RegisterService>,
    pub validation_data: Data,
}

/// Device metadata block (`private-device-data`). Short keys are what IDS expects.
#[derive(Serialize, Debug, Clone, Default)]
pub struct PrivateDeviceData {
    /// "0" on mac, "1" on iPhone/iPad.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ap: Option<String>,
    /// Seconds since the Apple epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    /// Device type: 1 mac, 2 iPhone, 4 iPad.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub h: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub m: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<String>,
    #[serde(rename = "pb", skip_serializing_if = "Option::is_none")]
    pub software_build: Option<String>,
    #[serde(rename = "pn", skip_serializing_if = "Option::is_none")]
    pub software_name: Option<String>,
    #[serde(rename = "pv", skip_serializing_if = "Option::is_none")]
    pub software_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub u: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct RegisterService {
    pub capabilities: Vec<ServiceCapability>,
    pub service: String,
    pub sub_services: Vec<String>,
    pub users: Vec<RegisterServiceUser>,
}

#[derive(Serialize, Debug, Clone)]
pub struct ServiceCapability {
    pub flags: u32,
    pub name: String,
    pub version: u32,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct RegisterServiceUser {
    pub client_data: ClientCapabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub uris: Vec<RegisterHandle>,
    pub user_id: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct RegisterHandle {
    pub uri: String,
}

/// Version of the capability set below. Bump when fields are added.
pub const CLIENT_CAPABILITIES_VERSION: u32 = 1;

/// Capability flags advertised in `client-data`. This is a closed set; new
/// capabilities are added as fields here.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ClientCapabilities {
    pub supports_ack_v1: bool,
    pub supports_activity_sharing_v1: bool,
    pub supports_audio_messaging_v2: bool,
    pub supports_autoloopvideo_v1: bool,
    pub supports_be_v1: bool,
    pub supports_ca_v1: bool,
    pub supports_fsm_v1: bool,
    pub supports_fsm_v2: bool,
    pub supports_fsm_v3: bool,
    pub supports_ii_v1: bool,
    pub supports_impact_v1: bool,
    pub supports_inline_attachments: bool,
    pub supports_keep_receipts: bool,
    pub supports_location_sharing: bool,
    pub supports_media_v2: bool,
    pub supports_photos_extension_v1: bool,
    pub supports_st_v1: bool,
    pub supports_update_attachments_v1: bool,
    pub supports_people_request_messages: bool,
    pub supports_people_request_messages_v2: bool,
    pub supports_people_request_messages_v3: bool,
    pub supports_rem: bool,
    pub supports_animoji_v2: bool,
    pub supports_certified_delivery_v1: bool,
    pub supports_dnd_v1: bool,
    pub supports_heif: bool,
    pub supports_hdr: bool,
    pub supports_emoji_tapbacks: bool,
    pub supports_send_later_messages: bool,
    pub supports_original_timestamp_v1: bool,
    pub nicknames_version: u32,
    pub public_message_identity_key: Data,
    pub public_message_identity_version: u32,
}

impl ClientCapabilities {
    /// Capabilities of a receive-only macOS Messages client.
    pub fn messenger(public_identity: Vec<u8>) -> Self {
        ClientCapabilities {
            supports_ack_v1: true,
            supports_activity_sharing_v1: true,
            supports_audio_messaging_v2: true,
            supports_autoloopvideo_v1: true,
            supports_be_v1: true,
            supports_ca_v1: true,
            supports_fsm_v1: true,
            supports_fsm_v2: true,
            supports_fsm_v3: true,
            supports_ii_v1: true,
            supports_impact_v1: true,
            supports_inline_attachments: true,
            supports_keep_receipts: true,
            supports_location_sharing: true,
            supports_media_v2: true,
            supports_photos_extension_v1: true,
            supports_st_v1: true,
            supports_update_attachments_v1: true,
            supports_people_request_messages: true,
            supports_people_request_messages_v2: true,
            supports_people_request_messages_v3: true,
            supports_rem: true,
            supports_animoji_v2: true,
            supports_certified_delivery_v1: true,
            supports_dnd_v1: true,
            supports_heif: true,
            supports_hdr: true,
            supports_emoji_tapbacks: true,
            supports_send_later_messages: true,
            supports_original_timestamp_v1: true,
            nicknames_version: 1,
            public_message_identity_key: public_identity.into(),
            public_message_identity_version: 2,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct RegisterResp {
    pub message: Option<String>,
    pub status: u64,
    pub services: Option<Vec<RegisterRespService>>,
    pub retry_interval: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct RegisterRespService {
    pub service: Option<String>,
    pub users: Option<Vec<RegisterRespServiceUser>>,
    pub status: u64,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct RegisterRespServiceUser {
    pub uris: Vec<RespHandle>,
    pub user_id: Option<String>,
    pub cert: Option<Data>,
    pub status: u64,
    pub alert: Option<RegisterRespAlert>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct RespHandle {
    pub uri: String,
    pub status: u64,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct RegisterRespAlert {
    pub body: String,
    pub button: String,
    pub title: String,
    pub action: Option<RegisterRespAlertAction>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct RegisterRespAlertAction {
    pub button: String,
    #[serde(rename = "type")]
    pub action_type: u64,
    pub url: String,
}

/// Identity certificate issued for one registered profile.
#[derive(Debug, Clone)]
pub struct RegistrationCertificate {
    pub profile_id: String,
    pub certificate: X509,
    pub added: DateTime<Utc>,
    pub refresh_needed: bool,
}

impl RegisterResp {
    /// Certificates for every requested service, keyed by profile id.
    ///
    /// Missing services, users or certificates are reported as
    /// [`IDSError::MalformedResponse`]; non-zero per-entry statuses as
    /// [`IDSError::Status`].
    pub fn certificates(
        &self,
        requested_services: &[&str],
    ) -> Result<HashMap<String, RegistrationCertificate>, IDSError> {
        let services = self
            .services
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| IDSError::MalformedResponse("no services in registration response".into()))?;

        let mut out = HashMap::new();
        let now = Utc::now();
        for (index, wanted) in requested_services.iter().enumerate() {
            let service = services
                .iter()
                .find(|s| s.service.as_deref() == Some(*wanted))
                .or_else(|| services.get(index).filter(|s| s.service.is_none()))
                .ok_or_else(|| IDSError::MalformedResponse(format!("service {wanted} missing from response")))?;
            IDSError::from_status(service.status, self.message.clone())?;

            let users = service
                .users
                .as_deref()
                .filter(|u| !u.is_empty())
                .ok_or_else(|| IDSError::MalformedResponse(format!("no users for service {wanted}")))?;
            for user in users {
                let message = user.alert.as_ref().map(|a| a.body.clone());
                IDSError::from_status(user.status, message)?;
                let profile_id = user
                    .user_id
                    .clone()
                    .ok_or_else(|| IDSError::MalformedResponse("user entry without user-id".into()))?;
                let der: Vec<u8> = user
                    .cert
                    .clone()
                    .ok_or_else(|| IDSError::MalformedResponse(format!("no ID certificate for {profile_id}")))?
                    .into();
                let certificate = X509::from_der(&der)?;
                out.insert(
                    profile_id.clone(),
                    RegistrationCertificate { profile_id, certificate, added: now, refresh_needed: false },
                );
            }
        }
        Ok(out)
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct DeviceAuthReq {
    pub authentication_data: DeviceAuthData,
    pub csr: Data,
    pub realm_user_id: String,
}

#[derive(Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct DeviceAuthData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_token: Option<Data>,
    #[serde(rename = "sigs", skip_serializing_if = "Option::is_none")]
    pub signatures: Option<Vec<Data>>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct DeviceAuthResp {
    pub status: u64,
    pub cert: Option<Data>,
}

#[cfg(test)]
mod tests {
    use openssl::{
        asn1::Asn1Time,
        hash::MessageDigest,
        pkey::PKey,
        rsa::Rsa,
        x509::{X509Builder, X509NameBuilder},
    };

    use super::*;
    use crate::ids::IDSStatus;

    fn test_cert_der() -> Vec<u8> {
        let key = PKey::from_rsa(Rsa::generate(1024).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "test").unwrap();
        let name = name.build();
        let mut builder = X509Builder::new().unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        builder.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        builder.build().to_der().unwrap()
    }

    fn response_plist(user: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>status</key><integer>0</integer>
    <key>services</key>
    <array>
        <dict>
            <key>service</key><string>com.apple.madrid</string>
            <key>status</key><integer>0</integer>
            <key>users</key><array>{user}</array>
        </dict>
    </array>
</dict>
</plist>"#
        )
    }

    #[test]
    fn certificate_extracted_by_profile() {
        let der = plist::Value::Data(test_cert_der());
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &der).unwrap();
        let xml = String::from_utf8(buf).unwrap();
        let start = xml.find("<data>").unwrap();
        let end = xml.find("</data>").unwrap() + "</data>".len();
        let user = format!(
            "<dict><key>user-id</key><string>D:abc</string><key>status</key><integer>0</integer><key>cert</key>{}</dict>",
            &xml[start..end]
        );
        let resp: RegisterResp = plist::from_bytes(response_plist(&user).as_bytes()).unwrap();
        let certs = resp.certificates(&["com.apple.madrid"]).unwrap();
        let entry = &certs["D:abc"];
        assert_eq!(entry.profile_id, "D:abc");
        assert!(!entry.refresh_needed);
    }

    #[test]
    fn missing_certificate_is_malformed() {
        let user = "<dict><key>user-id</key><string>D:abc</string><key>status</key><integer>0</integer></dict>";
        let resp: RegisterResp = plist::from_bytes(response_plist(user).as_bytes()).unwrap();
        assert!(matches!(
            resp.certificates(&["com.apple.madrid"]),
            Err(IDSError::MalformedResponse(_))
        ));
    }

    #[test]
    fn missing_users_or_services_is_malformed() {
        let resp: RegisterResp = plist::from_bytes(response_plist("").as_bytes()).unwrap();
        assert!(matches!(
            resp.certificates(&["com.apple.madrid"]),
            Err(IDSError::MalformedResponse(_))
        ));
        assert!(matches!(
            RegisterResp::default().certificates(&["com.apple.madrid"]),
            Err(IDSError::MalformedResponse(_))
        ));
        assert!(matches!(
            resp.certificates(&["com.apple.private.alloy.sms"]),
            Err(IDSError::MalformedResponse(_))
        ));
    }

    #[test]
    fn user_status_surfaces_as_typed_error() {
        let user = "<dict><key>user-id</key><string>D:abc</string><key>status</key><integer>6030</integer></dict>";
        let resp: RegisterResp = plist::from_bytes(response_plist(user).as_bytes()).unwrap();
        let err = resp.certificates(&["com.apple.madrid"]).unwrap_err();
        assert_eq!(err.status(), Some(IDSStatus::ActionRefreshCredentials));
    }

    #[test]
    fn capabilities_serialize_as_kebab_keys() {
        let caps = ClientCapabilities::messenger(vec![1, 2, 3]);
        let value = plist::to_value(&caps).unwrap();
        let dict = value.as_dictionary().unwrap();
        assert_eq!(dict.get("supports-ack-v1").and_then(|v| v.as_boolean()), Some(true));
        assert_eq!(dict.get("public-message-identity-version").and_then(|v| v.as_unsigned_integer()), Some(2));
        assert_eq!(dict.get("public-message-identity-key").and_then(|v| v.as_data()), Some(&[1u8, 2, 3][..]));
        assert!(dict.len() >= 30);
    }
}
