use async_trait::async_trait;
use chrono::Utc;
use log::{info, warn};
use openssl::x509::X509;

use crate::{
    aps::{topics::Topic, ConnectionState, CourierIdentity},
    config::{DeviceInfo, RegistrationData},
    ids::{
        http::RegistrationClient,
        identity::{generate_csr, self_signed_certificate, DeviceIdentity, IdsConfig, KeyGenerator, OpensslKeyGenerator},
        types::{
            ClientCapabilities, DeviceAuthData, DeviceAuthReq, PrivateDeviceData, RegisterReq, RegisterService,
            RegisterServiceUser, RegistrationCertificate, ServiceCapability,
        },
        IDSError,
    },
    PushError,
};

pub const DEVICE_NAME: &str = "imessage-client";
pub const LANGUAGE: &str = "en-US";
pub const MESSENGER_SUB_SERVICES: [Topic; 4] =
    [Topic::AlloyGameCenterIMessage, Topic::AlloySafetyMonitor, Topic::AlloyBiz, Topic::AlloySms];

/// Everything a session needs after registering.
#[derive(Clone)]
pub struct HandshakeState {
    pub validation_data: Vec<u8>,
    pub device_info: DeviceInfo,
    pub ids: IdsConfig,
    pub courier_identity: CourierIdentity,
    /// Empty until the courier assigns a token on connect.
    pub connection_state: ConnectionState,
}

#[async_trait]
pub trait Handshaker: Send + Sync {
    async fn handshake(&self, registration: &RegistrationData) -> Result<HandshakeState, PushError>;
}

/// Registration request for the Messenger service.
pub fn build_register_request(registration: &RegistrationData, ids: &IdsConfig) -> Result<RegisterReq, PushError> {
    let identity = &ids.identity;
    Ok(RegisterReq {
        device_name: DEVICE_NAME.to_string(),
        hardware_version: identity.hardware_version.clone(),
        language: LANGUAGE.to_string(),
        os_version: ids.ids_os_version(),
        software_version: identity.software_build_id.clone(),
        private_device_data: PrivateDeviceData {
            ap: Some("0".into()),
            dt: Some(1),
            gt: Some("0".into()),
            h: Some("1".into()),
            m: Some("0".into()),
            p: Some("0".into()),
            software_build: Some(identity.software_build_id.clone()),
            software_name: Some(identity.software_name.clone()),
            software_version: Some(identity.software_version.clone()),
            s: Some("0".into()),
            t: Some("0".into()),
            u: Some(identity.device_uuid.to_string().to_uppercase()),
            v: Some("1".into()),
            ..Default::default()
        },
        services: vec![RegisterService {
            capabilities: vec![ServiceCapability { flags: 1, name: "Messenger".into(), version: 1 }],
            service: Topic::Madrid.as_str().to_string(),
            sub_services: MESSENGER_SUB_SERVICES.iter().map(|t| t.as_str().to_string()).collect(),
            users: vec![RegisterServiceUser {
                client_data: ClientCapabilities::messenger(identity.public_identity()?),
                tag: None,
                uris: vec![],
                user_id: String::new(),
            }],
        }],
        validation_data: registration.validation_data.clone().into(),
    })
}

/// Generates fresh keys, registers them with IDS using the validation
/// data, and prepares the courier identity.
pub struct RegistrationHandshaker {
    client: RegistrationClient,
    keygen: Box<dyn KeyGenerator>,
}

impl RegistrationHandshaker {
    pub fn new() -> Result<Self, PushError> {
        Ok(Self::with_parts(RegistrationClient::new()?, Box::new(OpensslKeyGenerator)))
    }

    pub fn with_parts(client: RegistrationClient, keygen: Box<dyn KeyGenerator>) -> Self {
        RegistrationHandshaker { client, keygen }
    }

    /// Full authentication path: exchanges an auth token and a CSR over the
    /// auth key for a certificate bound to `realm_user_id`.
    pub async fn authenticate_device(
        &self,
        ids: &mut IdsConfig,
        realm_user_id: &str,
        auth_token: &str,
    ) -> Result<RegistrationCertificate, PushError> {
        let csr = generate_csr(&ids.identity.auth_key)?;
        let request = DeviceAuthReq {
            authentication_data: DeviceAuthData { auth_token: Some(auth_token.to_string()), ..Default::default() },
            csr: csr.to_der()?.into(),
            realm_user_id: realm_user_id.to_string(),
        };
        let resp = self.client.authenticate_device(&request).await?;
        let der: Vec<u8> = resp
            .cert
            .ok_or_else(|| IDSError::MalformedResponse("authenticateDevice returned no certificate".into()))?
            .into();
        let cert = RegistrationCertificate {
            profile_id: realm_user_id.to_string(),
            certificate: X509::from_der(&der)?,
            added: Utc::now(),
            refresh_needed: false,
        };
        ids.auth_id_cert_pairs.insert(realm_user_id.to_string(), cert.clone());
        info!("Authenticated device for {realm_user_id}");
        Ok(cert)
    }
}

#[async_trait]
impl Handshaker for RegistrationHandshaker {
    async fn handshake(&self, registration: &RegistrationData) -> Result<HandshakeState, PushError> {
        if registration.validation_data.is_empty() {
            return Err(PushError::InvalidRegistrationData);
        }

        let identity = DeviceIdentity::generate(self.keygen.as_ref(), &registration.device_info)?;
        let mut ids = IdsConfig::new(identity);
        info!("Registering {} ({}) with IDS", ids.identity.device_uuid, ids.ids_os_version());

        let request = build_register_request(registration, &ids)?;
        let resp = match self
            .client
            .register(&request, &ids.identity.push_key, &ids.identity.user_agent())
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                warn!("IDS registration failed: {e}");
                return Err(e.into());
            }
        };
        let certs = resp.certificates(&[Topic::Madrid.as_str()])?;
        ids.record_certificates(certs);
        info!("IDS registration succeeded for profile {}", ids.profile_id.as_deref().unwrap_or("<none>"));

        let push_key = ids.identity.push_key.clone();
        let certificate = self_signed_certificate(&push_key, &ids.identity.device_uuid)?;
        let courier_identity = CourierIdentity::new(push_key, certificate)?;

        Ok(HandshakeState {
            validation_data: registration.validation_data.clone(),
            device_info: registration.device_info.clone(),
            ids,
            courier_identity,
            connection_state: ConnectionState::default(),
        })
    }
}
