use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use log::{debug, info, warn};
use openssl::pkey::{PKey, Private};
use reqwest::{header, Client};
use serde::de::DeserializeOwned;

use super::{
    types::{DeviceAuthReq, DeviceAuthResp, RegisterReq, RegisterResp},
    IDSError,
};
use crate::util::{plist_to_string, sign_sha1};

pub const PROTOCOL_VERSION: &str = "1640";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const PLIST_CONTENT_TYPE: &str = "application/x-apple-plist";

#[derive(Debug, Clone)]
pub struct IdsEndpoints {
    pub register: String,
    pub authenticate_device: String,
}

impl Default for IdsEndpoints {
    fn default() -> Self {
        IdsEndpoints {
            register: "https://identity.ess.apple.com/WebObjects/TDIdentityService.woa/wa/register".to_string(),
            authenticate_device: "https://identity.ess.apple.com/WebObjects/TDIdentityService.woa/wa/authenticateDevice"
                .to_string(),
        }
    }
}

/// Bytes covered by the `x-push-sig` header.
pub fn signing_payload(method: &str, url: &str, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(method.len() + url.len() + body.len() + 2);
    payload.extend_from_slice(method.as_bytes());
    payload.push(b'\n');
    payload.extend_from_slice(url.as_bytes());
    payload.push(b'\n');
    payload.extend_from_slice(body);
    payload
}

/// Base64 SHA-1/RSA signature proving possession of the push key.
pub fn sign_request(key: &PKey<Private>, method: &str, url: &str, body: &[u8]) -> Result<String, IDSError> {
    let signature = sign_sha1(key, &signing_payload(method, url, body))?;
    Ok(STANDARD.encode(signature))
}

pub struct RegistrationClient {
    client: Client,
    endpoints: IdsEndpoints,
}

impl RegistrationClient {
    pub fn new() -> Result<Self, IDSError> {
        Self::with_endpoints(IdsEndpoints::default())
    }

    pub fn with_endpoints(endpoints: IdsEndpoints) -> Result<Self, IDSError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(RegistrationClient { client, endpoints })
    }

    pub fn endpoints(&self) -> &IdsEndpoints {
        &self.endpoints
    }

    /// Register the device's services. The request is signed with `push_key`
    /// and carries an empty push token, since none exists yet.
    pub async fn register(
        &self,
        request: &RegisterReq,
        push_key: &PKey<Private>,
        user_agent: &str,
    ) -> Result<RegisterResp, IDSError> {
        let url = &self.endpoints.register;
        let body = plist_to_string(request)?;
        let signature = sign_request(push_key, "POST", url, body.as_bytes())?;

        let builder = self
            .client
            .post(url)
            .header(header::USER_AGENT, user_agent)
            .header("x-push-sig", signature)
            .header("x-push-token", "");
        let resp: RegisterResp = self.send(builder, body).await?;

        match resp.retry_interval {
            Some(retry) if resp.status != 0 => warn!("IDS asked to retry registration in {retry}s"),
            _ => {}
        }
        IDSError::from_status(resp.status, resp.message.clone())?;
        info!("Registered {} service(s) with IDS", resp.services.as_ref().map_or(0, Vec::len));
        Ok(resp)
    }

    pub async fn authenticate_device(&self, request: &DeviceAuthReq) -> Result<DeviceAuthResp, IDSError> {
        let body = plist_to_string(request)?;
        let builder = self.client.post(&self.endpoints.authenticate_device);
        let resp: DeviceAuthResp = self.send(builder, body).await?;
        IDSError::from_status(resp.status, None)?;
        if resp.cert.is_none() {
            return Err(IDSError::MalformedResponse("authenticateDevice returned no certificate".into()));
        }
        Ok(resp)
    }

    async fn send<T: DeserializeOwned>(&self, builder: reqwest::RequestBuilder, body: String) -> Result<T, IDSError> {
        let resp = builder
            .header(header::CONTENT_TYPE, PLIST_CONTENT_TYPE)
            .header("X-Protocol-Version", PROTOCOL_VERSION)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        if status != reqwest::StatusCode::OK {
            let body = String::from_utf8_lossy(&bytes).into_owned();
            return Err(IDSError::HttpStatus { code: status.as_u16(), body });
        }
        debug!("IDS response: {} bytes", bytes.len());
        Ok(plist::from_bytes(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use openssl::{hash::MessageDigest, rsa::Rsa, sign::Verifier};

    use super::*;

    #[test]
    fn signing_payload_layout() {
        assert_eq!(signing_payload("POST", "https://x/y", b"<plist/>"), b"POST\nhttps://x/y\n<plist/>".to_vec());
    }

    #[test]
    fn request_signature_verifies_with_push_key() {
        let key = PKey::from_rsa(Rsa::generate(1280).unwrap()).unwrap();
        let url = IdsEndpoints::default().register;
        let sig = sign_request(&key, "POST", &url, b"body").unwrap();
        let raw = STANDARD.decode(sig).unwrap();

        let mut verifier = Verifier::new(MessageDigest::sha1(), &key).unwrap();
        verifier.update(&signing_payload("POST", &url, b"body")).unwrap();
        assert!(verifier.verify(&raw).unwrap());
    }
}
