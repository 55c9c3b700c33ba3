use std::collections::HashMap;

use chrono::{DateTime, Utc};
use openssl::{
    asn1::Asn1Time,
    bn::{BigNum, BigNumContext, MsbOption},
    ec::{EcGroup, EcKey, PointConversionForm},
    error::ErrorStack,
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{X509Builder, X509NameBuilder, X509Req, X509ReqBuilder, X509},
};
use uuid::Uuid;

use super::types::RegistrationCertificate;
use crate::{config::DeviceInfo, util::encode_hex};

pub const DEFAULT_HARDWARE_VERSION: &str = "MacBookPro18,1";
pub const DEFAULT_SOFTWARE_NAME: &str = "macOS";
pub const DEFAULT_SOFTWARE_VERSION: &str = "13.4.1";
pub const DEFAULT_SOFTWARE_BUILD_ID: &str = "22F82";

pub const SIGNING_KEY_CURVE: Nid = Nid::X9_62_PRIME256V1;
pub const ENCRYPTION_KEY_BITS: u32 = 1280;
pub const PUSH_KEY_BITS: u32 = 1280;
pub const AUTH_KEY_BITS: u32 = 2048;

/// Source of key material and device identifiers.
pub trait KeyGenerator: Send + Sync {
    fn rsa(&self, bits: u32) -> Result<PKey<Private>, ErrorStack>;
    fn p256(&self) -> Result<PKey<Private>, ErrorStack>;
    fn device_uuid(&self) -> Uuid;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OpensslKeyGenerator;

impl KeyGenerator for OpensslKeyGenerator {
    fn rsa(&self, bits: u32) -> Result<PKey<Private>, ErrorStack> {
        PKey::from_rsa(Rsa::generate(bits)?)
    }

    fn p256(&self) -> Result<PKey<Private>, ErrorStack> {
        let group = EcGroup::from_curve_name(SIGNING_KEY_CURVE)?;
        PKey::from_ec_key(EcKey::generate(&group)?)
    }

    fn device_uuid(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Key material and descriptor strings for one registered device.
/// Regenerated on every handshake.
#[derive(Clone)]
pub struct DeviceIdentity {
    pub signing_key: PKey<Private>,
    pub encryption_key: PKey<Private>,
    pub push_key: PKey<Private>,
    pub auth_key: PKey<Private>,
    pub device_uuid: Uuid,
    pub hardware_version: String,
    pub software_name: String,
    pub software_version: String,
    pub software_build_id: String,
}

fn or_default(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

impl DeviceIdentity {
    pub fn generate(keygen: &dyn KeyGenerator, info: &DeviceInfo) -> Result<Self, ErrorStack> {
        Ok(DeviceIdentity {
            signing_key: keygen.p256()?,
            encryption_key: keygen.rsa(ENCRYPTION_KEY_BITS)?,
            push_key: keygen.rsa(PUSH_KEY_BITS)?,
            auth_key: keygen.rsa(AUTH_KEY_BITS)?,
            device_uuid: keygen.device_uuid(),
            hardware_version: or_default(&info.hardware_version, DEFAULT_HARDWARE_VERSION),
            software_name: or_default(&info.software_name, DEFAULT_SOFTWARE_NAME),
            software_version: or_default(&info.software_version, DEFAULT_SOFTWARE_VERSION),
            software_build_id: or_default(&info.software_build_id, DEFAULT_SOFTWARE_BUILD_ID),
        })
    }

    /// `public-message-identity-key`: a DER SEQUENCE holding the signing
    /// point under `[1]` and the encryption key under `[2]`, each prefixed by
    /// its 16-bit length.
    pub fn public_identity(&self) -> Result<Vec<u8>, ErrorStack> {
        let ec = self.signing_key.ec_key()?;
        let mut ctx = BigNumContext::new()?;
        let point = ec.public_key().to_bytes(ec.group(), PointConversionForm::UNCOMPRESSED, &mut ctx)?;
        let rsa = self.encryption_key.rsa()?.public_key_to_der_pkcs1()?;

        let mut body = der_tlv(0x81, &length_prefixed(&point));
        body.extend(der_tlv(0x82, &length_prefixed(&rsa)));
        Ok(der_tlv(0x30, &body))
    }

    pub fn user_agent(&self) -> String {
        format!("com.apple.invitation-registration [{}]", self.software_build_id)
    }
}

fn length_prefixed(value: &[u8]) -> Vec<u8> {
    let mut out = (value.len() as u16).to_be_bytes().to_vec();
    out.extend_from_slice(value);
    out
}

fn der_tlv(tag: u8, value: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = value.len();
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xff {
        out.extend_from_slice(&[0x81, len as u8]);
    } else {
        out.push(0x82);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    }
    out.extend_from_slice(value);
    out
}

/// CSR for `authenticateDevice`, with a random 20-byte hex common name.
pub fn generate_csr(key: &PKey<Private>) -> Result<X509Req, ErrorStack> {
    let mut cn = [0u8; 20];
    openssl::rand::rand_bytes(&mut cn)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, &encode_hex(&cn))?;
    let name = name.build();

    let mut req = X509ReqBuilder::new()?;
    req.set_subject_name(&name)?;
    req.set_pubkey(key)?;
    req.sign(key, MessageDigest::sha256())?;
    Ok(req.build())
}

/// Device certificate presented to the courier, self-signed over the push key.
pub fn self_signed_certificate(key: &PKey<Private>, device_uuid: &Uuid) -> Result<X509, ErrorStack> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, &device_uuid.to_string().to_uppercase())?;
    let name = name.build();

    let mut serial = BigNum::new()?;
    serial.rand(64, MsbOption::MAYBE_ZERO, false)?;

    let serial = serial.to_asn1_integer()?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(365)?;

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(key)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Registration outcome for one device.
#[derive(Clone)]
pub struct IdsConfig {
    pub identity: DeviceIdentity,
    pub profile_id: Option<String>,
    pub auth_id_cert_pairs: HashMap<String, RegistrationCertificate>,
    pub id_registered_at: Option<DateTime<Utc>>,
}

impl IdsConfig {
    pub fn new(identity: DeviceIdentity) -> Self {
        IdsConfig { identity, profile_id: None, auth_id_cert_pairs: HashMap::new(), id_registered_at: None }
    }

    pub fn ids_os_version(&self) -> String {
        format!(
            "{},{},{}",
            self.identity.software_name, self.identity.software_version, self.identity.software_build_id
        )
    }

    pub fn record_certificates(&mut self, certs: HashMap<String, RegistrationCertificate>) {
        if self.profile_id.is_none() {
            self.profile_id = certs.keys().min().cloned();
        }
        self.auth_id_cert_pairs.extend(certs);
        self.id_registered_at = Some(Utc::now());
    }

    pub fn mark_refresh_needed(&mut self) {
        for cert in self.auth_id_cert_pairs.values_mut() {
            cert.refresh_needed = true;
        }
    }

    pub fn certificate(&self, profile_id: &str) -> Option<&RegistrationCertificate> {
        self.auth_id_cert_pairs.get(profile_id)
    }
}
