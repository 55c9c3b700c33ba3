use std::fmt;

use openssl::{
    error::ErrorStack,
    pkey::{PKey, Private},
    rsa::Padding,
    symm::{decrypt, Cipher},
};
use thiserror::Error;

use super::DecryptedMessage;
use crate::util::ungzip;

/// Size of the RSA-OAEP block at the front of a pair body.
pub const RSA_BLOCK_LEN: usize = 160;
pub const AES_KEY_LEN: usize = 16;
const ZERO_IV: [u8; 16] = [0; 16];
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptStage {
    ParseBody,
    Decrypt,
    Decompress,
    Decode,
}

impl fmt::Display for DecryptStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DecryptStage::ParseBody => "failed to parse body",
            DecryptStage::Decrypt => "failed to decrypt",
            DecryptStage::Decompress => "failed to decompress",
            DecryptStage::Decode => "failed to decode message",
        })
    }
}

#[derive(Error, Debug)]
pub enum DecryptError {
    #[error("too short payload (missing header, expected >4, got {0})")]
    MissingHeader(usize),
    #[error("too short payload (missing body, expected >{expected}, got {got})")]
    MissingBody { expected: usize, got: usize },
    #[error("too short payload (missing signature, expected {expected}, got {got})")]
    MissingSignature { expected: usize, got: usize },
    #[error("too short payload (missing encryption key, expected >160, got {0})")]
    MissingEncryptionKey(usize),
    #[error("decrypted key block holds {0} bytes, less than an AES key")]
    ShortKeyBlock(usize),
    #[error("failed to decrypt encryption key: {0}")]
    Rsa(#[source] ErrorStack),
    #[error("AES-CTR: {0}")]
    Aes(#[source] ErrorStack),
    #[error("gunzip: {0}")]
    Gunzip(#[source] std::io::Error),
    #[error("plist: {0}")]
    Plist(#[source] plist::Error),
    #[error("{stage}: {source}")]
    Stage {
        stage: DecryptStage,
        #[source]
        source: Box<DecryptError>,
    },
}

impl DecryptError {
    fn in_stage(self, stage: DecryptStage) -> DecryptError {
        DecryptError::Stage { stage, source: Box::new(self) }
    }

    /// The failing stage, when known.
    pub fn stage(&self) -> Option<DecryptStage> {
        match self {
            DecryptError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Innermost error, without stage context.
    pub fn root(&self) -> &DecryptError {
        match self {
            DecryptError::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

/// `[tag:1][bodyLen:2][body][sigLen:1][sig]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEnvelope<'a> {
    pub tag: u8,
    pub body: &'a [u8],
    pub signature: &'a [u8],
}

pub fn parse_body(payload: &[u8]) -> Result<EncryptedEnvelope<'_>, DecryptError> {
    if payload.len() < 4 {
        return Err(DecryptError::MissingHeader(payload.len()));
    }
    let tag = payload[0];
    let body_len = u16::from_be_bytes([payload[1], payload[2]]) as usize;

    let expected = 3 + body_len + 1;
    if payload.len() < expected {
        return Err(DecryptError::MissingBody { expected, got: payload.len() });
    }
    let body = &payload[3..3 + body_len];
    let sig_len = payload[3 + body_len] as usize;

    let expected = expected + sig_len;
    if payload.len() < expected {
        return Err(DecryptError::MissingSignature { expected, got: payload.len() });
    }
    // Everything after the length byte belongs to the signature.
    let signature = &payload[3 + body_len + 1..];
    Ok(EncryptedEnvelope { tag, body, signature })
}

/// Reverses the "pair" scheme: RSA-OAEP(SHA-1) over the first 160 bytes
/// yields the AES key and the head of the ciphertext, the rest of the body
/// is its tail. The whole stream is AES-128-CTR with a zero IV.
pub fn decrypt_pair_payload(key: &PKey<Private>, body: &[u8]) -> Result<Vec<u8>, DecryptError> {
    if body.len() < RSA_BLOCK_LEN {
        return Err(DecryptError::MissingEncryptionKey(body.len()));
    }
    let (rsa_block, tail) = body.split_at(RSA_BLOCK_LEN);

    let rsa = key.rsa().map_err(DecryptError::Rsa)?;
    let mut block = vec![0u8; rsa.size() as usize];
    let len = rsa.private_decrypt(rsa_block, &mut block, Padding::PKCS1_OAEP).map_err(DecryptError::Rsa)?;
    block.truncate(len);
    if block.len() < AES_KEY_LEN {
        return Err(DecryptError::ShortKeyBlock(block.len()));
    }

    let mut ciphertext = block.split_off(AES_KEY_LEN);
    ciphertext.extend_from_slice(tail);
    decrypt(Cipher::aes_128_ctr(), &block, Some(&ZERO_IV), &ciphertext).map_err(DecryptError::Aes)
}

/// Decompresses `data` if it carries the gzip magic, otherwise returns it unchanged.
pub fn maybe_gunzip(data: Vec<u8>) -> Result<Vec<u8>, DecryptError> {
    if !data.starts_with(&GZIP_MAGIC) {
        return Ok(data);
    }
    ungzip(&data).map_err(DecryptError::Gunzip)
}

pub fn decrypt_message(key: &PKey<Private>, payload: &[u8]) -> Result<DecryptedMessage, DecryptError> {
    let envelope = parse_body(payload).map_err(|e| e.in_stage(DecryptStage::ParseBody))?;
    let plain = decrypt_pair_payload(key, envelope.body).map_err(|e| e.in_stage(DecryptStage::Decrypt))?;
    let plain = maybe_gunzip(plain).map_err(|e| e.in_stage(DecryptStage::Decompress))?;
    plist::from_bytes(&plain).map_err(|e| DecryptError::Plist(e).in_stage(DecryptStage::Decode))
}

/// Holds the device encryption key for repeated decryption.
#[derive(Clone)]
pub struct Decryptor {
    key: PKey<Private>,
}

impl Decryptor {
    pub fn new(key: PKey<Private>) -> Self {
        Decryptor { key }
    }

    pub fn decrypt(&self, payload: &[u8]) -> Result<DecryptedMessage, DecryptError> {
        decrypt_message(&self.key, payload)
    }
}
