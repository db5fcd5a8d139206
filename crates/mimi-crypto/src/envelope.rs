//! Wire format of one encrypted message.
//!
//! ```text
//! payload = base64(iv[12]) ":" base64(ciphertext || gcm_tag[16])
//! digest  = base64(sha256(plaintext)[32])
//! ```
//!
//! Standard base64 alphabet with padding on both fields. The digest is stored
//! as its own field next to the payload.
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

use mimi_types::WireEnvelope;

use crate::error::EnvelopeError;

/// AES-GCM nonce length in bytes.
pub const IV_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// SHA-256 digest length in bytes.
pub const DIGEST_LEN: usize = 32;

/// Separator between the iv and ciphertext halves of the payload.
pub const PAYLOAD_SEPARATOR: char = ':';

/// One encrypted message: nonce, ciphertext (tag appended) and plaintext digest.
///
/// Envelopes are never modified after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    iv: [u8; IV_LEN],
    ciphertext: Vec<u8>,
    digest: [u8; DIGEST_LEN],
}

impl Envelope {
    pub fn from_parts(iv: [u8; IV_LEN], ciphertext: Vec<u8>, digest: [u8; DIGEST_LEN]) -> Self {
        Self {
            iv,
            ciphertext,
            digest,
        }
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    /// Encode for the persistence sink.
    pub fn to_wire(&self) -> WireEnvelope {
        WireEnvelope {
            payload: format!(
                "{}{}{}",
                BASE64.encode(self.iv),
                PAYLOAD_SEPARATOR,
                BASE64.encode(&self.ciphertext)
            ),
            digest: BASE64.encode(self.digest),
        }
    }

    /// Strictly parse a stored envelope, digest included.
    pub fn from_wire(wire: &WireEnvelope) -> Result<Self, EnvelopeError> {
        let (iv, ciphertext) = parse_payload(&wire.payload)?;
        let digest = parse_digest(&wire.digest)?;
        Ok(Self {
            iv,
            ciphertext,
            digest,
        })
    }
}

/// Split and decode `base64(iv):base64(ciphertext)`.
pub(crate) fn parse_payload(payload: &str) -> Result<([u8; IV_LEN], Vec<u8>), EnvelopeError> {
    let (iv_b64, ct_b64) = payload
        .split_once(PAYLOAD_SEPARATOR)
        .ok_or(EnvelopeError::MissingSeparator)?;

    let iv_bytes = BASE64
        .decode(iv_b64)
        .map_err(|_| EnvelopeError::InvalidBase64 { field: "iv" })?;
    let iv: [u8; IV_LEN] =
        iv_bytes
            .try_into()
            .map_err(|bytes: Vec<u8>| EnvelopeError::InvalidIvLength {
                expected: IV_LEN,
                actual: bytes.len(),
            })?;

    let ciphertext = BASE64
        .decode(ct_b64)
        .map_err(|_| EnvelopeError::InvalidBase64 { field: "ciphertext" })?;

    Ok((iv, ciphertext))
}

pub(crate) fn parse_digest(digest: &str) -> Result<[u8; DIGEST_LEN], EnvelopeError> {
    let bytes = BASE64
        .decode(digest)
        .map_err(|_| EnvelopeError::InvalidBase64 { field: "digest" })?;
    bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| EnvelopeError::InvalidDigest {
            expected: DIGEST_LEN,
            actual: bytes.len(),
        })
}
