use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use sha2::{Digest, Sha256};
use tracing::trace;

use mimi_types::WireEnvelope;

use crate::envelope::{DIGEST_LEN, Envelope, IV_LEN, parse_digest, parse_payload};
use crate::error::EncryptionError;
use crate::keys::DerivedKey;

/// Outcome of decrypting one envelope.
///
/// Both failure kinds are ordinary values, never errors: one bad message must
/// not stop the rest of a room from rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum DecryptResult {
    /// AEAD tag verified and the plaintext digest matched.
    Plaintext(String),
    /// AEAD tag verified but the stored digest does not match the plaintext.
    /// The stored record was altered or corrupted outside the cipher.
    IntegrityFailure,
    /// Wrong key, corrupted nonce/ciphertext or malformed payload.
    DecryptionFailure,
}

impl DecryptResult {
    pub fn plaintext(&self) -> Option<&str> {
        match self {
            Self::Plaintext(text) => Some(text),
            _ => None,
        }
    }
}

fn cipher_for(key: &DerivedKey) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()))
}

fn plaintext_digest(plaintext: &[u8]) -> [u8; DIGEST_LEN] {
    Sha256::digest(plaintext).into()
}

/// Encrypt a plaintext message with AES-256-GCM under a fresh random nonce.
pub fn encrypt_message(key: &DerivedKey, plaintext: &str) -> Result<Envelope, EncryptionError> {
    let cipher = cipher_for(key);

    let mut iv = [0u8; IV_LEN];
    OsRng
        .try_fill_bytes(&mut iv)
        .map_err(|e| EncryptionError::Entropy(e.to_string()))?;
    let nonce = Nonce::from_slice(&iv);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| EncryptionError::Cipher(e.to_string()))?;

    let digest = plaintext_digest(plaintext.as_bytes());

    Ok(Envelope::from_parts(iv, ciphertext, digest))
}

/// Decrypt a parsed envelope and check its plaintext digest.
pub fn decrypt_message(key: &DerivedKey, envelope: &Envelope) -> DecryptResult {
    open(key, envelope.iv(), envelope.ciphertext(), Some(envelope.digest()))
}

/// Decrypt an envelope straight from its stored wire form.
///
/// A payload that cannot be parsed is a decryption failure. A digest that
/// cannot be parsed only surfaces once the ciphertext itself authenticates,
/// and then as an integrity failure.
pub fn decrypt_wire(key: &DerivedKey, wire: &WireEnvelope) -> DecryptResult {
    let (iv, ciphertext) = match parse_payload(&wire.payload) {
        Ok(parts) => parts,
        Err(e) => {
            trace!("Unparseable payload: {}", e);
            return DecryptResult::DecryptionFailure;
        }
    };

    let digest = match parse_digest(&wire.digest) {
        Ok(digest) => Some(digest),
        Err(e) => {
            trace!("Unparseable digest: {}", e);
            None
        }
    };

    open(key, &iv, &ciphertext, digest.as_ref())
}

fn open(
    key: &DerivedKey,
    iv: &[u8; IV_LEN],
    ciphertext: &[u8],
    expected_digest: Option<&[u8; DIGEST_LEN]>,
) -> DecryptResult {
    let cipher = cipher_for(key);
    let nonce = Nonce::from_slice(iv);

    let plaintext = match cipher.decrypt(nonce, ciphertext) {
        Ok(plaintext) => plaintext,
        Err(_) => return DecryptResult::DecryptionFailure,
    };

    let matches = expected_digest.is_some_and(|expected| plaintext_digest(&plaintext) == *expected);
    if !matches {
        return DecryptResult::IntegrityFailure;
    }

    match String::from_utf8(plaintext) {
        Ok(text) => DecryptResult::Plaintext(text),
        Err(_) => DecryptResult::DecryptionFailure,
    }
}
