//! Error types for mimi-crypto

use thiserror::Error;

/// Key derivation failed. Fatal to that attempt; deriving again from the same
/// secret cannot succeed, so callers should ask for the secret again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyDerivationError {
    #[error("Room secret is empty")]
    EmptySecret,

    #[error("Invalid KDF configuration: {0}")]
    InvalidConfig(String),

    #[error("Key derivation primitive failed: {0}")]
    Primitive(String),
}

/// Encrypting one outgoing message failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncryptionError {
    #[error("Secure random source unavailable: {0}")]
    Entropy(String),

    #[error("Cipher failure: {0}")]
    Cipher(String),
}

/// A wire envelope could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("Payload is missing the iv:ciphertext separator")]
    MissingSeparator,

    #[error("Invalid base64 in {field}")]
    InvalidBase64 { field: &'static str },

    #[error("Invalid nonce length: expected {expected} bytes, got {actual}")]
    InvalidIvLength { expected: usize, actual: usize },

    #[error("Invalid digest: expected {expected} bytes, got {actual}")]
    InvalidDigest { expected: usize, actual: usize },
}
