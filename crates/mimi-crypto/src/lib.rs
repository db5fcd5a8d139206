//! MiMi Crypto Library
//!
//! Shared-secret room encryption:
//! - PBKDF2-HMAC-SHA256 turns the room secret into a 256-bit key
//! - AES-256-GCM encrypts each message body under a fresh random nonce
//! - A SHA-256 digest of the plaintext travels next to the ciphertext as a
//!   second, independently stored integrity check
//!
//! The secret itself is shared out-of-band; nothing here distributes keys.

pub mod encrypt;
pub mod envelope;
pub mod error;
pub mod keys;

pub use encrypt::{DecryptResult, decrypt_message, decrypt_wire, encrypt_message};
pub use envelope::Envelope;
pub use error::{EncryptionError, EnvelopeError, KeyDerivationError};
pub use keys::{DerivedKey, KdfConfig, RoomSecret, derive_key};
