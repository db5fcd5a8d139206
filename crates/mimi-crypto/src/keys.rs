use std::fmt;

use aes_gcm::aead::OsRng;
use aes_gcm::aead::rand_core::RngCore;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::Hmac;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::KeyDerivationError;

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// Application-wide salt. Fixed so that every client holding the same room
/// secret derives the same key without exchanging anything else.
pub const DEFAULT_SALT: &[u8] = b"e2ee-chat-salt";

/// PBKDF2 rounds used by every deployed client.
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// Below this the KDF is considered too cheap to slow down secret guessing.
pub const RECOMMENDED_ITERATIONS: u32 = 100_000;

pub const ENV_KDF_SALT: &str = "MIMI_KDF_SALT";
pub const ENV_KDF_ITERATIONS: &str = "MIMI_KDF_ITERATIONS";

/// Parameters of the password-based key derivation.
///
/// All clients of one deployment must agree on these, otherwise they derive
/// different keys from the same secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfConfig {
    salt: Vec<u8>,
    iterations: u32,
}

impl KdfConfig {
    pub fn new(salt: impl Into<Vec<u8>>, iterations: u32) -> Result<Self, KeyDerivationError> {
        let salt = salt.into();
        if salt.is_empty() {
            return Err(KeyDerivationError::InvalidConfig("salt must not be empty".into()));
        }
        if iterations == 0 {
            return Err(KeyDerivationError::InvalidConfig(
                "iteration count must be non-zero".into(),
            ));
        }
        Ok(Self { salt, iterations })
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Read `MIMI_KDF_SALT` and `MIMI_KDF_ITERATIONS`, falling back to the
    /// deployment defaults for unset variables.
    pub fn from_env() -> Result<Self, KeyDerivationError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, KeyDerivationError> {
        let salt = lookup(ENV_KDF_SALT)
            .map(String::into_bytes)
            .unwrap_or_else(|| DEFAULT_SALT.to_vec());

        let iterations = match lookup(ENV_KDF_ITERATIONS) {
            Some(value) => value.trim().parse::<u32>().map_err(|_| {
                KeyDerivationError::InvalidConfig(format!(
                    "{} must be a positive integer, got {:?}",
                    ENV_KDF_ITERATIONS, value
                ))
            })?,
            None => DEFAULT_ITERATIONS,
        };

        let config = Self::new(salt, iterations)?;
        if !config.is_recommended_strength() {
            warn!(
                iterations,
                recommended = RECOMMENDED_ITERATIONS,
                "KDF iteration count is below the recommended minimum"
            );
        }
        Ok(config)
    }

    /// True when the iteration count is at least [`RECOMMENDED_ITERATIONS`].
    pub fn is_recommended_strength(&self) -> bool {
        self.iterations >= RECOMMENDED_ITERATIONS
    }
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            salt: DEFAULT_SALT.to_vec(),
            iterations: DEFAULT_ITERATIONS,
        }
    }
}

/// The out-of-band room secret. Never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct RoomSecret(String);

impl RoomSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Generate a random secret for a new room (256 bits, base64 for sharing).
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        let secret = BASE64.encode(bytes);
        bytes.fill(0);
        Self(secret)
    }

    /// The secret text, for showing to the room creator so it can be shared.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RoomSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RoomSecret(<redacted>)")
    }
}

/// A 256-bit symmetric key derived from a room secret.
///
/// Lives only in memory for the duration of one room context and is zeroed
/// when dropped.
#[derive(PartialEq, Eq)]
pub struct DerivedKey {
    bytes: [u8; KEY_LEN],
}

impl DerivedKey {
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// Short, non-reversible identifier for logs: first 8 bytes of
    /// SHA-256(key), hex encoded.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.bytes);
        hex::encode(&digest[..8])
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DerivedKey({})", self.fingerprint())
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.bytes.fill(0);
    }
}

/// Derive the room key from a shared secret with PBKDF2-HMAC-SHA256.
///
/// Deterministic: the same secret under the same config always yields the
/// same key. The CPU cost scales with `config.iterations()`.
pub fn derive_key(
    secret: &RoomSecret,
    config: &KdfConfig,
) -> Result<DerivedKey, KeyDerivationError> {
    if secret.0.is_empty() {
        return Err(KeyDerivationError::EmptySecret);
    }

    let mut bytes = [0u8; KEY_LEN];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(
        secret.0.as_bytes(),
        config.salt(),
        config.iterations(),
        &mut bytes,
    )
    .map_err(|e| KeyDerivationError::Primitive(e.to_string()))?;

    Ok(DerivedKey { bytes })
}
