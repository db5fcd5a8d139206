use thiserror::Error;

use mimi_crypto::{KdfConfig, KeyDerivationError, RoomSecret};
use mimi_types::RoomId;

/// Default capacity of the dispatcher's event channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

pub const ENV_CHANNEL_CAPACITY: &str = "MIMI_CHANNEL_CAPACITY";
pub const ENV_ROOM: &str = "MIMI_ROOM";
pub const ENV_SECRET: &str = "MIMI_SECRET";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error(transparent)]
    Kdf(#[from] KeyDerivationError),
}

/// Client-side settings. Every client of a deployment must use the same
/// KDF parameters or they will not be able to read each other's messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub kdf: KdfConfig,
    pub channel_capacity: usize,
    /// Room to join, if preset.
    pub room: Option<RoomId>,
    /// Shared secret for `room`, if preset. Debug output is redacted.
    pub secret: Option<RoomSecret>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            kdf: KdfConfig::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            room: None,
            secret: None,
        }
    }
}

impl ClientConfig {
    /// Read the process environment. Unset variables fall back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let kdf = KdfConfig::from_lookup(&lookup)?;

        let channel_capacity = match lookup(ENV_CHANNEL_CAPACITY) {
            Some(value) => parse_capacity(&value)?,
            None => DEFAULT_CHANNEL_CAPACITY,
        };

        let room = lookup(ENV_ROOM)
            .filter(|room| !room.trim().is_empty())
            .map(RoomId::new);
        // An empty secret is kept so that joining reports it instead of
        // silently generating a new one.
        let secret = lookup(ENV_SECRET).map(RoomSecret::new);

        Ok(Self {
            kdf,
            channel_capacity,
            room,
            secret,
        })
    }
}

fn parse_capacity(value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidNumber {
            var: ENV_CHANNEL_CAPACITY,
            value: value.to_string(),
        }),
    }
}
