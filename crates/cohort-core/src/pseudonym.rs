//! Identifier pseudonymization.

use sha2::{Digest, Sha256};

use crate::config::PseudonymConfig;
use crate::model::Identifier;

#[derive(Debug, thiserror::Error)]
pub enum PseudonymError {
    #[error("Identifier has no value to pseudonymize")]
    MissingValue,

    #[error("Pseudonymization key not available: {0}")]
    MissingKey(String),
}

/// Deterministic, key-dependent replacement of an identifier value.
///
/// The identifying system is kept; only the value changes. The same key
/// must always map the same input to the same output.
pub trait Pseudonymizer: Send + Sync {
    fn pseudonymize(&self, original: &Identifier) -> Result<Identifier, PseudonymError>;
}

/// `hex(SHA-256(value || key))`, lowercase.
pub struct KeyedHashPseudonymizer {
    key: String,
}

impl KeyedHashPseudonymizer {
    pub fn new(key: impl Into<String>) -> Result<Self, PseudonymError> {
        let key = key.into();
        if key.is_empty() {
            return Err(PseudonymError::MissingKey("key is empty".into()));
        }
        Ok(Self { key })
    }

    /// Read the key from the environment variable named in config.
    pub fn from_config(config: &PseudonymConfig) -> Result<Self, PseudonymError> {
        let key = std::env::var(&config.key_env)
            .map_err(|_| PseudonymError::MissingKey(format!("{} is not set", config.key_env)))?;
        Self::new(key)
    }

    fn digest(&self, value: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(value.as_bytes());
        hasher.update(self.key.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl Pseudonymizer for KeyedHashPseudonymizer {
    fn pseudonymize(&self, original: &Identifier) -> Result<Identifier, PseudonymError> {
        let value = original
            .value
            .as_deref()
            .ok_or(PseudonymError::MissingValue)?;

        Ok(Identifier {
            system: original.system.clone(),
            value: Some(self.digest(value)),
        })
    }
}
