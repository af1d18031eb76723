//! Error types for declarations
//!
//! Covers:
//! - Missing or malformed key material
//! - Missing registry configuration
//! - Client construction failures

/// Key material failures
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// Environment variable not set
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),

    /// Key string lacks the `z` multibase prefix
    #[error("key is not multibase base58btc (expected leading 'z')")]
    NotMultibase,

    /// Base58 payload is malformed
    #[error("base58 decode error: {0}")]
    Base58(#[from] bs58::decode::Error),

    /// Multicodec prefix does not mark an Ed25519 key
    #[error("unexpected multicodec prefix {0:02x?}")]
    WrongCodec([u8; 2]),

    /// Key body has the wrong length
    #[error("expected a 32-byte key, got {0} bytes")]
    InvalidLength(usize),

    /// Bytes are not a valid Ed25519 public key
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
}

/// Declaration setup failures
///
/// Every variant disables declaration without stopping ingestion.
#[derive(Debug, thiserror::Error)]
pub enum DeclareError {
    /// A required registry setting is absent
    #[error("declaration disabled: {0} is not configured")]
    MissingConfig(&'static str),

    /// Hub id does not fit in the 12 nonce bits
    #[error("hub id {0} is outside 0..=4095")]
    HubIdOutOfRange(u32),

    /// Signing key could not be loaded
    #[error("key error: {0}")]
    Key(#[from] KeyError),

    /// HTTP client could not be built
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Note could not be serialized
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl DeclareError {
    /// Check if the error comes from absent or unusable configuration
    #[inline]
    #[must_use]
    pub fn is_config_missing(&self) -> bool {
        matches!(
            self,
            Self::MissingConfig(_) | Self::HubIdOutOfRange(_) | Self::Key(_)
        )
    }
}
