//! Ed25519 key material in multibase form
//!
//! Secret keys are `z` + base58btc(`0x80 0x26` + 32-byte seed).
//! Public keys are `z` + base58btc(`0xed 0x01` + 32-byte key).

use crate::error::KeyError;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

/// Environment variable holding the secret key
pub const SECRET_KEY_ENV: &str = "ISCC_CRYPTO_SECRET_KEY";

const SECRET_CODEC: [u8; 2] = [0x80, 0x26];
const PUBLIC_CODEC: [u8; 2] = [0xed, 0x01];

/// Signing keypair
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Fresh random keypair
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Keypair from a raw 32-byte seed
    #[inline]
    #[must_use]
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Parse a multibase secret key
    ///
    /// # Errors
    /// Returns error if the prefix, codec or length is wrong
    pub fn from_multibase(secret: &str) -> Result<Self, KeyError> {
        let seed = decode_multikey(secret.trim(), SECRET_CODEC)?;
        Ok(Self::from_seed(seed))
    }

    /// Load the secret key from [`SECRET_KEY_ENV`]
    ///
    /// # Errors
    /// Returns [`KeyError::MissingEnv`] if unset, or a parse error
    pub fn from_env() -> Result<Self, KeyError> {
        let secret = std::env::var(SECRET_KEY_ENV).map_err(|_| KeyError::MissingEnv(SECRET_KEY_ENV))?;
        Self::from_multibase(&secret)
    }

    /// Multibase secret key
    #[must_use]
    pub fn secret_multibase(&self) -> String {
        encode_multikey(SECRET_CODEC, &self.signing.to_bytes())
    }

    /// Multibase public key
    #[must_use]
    pub fn public_multibase(&self) -> String {
        public_multibase(&self.signing.verifying_key())
    }

    /// Verifying half
    #[inline]
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Sign raw bytes
    #[inline]
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public_multibase())
            .finish_non_exhaustive()
    }
}

/// Multibase form of a verifying key
#[must_use]
pub fn public_multibase(key: &VerifyingKey) -> String {
    encode_multikey(PUBLIC_CODEC, key.as_bytes())
}

/// Parse a multibase public key
///
/// # Errors
/// Returns error if the prefix, codec, length or curve point is wrong
pub fn parse_public_multibase(public: &str) -> Result<VerifyingKey, KeyError> {
    let bytes = decode_multikey(public, PUBLIC_CODEC)?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| KeyError::InvalidPublicKey(e.to_string()))
}

/// Verify a signature against a multibase public key
#[must_use]
pub(crate) fn verify_with(public: &str, message: &[u8], signature: &Signature) -> bool {
    parse_public_multibase(public).is_ok_and(|key| key.verify(message, signature).is_ok())
}

fn encode_multikey(codec: [u8; 2], key: &[u8; 32]) -> String {
    let mut raw = Vec::with_capacity(34);
    raw.extend_from_slice(&codec);
    raw.extend_from_slice(key);
    format!("z{}", bs58::encode(raw).into_string())
}

fn decode_multikey(encoded: &str, codec: [u8; 2]) -> Result<[u8; 32], KeyError> {
    let body = encoded.strip_prefix('z').ok_or(KeyError::NotMultibase)?;
    let raw = bs58::decode(body).into_vec()?;
    if raw.len() < 2 {
        return Err(KeyError::InvalidLength(raw.len()));
    }
    let found = [raw[0], raw[1]];
    if found != codec {
        return Err(KeyError::WrongCodec(found));
    }
    <[u8; 32]>::try_from(&raw[2..]).map_err(|_| KeyError::InvalidLength(raw.len() - 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_round_trips_through_multibase() {
        let keypair = Keypair::from_seed([7u8; 32]);
        let encoded = keypair.secret_multibase();
        assert!(encoded.starts_with('z'));

        let parsed = Keypair::from_multibase(&encoded).unwrap();
        assert_eq!(parsed.public_multibase(), keypair.public_multibase());
    }

    #[test]
    fn public_key_uses_ed25519_codec() {
        let keypair = Keypair::from_seed([1u8; 32]);
        let public = keypair.public_multibase();
        let raw = bs58::decode(&public[1..]).into_vec().unwrap();
        assert_eq!(&raw[..2], &[0xed, 0x01]);
        assert_eq!(parse_public_multibase(&public).unwrap(), keypair.verifying_key());
    }

    #[test]
    fn public_key_is_not_a_secret_key() {
        let public = Keypair::from_seed([1u8; 32]).public_multibase();
        assert!(matches!(
            Keypair::from_multibase(&public),
            Err(KeyError::WrongCodec([0xed, 0x01]))
        ));
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert!(matches!(Keypair::from_multibase("abc"), Err(KeyError::NotMultibase)));
        assert!(matches!(Keypair::from_multibase("z0OIl"), Err(KeyError::Base58(_))));

        let short = format!("z{}", bs58::encode([0x80, 0x26, 1, 2, 3]).into_string());
        assert!(matches!(Keypair::from_multibase(&short), Err(KeyError::InvalidLength(3))));
    }

    #[test]
    fn signatures_verify_against_multibase_key() {
        let keypair = Keypair::from_seed([9u8; 32]);
        let sig = keypair.sign(b"payload");
        assert!(verify_with(&keypair.public_multibase(), b"payload", &sig));
        assert!(!verify_with(&keypair.public_multibase(), b"tampered", &sig));
    }
}
