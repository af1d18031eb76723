//! Declaration notes and their signatures
//!
//! A note is the content identifier of one image plus a hub-scoped nonce, a
//! millisecond UTC timestamp and a gateway URL pointing back at the image.
//! Signing embeds `signature { version, pubkey }`, serializes the object with
//! sorted keys and no whitespace, signs those bytes and finally adds
//! `signature.proof`.

use crate::error::DeclareError;
use crate::keys::{verify_with, Keypair};
use biocode_core::ContentIdentifier;
use chrono::{DateTime, Utc};
use ed25519_dalek::Signature;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Signature scheme tag embedded in every signed note
pub const SIGNATURE_VERSION: &str = "ISCC-SIG v1.0";

/// Largest hub id that fits in the nonce
pub const MAX_HUB_ID: u32 = 0x0FFF;

/// Unsigned declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclarationNote {
    /// Composite content code
    pub iscc_code: String,
    /// Multihash of the content
    pub datahash: String,
    /// Reported unit codes
    pub units: Vec<String>,
    /// 32 hex chars, first 12 bits carry the hub id
    pub nonce: String,
    /// `YYYY-MM-DDTHH:MM:SS.sssZ`
    pub timestamp: String,
    /// URL of the source image
    pub gateway: String,
}

impl DeclarationNote {
    /// Build a note for `id` stamped with `now`
    ///
    /// # Errors
    /// Returns [`DeclareError::HubIdOutOfRange`] if `hub_id` exceeds 12 bits
    pub fn new(
        id: &ContentIdentifier,
        hub_id: u32,
        gateway: String,
        now: DateTime<Utc>,
    ) -> Result<Self, DeclareError> {
        Ok(Self {
            iscc_code: id.content_code.clone(),
            datahash: id.data_hash.clone(),
            units: id.reported_units().to_vec(),
            nonce: create_nonce(hub_id)?,
            timestamp: format_timestamp(now),
            gateway,
        })
    }

    /// Sign the note
    ///
    /// # Errors
    /// Returns error if the note cannot be serialized
    pub fn sign(self, keypair: &Keypair) -> Result<SignedDeclaration, DeclareError> {
        let pubkey = keypair.public_multibase();
        let mut value = serde_json::to_value(&self)?;
        embed_signature(&mut value, &pubkey);
        let signature = keypair.sign(canonical_json(&value)?.as_bytes());
        Ok(SignedDeclaration {
            note: self,
            signature: NoteSignature {
                version: SIGNATURE_VERSION.to_string(),
                pubkey,
                proof: format!("z{}", bs58::encode(signature.to_bytes()).into_string()),
            },
        })
    }
}

/// Signature block of a signed note
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteSignature {
    /// Scheme tag
    pub version: String,
    /// Multibase public key of the signer
    pub pubkey: String,
    /// Multibase base58btc Ed25519 signature
    pub proof: String,
}

/// Note plus signature, as submitted to the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDeclaration {
    /// Signed content
    #[serde(flatten)]
    pub note: DeclarationNote,
    /// Signature block
    pub signature: NoteSignature,
}

impl SignedDeclaration {
    /// Check the proof against the embedded public key
    #[must_use]
    pub fn verify(&self) -> bool {
        verify_declaration(self)
    }
}

/// Check a signed declaration against its embedded public key
#[must_use]
pub fn verify_declaration(signed: &SignedDeclaration) -> bool {
    if signed.signature.version != SIGNATURE_VERSION {
        return false;
    }
    let Some(sig) = decode_proof(&signed.signature.proof) else {
        return false;
    };
    let Ok(mut value) = serde_json::to_value(&signed.note) else {
        return false;
    };
    embed_signature(&mut value, &signed.signature.pubkey);
    let Ok(bytes) = canonical_json(&value) else {
        return false;
    };
    verify_with(&signed.signature.pubkey, bytes.as_bytes(), &sig)
}

/// Fresh nonce whose first 12 bits carry `hub_id`
///
/// # Errors
/// Returns [`DeclareError::HubIdOutOfRange`] if `hub_id` exceeds 12 bits
#[allow(clippy::cast_possible_truncation)]
pub fn create_nonce(hub_id: u32) -> Result<String, DeclareError> {
    if hub_id > MAX_HUB_ID {
        return Err(DeclareError::HubIdOutOfRange(hub_id));
    }
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] = (hub_id >> 4) as u8;
    bytes[1] = (((hub_id & 0x0F) as u8) << 4) | (bytes[1] & 0x0F);
    Ok(hex::encode(bytes))
}

/// Hub id carried by a nonce
#[must_use]
pub fn nonce_hub_id(nonce: &str) -> Option<u32> {
    let prefix = nonce.get(..3)?;
    u32::from_str_radix(prefix, 16).ok()
}

/// RFC 3339 UTC timestamp with millisecond precision
#[inline]
#[must_use]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Stable gateway URL of an image
#[must_use]
pub fn gateway_url(public_url: &str, image_id: u64) -> String {
    format!(
        "{}/webclient/?show=image-{image_id}",
        public_url.trim_end_matches('/')
    )
}

fn embed_signature(value: &mut Value, pubkey: &str) {
    if let Value::Object(map) = value {
        let mut sig = serde_json::Map::new();
        sig.insert("version".into(), Value::from(SIGNATURE_VERSION));
        sig.insert("pubkey".into(), Value::from(pubkey));
        map.insert("signature".into(), Value::Object(sig));
    }
}

fn decode_proof(proof: &str) -> Option<Signature> {
    let raw = bs58::decode(proof.strip_prefix('z')?).into_vec().ok()?;
    let bytes = <[u8; 64]>::try_from(raw.as_slice()).ok()?;
    Some(Signature::from_bytes(&bytes))
}

/// Compact JSON with object keys sorted at every level
///
/// `serde_json` objects are `BTreeMap`-backed, so plain serialization is
/// already sorted and whitespace free.
pub(crate) fn canonical_json(value: &Value) -> Result<String, serde_json::Error> {
    serde_json::to_string(value)
}
