//! biocode declarations
//!
//! Signs content identifiers and submits them to an ISCC registry.
//!
//! # Core Concepts
//!
//! - [`Keypair`]: Ed25519 key in multibase form, loaded from the environment
//! - [`DeclarationNote`]: identifier + nonce + timestamp + gateway URL
//! - [`SignedDeclaration`]: note with an embedded `ISCC-SIG v1.0` signature
//! - [`DeclarationClient`]: HTTP submission with 409 deduplication and retry
//! - [`DeclarationOutcome`]: what happened, never an error
//!
//! # Example
//!
//! ```rust,ignore
//! use biocode_declare::{DeclarationClient, Keypair, RegistryConfig};
//!
//! let config = RegistryConfig::new()
//!     .with_hub_id(1)
//!     .with_hub_url("https://hub.example")
//!     .with_public_url("https://omero.example");
//! let client = DeclarationClient::new(&config, Keypair::from_env()?, RetryPolicy::submission(), timeout)?;
//! let outcome = client.submit(&identifier, 42).await;
//! ```

#![warn(unreachable_pub)]

mod client;
mod error;
mod keys;
mod note;

pub use client::{
    Declare, DeclarationClient, DeclarationOutcome, DisabledDeclarer, RegistryConfig, HUB_ID_ENV,
    HUB_URL_ENV, PUBLIC_URL_ENV,
};
pub use error::{DeclareError, KeyError};
pub use keys::{parse_public_multibase, public_multibase, Keypair, SECRET_KEY_ENV};
pub use note::{
    create_nonce, format_timestamp, gateway_url, nonce_hub_id, verify_declaration,
    DeclarationNote, NoteSignature, SignedDeclaration, MAX_HUB_ID, SIGNATURE_VERSION,
};
