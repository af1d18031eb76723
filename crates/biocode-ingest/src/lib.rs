//! biocode ingestion
//!
//! Walks an image store in ascending id order, computes a content identifier
//! per image, declares it, writes it back as an annotation and persists a
//! watermark so a restart resumes where the last run stopped.
//!
//! # Core Concepts
//!
//! - [`ImageSource`] / [`SourceImage`] / [`SourceFile`]: what the loop needs from a store
//! - [`MemoryStore`], [`DirectoryStore`]: stores shipped with the crate
//! - [`identify_image`]: pixel-mode or file-mode identifier, with a per-run cache
//! - [`Cursor`]: durable watermark; [`DeadLetterLog`]: images given up on
//! - [`IngestSession`]: the loop itself, driven by an [`IngestState`] machine
//! - [`ServiceConfig`]: TOML file + environment overrides
//!
//! # Example
//!
//! ```rust,ignore
//! use biocode_ingest::{declarer_from_config, stop_channel, IngestSession, MemoryStore, ServiceConfig};
//!
//! let config = ServiceConfig::load(None)?;
//! let (handle, signal) = stop_channel();
//! let session = IngestSession::new(MemoryStore::new(), declarer_from_config(&config), config, signal)?;
//! let stats = session.run().await?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod annotation;
mod cache;
mod config;
mod cursor;
mod directory;
mod identify;
mod memory;
mod session;
mod source;
mod state;

pub use annotation::{
    Annotation, DEFAULT_NAMESPACE, KEY_DATA, KEY_DATAHASH, KEY_ID, KEY_MODE, KEY_PROCESSOR,
    KEY_SOURCE_FILE, KEY_SUM, PROCESSOR,
};
pub use cache::{CacheKey, ContentCache};
pub use config::{ConfigError, FailurePolicy, HashMode, LogFormat, ServiceConfig};
pub use cursor::{Cursor, CursorError, DeadLetter, DeadLetterLog, CURSOR_FILE, DEAD_LETTER_FILE};
pub use directory::{DirectoryStore, ANNOTATIONS_FILE};
pub use identify::{identify_image, Identification, IdentifyError, Identified};
pub use memory::{MemoryFile, MemoryImage, MemoryStore};
pub use session::{
    build_declarer, declarer_from_config, stop_channel, ImageOutcome, IngestError, IngestSession,
    IngestStats, StopHandle, StopSignal,
};
pub use source::{ImageId, ImageSource, SourceError, SourceFile, SourceImage};
pub use state::{allowed_transitions, validate_transition, IngestState, StateError};
