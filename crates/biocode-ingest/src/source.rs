//! Capability interfaces of an image store
//!
//! The ingestion loop only needs a narrow view of the store:
//! - [`ImageSource`]: connect, list images after a watermark
//! - [`SourceImage`]: scenes, planes, original files, annotations
//! - [`SourceFile`]: size, store hash, byte ranges

use crate::annotation::Annotation;
use async_trait::async_trait;
use biocode_core::{PixelArray, PixelError, PlaneCoord, SceneInfo};

/// Source image id; ids increase in creation order
pub type ImageId = u64;

/// Store with images ordered by id
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Establish (or re-establish) the connection
    async fn connect(&self) -> Result<(), SourceError>;

    /// Up to `limit` images with id strictly greater than `after`, ascending
    async fn images_after(
        &self,
        after: ImageId,
        limit: usize,
    ) -> Result<Vec<Box<dyn SourceImage>>, SourceError>;
}

/// One image in the store
#[async_trait]
pub trait SourceImage: Send + Sync {
    /// Image id
    fn id(&self) -> ImageId;

    /// Display name
    fn name(&self) -> &str;

    /// Scenes in scene order; empty when the image has no pixel data
    async fn scenes(&self) -> Result<Vec<SceneInfo>, SourceError>;

    /// One 2D plane
    async fn plane(&self, coord: PlaneCoord) -> Result<PixelArray, SourceError>;

    /// Original files the image was imported from
    async fn files(&self) -> Result<Vec<Box<dyn SourceFile>>, SourceError>;

    /// Annotations in `namespace`
    async fn annotations(&self, namespace: &str) -> Result<Vec<Annotation>, SourceError>;

    /// Attach an annotation
    async fn write_annotation(&self, annotation: &Annotation) -> Result<(), SourceError>;
}

impl std::fmt::Debug for dyn SourceImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceImage")
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}

/// One original file
#[async_trait]
pub trait SourceFile: Send + Sync {
    /// File id
    fn id(&self) -> u64;

    /// File name
    fn name(&self) -> &str;

    /// Size in bytes
    fn size(&self) -> u64;

    /// Hash recorded by the store at import, if any
    fn store_hash(&self) -> Option<&str>;

    /// Up to `length` bytes starting at `offset`
    async fn read_chunk(&self, offset: u64, length: usize) -> Result<Vec<u8>, SourceError>;
}

/// Store failures
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Established connection dropped
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Connection could not be established
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Plane coordinate outside the scene
    #[error("no plane at {0}")]
    PlaneNotFound(PlaneCoord),

    /// Stored pixel bytes do not decode
    #[error("pixel data error: {0}")]
    Pixels(#[from] PixelError),

    /// File returned fewer bytes than its size promised
    #[error("short read on file {file_id} at offset {offset}")]
    ShortRead { file_id: u64, offset: u64 },

    /// Operation not offered by this store
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other store-side failure
    #[error("store error: {0}")]
    Store(String),
}

impl SourceError {
    /// Check if the error means the connection is gone
    #[inline]
    #[must_use]
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::ConnectFailed(_))
    }
}
