//! Identifier computation for one source image

use crate::cache::{CacheKey, ContentCache};
use crate::config::HashMode;
use crate::source::{SourceError, SourceFile, SourceImage};
use biocode_core::{
    canonicalize, plane_coordinates, CanonError, ContentAccumulator, ContentIdentifier, PlaneCoord,
};
use tracing::debug;

/// Identifier plus where it came from
#[derive(Debug, Clone)]
pub struct Identified {
    /// The identifier
    pub identifier: ContentIdentifier,
    /// Served from the per-run cache
    pub cached: bool,
    /// Name of the file hashed in file mode
    pub source_file: Option<String>,
}

/// Result of trying to identify an image
#[derive(Debug, Clone)]
pub enum Identification {
    /// Identifier computed or cached
    Done(Identified),
    /// Nothing to hash; carries the reason
    Empty(&'static str),
}

/// Identify `image` in `mode`, consulting and filling `cache`
///
/// # Errors
/// Returns error on store failures or planes that do not canonicalize
pub async fn identify_image(
    image: &dyn SourceImage,
    mode: HashMode,
    chunk_size: usize,
    cache: &ContentCache,
) -> Result<Identification, IdentifyError> {
    let files = image.files().await?;
    let first = files.first();
    let key = first.and_then(|f| CacheKey::new(f.store_hash(), mode));

    if let Some(key) = &key {
        if let Some(identifier) = cache.get(key).await {
            debug!(store_hash = %key.store_hash, "content cache hit");
            return Ok(Identification::Done(Identified {
                identifier,
                cached: true,
                source_file: source_name(mode, first.map(|f| &**f)),
            }));
        }
    }

    let identifier = match mode {
        HashMode::Pixels => match hash_pixels(image).await? {
            Some(id) => id,
            None => return Ok(Identification::Empty("no pixel data")),
        },
        HashMode::File => match first {
            Some(file) => hash_file(&**file, chunk_size).await?,
            None => return Ok(Identification::Empty("no original files")),
        },
    };

    if let Some(key) = key {
        cache.insert(key, identifier.clone()).await;
    }
    Ok(Identification::Done(Identified {
        identifier,
        cached: false,
        source_file: source_name(mode, first.map(|f| &**f)),
    }))
}

fn source_name(mode: HashMode, file: Option<&dyn SourceFile>) -> Option<String> {
    match mode {
        HashMode::File => file.map(|f| f.name().to_string()),
        HashMode::Pixels => None,
    }
}

/// Canonical plane stream over all scenes, in scene -> Z -> C -> T order
async fn hash_pixels(image: &dyn SourceImage) -> Result<Option<ContentIdentifier>, IdentifyError> {
    let scenes = image.scenes().await?;
    if scenes.iter().all(|s| s.plane_count() == 0) {
        return Ok(None);
    }

    let mut acc = ContentAccumulator::new();
    for coord in plane_coordinates(&scenes) {
        let plane = image.plane(coord).await?;
        let bytes = canonicalize(&plane)?;
        let scene = &scenes[coord.scene];
        if plane.shape() != [scene.size_y, scene.size_x] {
            return Err(IdentifyError::ShapeMismatch {
                coord,
                expected: vec![scene.size_y, scene.size_x],
                actual: plane.shape().to_vec(),
            });
        }
        acc.update(&bytes);
    }
    Ok(Some(acc.finalize()))
}

/// Raw file bytes, read in offset order
async fn hash_file(file: &dyn SourceFile, chunk_size: usize) -> Result<ContentIdentifier, IdentifyError> {
    let size = file.size();
    let step = chunk_size.max(1) as u64;
    let mut acc = ContentAccumulator::new();
    let mut offset = 0u64;
    while offset < size {
        let want = usize::try_from(step.min(size - offset)).unwrap_or(usize::MAX);
        let data = file.read_chunk(offset, want).await?;
        if data.is_empty() {
            return Err(SourceError::ShortRead {
                file_id: file.id(),
                offset,
            }
            .into());
        }
        acc.update(&data);
        offset += data.len() as u64;
    }
    debug!(file_id = file.id(), bytes = offset, "hashed original file");
    Ok(acc.finalize())
}

/// Identification failures
#[derive(Debug, thiserror::Error)]
pub enum IdentifyError {
    /// Store failure
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Plane is not 2D
    #[error(transparent)]
    Canon(#[from] CanonError),

    /// Plane shape disagrees with its scene
    #[error("plane {coord} has shape {actual:?}, scene expects {expected:?}")]
    ShapeMismatch {
        coord: PlaneCoord,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

impl IdentifyError {
    /// Check if the error means the connection is gone
    #[inline]
    #[must_use]
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Source(e) if e.is_connection_loss())
    }
}
