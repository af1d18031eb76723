//! Local directory as an image store
//!
//! Every regular file directly inside the root is one image with one original
//! file. Image ids are 1-based positions in file-name order, so new files
//! must sort after existing ones for ids to stay stable. Annotations live in
//! a sidecar JSON file in the state directory. There is no pixel access:
//! only file-mode hashing applies, and pixel reads fail as unsupported.

use crate::annotation::Annotation;
use crate::cursor::write_atomic;
use crate::source::{ImageId, ImageSource, SourceError, SourceFile, SourceImage};
use async_trait::async_trait;
use biocode_core::{PixelArray, PlaneCoord, SceneInfo};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Sidecar file name inside the state directory
pub const ANNOTATIONS_FILE: &str = "annotations.json";

type AnnotationMap = BTreeMap<ImageId, Vec<Annotation>>;

/// Directory-backed store
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
    sidecar: PathBuf,
    annotations: Arc<Mutex<AnnotationMap>>,
}

impl DirectoryStore {
    /// Serve `root`, keeping annotations under `state_dir`
    ///
    /// # Errors
    /// Returns error if an existing sidecar cannot be read or parsed
    pub fn open(root: impl Into<PathBuf>, state_dir: &Path) -> Result<Self, SourceError> {
        let sidecar = state_dir.join(ANNOTATIONS_FILE);
        let annotations = match std::fs::read(&sidecar) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| SourceError::Store(format!("bad sidecar {}: {e}", sidecar.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AnnotationMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            root: root.into(),
            sidecar,
            annotations: Arc::new(Mutex::new(annotations)),
        })
    }

    /// Directory served
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Annotations recorded for an image
    #[must_use]
    pub fn annotations_of(&self, id: ImageId) -> Vec<Annotation> {
        self.annotations.lock().get(&id).cloned().unwrap_or_default()
    }

    async fn listing(&self) -> Result<Vec<(PathBuf, u64)>, SourceError> {
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(|e| {
            SourceError::Store(format!("cannot list {}: {e}", self.root.display()))
        })?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_file() {
                files.push((entry.path(), meta.len()));
            }
        }
        files.sort_by(|a, b| a.0.file_name().cmp(&b.0.file_name()));
        Ok(files)
    }

    fn record(&self, id: ImageId, annotation: &Annotation) -> Result<(), SourceError> {
        let mut map = self.annotations.lock();
        map.entry(id).or_default().push(annotation.clone());
        let bytes = serde_json::to_vec_pretty(&*map)
            .map_err(|e| SourceError::Store(format!("cannot encode sidecar: {e}")))?;
        write_atomic(&self.sidecar, &bytes).map_err(|e| SourceError::Store(e.to_string()))
    }
}

#[async_trait]
impl ImageSource for DirectoryStore {
    async fn connect(&self) -> Result<(), SourceError> {
        tokio::fs::read_dir(&self.root)
            .await
            .map(drop)
            .map_err(|e| SourceError::ConnectFailed(format!("cannot list {}: {e}", self.root.display())))
    }

    async fn images_after(
        &self,
        after: ImageId,
        limit: usize,
    ) -> Result<Vec<Box<dyn SourceImage>>, SourceError> {
        let listing = self.listing().await?;
        Ok(listing
            .into_iter()
            .enumerate()
            .map(|(i, (path, size))| (i as ImageId + 1, path, size))
            .filter(|(id, _, _)| *id > after)
            .take(limit)
            .map(|(id, path, size)| {
                Box::new(DirectoryImage {
                    store: self.clone(),
                    id,
                    name: display_name(&path),
                    path,
                    size,
                }) as Box<dyn SourceImage>
            })
            .collect())
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

struct DirectoryImage {
    store: DirectoryStore,
    id: ImageId,
    name: String,
    path: PathBuf,
    size: u64,
}

#[async_trait]
impl SourceImage for DirectoryImage {
    fn id(&self) -> ImageId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn scenes(&self) -> Result<Vec<SceneInfo>, SourceError> {
        Err(SourceError::Unsupported(
            "directory store has no pixel data, use file mode".into(),
        ))
    }

    async fn plane(&self, _coord: PlaneCoord) -> Result<PixelArray, SourceError> {
        Err(SourceError::Unsupported("directory store has no pixel planes".into()))
    }

    async fn files(&self) -> Result<Vec<Box<dyn SourceFile>>, SourceError> {
        Ok(vec![Box::new(LocalFile {
            id: self.id,
            name: self.name.clone(),
            path: self.path.clone(),
            size: self.size,
        })])
    }

    async fn annotations(&self, namespace: &str) -> Result<Vec<Annotation>, SourceError> {
        Ok(self
            .store
            .annotations_of(self.id)
            .into_iter()
            .filter(|a| a.is_in(namespace))
            .collect())
    }

    async fn write_annotation(&self, annotation: &Annotation) -> Result<(), SourceError> {
        self.store.record(self.id, annotation)
    }
}

struct LocalFile {
    id: u64,
    name: String,
    path: PathBuf,
    size: u64,
}

#[async_trait]
impl SourceFile for LocalFile {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn store_hash(&self) -> Option<&str> {
        None
    }

    async fn read_chunk(&self, offset: u64, length: usize) -> Result<Vec<u8>, SourceError> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(length);
        file.take(length as u64).read_to_end(&mut buf).await?;
        Ok(buf)
    }
}
