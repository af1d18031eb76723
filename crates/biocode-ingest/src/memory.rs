//! In-memory image store
//!
//! Implements the source interfaces over plain data, with failure injection:
//! refused connects, a connection that drops after a number of calls, and
//! images whose reads fail permanently.

use crate::annotation::Annotation;
use crate::source::{ImageId, ImageSource, SourceError, SourceFile, SourceImage};
use async_trait::async_trait;
use biocode_core::{PixelArray, PixelType, Plane, PlaneCoord, SceneInfo};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Original file held in memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryFile {
    pub id: u64,
    pub name: String,
    pub hash: Option<String>,
    pub data: Vec<u8>,
}

impl MemoryFile {
    #[must_use]
    pub fn new(id: u64, name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id,
            name: name.into(),
            hash: None,
            data,
        }
    }

    /// With a store-side hash
    #[must_use]
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }
}

/// Image held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryImage {
    pub id: ImageId,
    pub name: String,
    scenes: Vec<SceneInfo>,
    planes: BTreeMap<PlaneCoord, PixelArray>,
    files: Vec<MemoryFile>,
    annotations: Vec<Annotation>,
}

impl MemoryImage {
    #[must_use]
    pub fn new(id: ImageId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            ..Self::default()
        }
    }

    /// Append a scene built from its planes
    ///
    /// Dimensions come from the largest coordinates and the first plane's
    /// shape; the scene index of each coordinate is replaced by this scene's.
    #[must_use]
    pub fn with_scene(mut self, planes: Vec<Plane>) -> Self {
        let scene = self.scenes.len();
        let first_shape = planes.first().map(|p| p.pixels.shape().to_vec()).unwrap_or_default();
        let info = SceneInfo {
            size_z: planes.iter().map(|p| p.coord.z + 1).max().unwrap_or(0),
            size_c: planes.iter().map(|p| p.coord.c + 1).max().unwrap_or(0),
            size_t: planes.iter().map(|p| p.coord.t + 1).max().unwrap_or(0),
            size_y: first_shape.first().copied().unwrap_or(0),
            size_x: first_shape.get(1).copied().unwrap_or(0),
            pixel_type: planes.first().map_or(PixelType::U8, |p| p.pixels.pixel_type()),
        };
        self.scenes.push(info);
        for plane in planes {
            let coord = PlaneCoord { scene, ..plane.coord };
            self.planes.insert(coord, plane.pixels);
        }
        self
    }

    /// Append a scene with explicit dimensions and planes in traversal order
    #[must_use]
    pub fn with_scene_info(mut self, info: SceneInfo, planes: Vec<PixelArray>) -> Self {
        let scene = self.scenes.len();
        self.scenes.push(info);
        let coords = biocode_core::plane_coordinates(&self.scenes)
            .filter(|c| c.scene == scene)
            .collect::<Vec<_>>();
        for (coord, pixels) in coords.into_iter().zip(planes) {
            self.planes.insert(coord, pixels);
        }
        self
    }

    #[must_use]
    pub fn with_file(mut self, file: MemoryFile) -> Self {
        self.files.push(file);
        self
    }

    #[must_use]
    pub fn with_annotation(mut self, annotation: Annotation) -> Self {
        self.annotations.push(annotation);
        self
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    images: BTreeMap<ImageId, MemoryImage>,
    broken: BTreeMap<ImageId, String>,
    dropping: BTreeSet<ImageId>,
    lose_listings: bool,
    connected: bool,
    connect_failures: u32,
    drop_after: Option<u32>,
    connects: u32,
    plane_reads: u64,
    chunk_reads: u64,
}

/// Shared in-memory store; clones see the same data
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an image
    pub fn insert(&self, image: MemoryImage) {
        self.inner.lock().images.insert(image.id, image);
    }

    /// Annotations currently on an image
    #[must_use]
    pub fn annotations_of(&self, id: ImageId) -> Vec<Annotation> {
        self.inner
            .lock()
            .images
            .get(&id)
            .map(|img| img.annotations.clone())
            .unwrap_or_default()
    }

    /// Refuse the next `n` connects
    pub fn fail_connects(&self, n: u32) {
        self.inner.lock().connect_failures = n;
    }

    /// Let `calls` more calls succeed, then drop the connection
    pub fn drop_connection_after(&self, calls: u32) {
        self.inner.lock().drop_after = Some(calls);
    }

    /// Drop the connection on every pixel or file read of `id`
    pub fn drop_connection_on(&self, id: ImageId) {
        self.inner.lock().dropping.insert(id);
    }

    /// Drop the connection on every listing while `lose` holds
    pub fn lose_listings(&self, lose: bool) {
        self.inner.lock().lose_listings = lose;
    }

    /// Make every pixel and file read of `id` fail with `reason`
    pub fn fail_image(&self, id: ImageId, reason: impl Into<String>) {
        self.inner.lock().broken.insert(id, reason.into());
    }

    /// Connect attempts so far
    #[must_use]
    pub fn connects(&self) -> u32 {
        self.inner.lock().connects
    }

    /// Planes served so far
    #[must_use]
    pub fn plane_reads(&self) -> u64 {
        self.inner.lock().plane_reads
    }

    /// File chunks served so far
    #[must_use]
    pub fn chunk_reads(&self) -> u64 {
        self.inner.lock().chunk_reads
    }

    fn gate(&self) -> Result<MutexGuard<'_, MemoryState>, SourceError> {
        let mut state = self.inner.lock();
        if !state.connected {
            return Err(SourceError::ConnectionLost("not connected".into()));
        }
        match state.drop_after {
            Some(0) => {
                state.connected = false;
                state.drop_after = None;
                Err(SourceError::ConnectionLost("connection reset".into()))
            }
            Some(n) => {
                state.drop_after = Some(n - 1);
                Ok(state)
            }
            None => Ok(state),
        }
    }
}

fn check_readable(state: &mut MemoryState, id: ImageId) -> Result<(), SourceError> {
    if state.dropping.contains(&id) {
        state.connected = false;
        return Err(SourceError::ConnectionLost(format!("connection reset reading image {id}")));
    }
    match state.broken.get(&id) {
        Some(reason) => Err(SourceError::Store(reason.clone())),
        None => Ok(()),
    }
}

#[async_trait]
impl ImageSource for MemoryStore {
    async fn connect(&self) -> Result<(), SourceError> {
        let mut state = self.inner.lock();
        state.connects += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(SourceError::ConnectFailed("connection refused".into()));
        }
        state.connected = true;
        Ok(())
    }

    async fn images_after(
        &self,
        after: ImageId,
        limit: usize,
    ) -> Result<Vec<Box<dyn SourceImage>>, SourceError> {
        let mut state = self.gate()?;
        if state.lose_listings {
            state.connected = false;
            return Err(SourceError::ConnectionLost("connection reset while listing".into()));
        }
        Ok(state
            .images
            .range(after.saturating_add(1)..)
            .take(limit)
            .map(|(id, img)| {
                Box::new(MemoryImageHandle {
                    store: self.clone(),
                    id: *id,
                    name: img.name.clone(),
                }) as Box<dyn SourceImage>
            })
            .collect())
    }
}

struct MemoryImageHandle {
    store: MemoryStore,
    id: ImageId,
    name: String,
}

impl MemoryImageHandle {
    fn with_image<T>(&self, f: impl FnOnce(&mut MemoryState) -> Result<T, SourceError>) -> Result<T, SourceError> {
        let mut state = self.store.gate()?;
        if !state.images.contains_key(&self.id) {
            return Err(SourceError::Store(format!("image {} vanished", self.id)));
        }
        f(&mut state)
    }
}

#[async_trait]
impl SourceImage for MemoryImageHandle {
    fn id(&self) -> ImageId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn scenes(&self) -> Result<Vec<SceneInfo>, SourceError> {
        self.with_image(|state| Ok(state.images[&self.id].scenes.clone()))
    }

    async fn plane(&self, coord: PlaneCoord) -> Result<PixelArray, SourceError> {
        self.with_image(|state| {
            check_readable(state, self.id)?;
            state.plane_reads += 1;
            state.images[&self.id]
                .planes
                .get(&coord)
                .cloned()
                .ok_or(SourceError::PlaneNotFound(coord))
        })
    }

    async fn files(&self) -> Result<Vec<Box<dyn SourceFile>>, SourceError> {
        self.with_image(|state| {
            Ok(state.images[&self.id]
                .files
                .iter()
                .map(|f| {
                    Box::new(MemoryFileHandle {
                        store: self.store.clone(),
                        image_id: self.id,
                        file: f.clone(),
                    }) as Box<dyn SourceFile>
                })
                .collect())
        })
    }

    async fn annotations(&self, namespace: &str) -> Result<Vec<Annotation>, SourceError> {
        self.with_image(|state| {
            Ok(state.images[&self.id]
                .annotations
                .iter()
                .filter(|a| a.is_in(namespace))
                .cloned()
                .collect())
        })
    }

    async fn write_annotation(&self, annotation: &Annotation) -> Result<(), SourceError> {
        self.with_image(|state| {
            if let Some(img) = state.images.get_mut(&self.id) {
                img.annotations.push(annotation.clone());
            }
            Ok(())
        })
    }
}

struct MemoryFileHandle {
    store: MemoryStore,
    image_id: ImageId,
    file: MemoryFile,
}

#[async_trait]
impl SourceFile for MemoryFileHandle {
    fn id(&self) -> u64 {
        self.file.id
    }

    fn name(&self) -> &str {
        &self.file.name
    }

    fn size(&self) -> u64 {
        self.file.data.len() as u64
    }

    fn store_hash(&self) -> Option<&str> {
        self.file.hash.as_deref()
    }

    async fn read_chunk(&self, offset: u64, length: usize) -> Result<Vec<u8>, SourceError> {
        let mut state = self.store.gate()?;
        check_readable(&mut state, self.image_id)?;
        state.chunk_reads += 1;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(self.file.data.len());
        let end = start.saturating_add(length).min(self.file.data.len());
        Ok(self.file.data[start..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use biocode_core::PixelData;

    fn plane(z: usize, t: usize, v: u8) -> Plane {
        Plane {
            coord: PlaneCoord::new(9, z, 0, t),
            pixels: PixelArray::plane(1, 2, PixelData::U8(vec![v, v])).unwrap(),
        }
    }

    #[tokio::test]
    async fn calls_require_connection() {
        let store = MemoryStore::new();
        store.insert(MemoryImage::new(1, "a"));
        assert!(matches!(
            store.images_after(0, 10).await,
            Err(SourceError::ConnectionLost(_))
        ));
        store.connect().await.unwrap();
        assert_eq!(store.images_after(0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn images_after_is_exclusive_and_bounded() {
        let store = MemoryStore::new();
        for id in [3, 1, 7, 5] {
            store.insert(MemoryImage::new(id, format!("img{id}")));
        }
        store.connect().await.unwrap();
        let ids: Vec<_> = store.images_after(3, 2).await.unwrap().iter().map(|i| i.id()).collect();
        assert_eq!(ids, vec![5, 7]);
    }

    #[tokio::test]
    async fn scene_dimensions_come_from_planes() {
        let store = MemoryStore::new();
        store.insert(MemoryImage::new(1, "a").with_scene(vec![plane(0, 0, 1), plane(0, 1, 2), plane(1, 0, 3), plane(1, 1, 4)]));
        store.connect().await.unwrap();
        let image = store.images_after(0, 1).await.unwrap().remove(0);

        let scenes = image.scenes().await.unwrap();
        assert_eq!((scenes[0].size_z, scenes[0].size_c, scenes[0].size_t), (2, 1, 2));
        assert_eq!((scenes[0].size_y, scenes[0].size_x), (1, 2));

        let p = image.plane(PlaneCoord::new(0, 1, 0, 1)).await.unwrap();
        assert_eq!(p.data(), &PixelData::U8(vec![4, 4]));
        assert_eq!(store.plane_reads(), 1);
    }

    #[tokio::test]
    async fn connection_drops_after_budget() {
        let store = MemoryStore::new();
        store.insert(MemoryImage::new(1, "a"));
        store.connect().await.unwrap();
        store.drop_connection_after(1);

        assert!(store.images_after(0, 1).await.is_ok());
        assert!(store.images_after(0, 1).await.unwrap_err().is_connection_loss());
        assert!(store.images_after(0, 1).await.unwrap_err().is_connection_loss());
        store.connect().await.unwrap();
        assert!(store.images_after(0, 1).await.is_ok());
    }

    #[tokio::test]
    async fn dropping_image_resets_every_read() {
        let store = MemoryStore::new();
        store.insert(MemoryImage::new(1, "a").with_scene(vec![plane(0, 0, 1)]));
        store.drop_connection_on(1);
        for _ in 0..2 {
            store.connect().await.unwrap();
            let image = store.images_after(0, 1).await.unwrap().remove(0);
            let err = image.plane(PlaneCoord::new(0, 0, 0, 0)).await.unwrap_err();
            assert!(err.is_connection_loss());
            assert!(store.images_after(0, 1).await.unwrap_err().is_connection_loss());
        }
        assert_eq!(store.plane_reads(), 0);
    }

    #[tokio::test]
    async fn lost_listings_can_be_restored() {
        let store = MemoryStore::new();
        store.insert(MemoryImage::new(1, "a"));
        store.connect().await.unwrap();
        store.lose_listings(true);
        assert!(store.images_after(0, 1).await.unwrap_err().is_connection_loss());

        store.lose_listings(false);
        store.connect().await.unwrap();
        assert_eq!(store.images_after(0, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refused_connects_are_counted() {
        let store = MemoryStore::new();
        store.fail_connects(2);
        assert!(store.connect().await.is_err());
        assert!(store.connect().await.is_err());
        assert!(store.connect().await.is_ok());
        assert_eq!(store.connects(), 3);
    }

    #[tokio::test]
    async fn file_chunks_follow_offsets() {
        let store = MemoryStore::new();
        store.insert(MemoryImage::new(1, "a").with_file(MemoryFile::new(10, "a.tif", (0u8..10).collect()).with_hash("h")));
        store.connect().await.unwrap();
        let image = store.images_after(0, 1).await.unwrap().remove(0);
        let files = image.files().await.unwrap();

        assert_eq!(files[0].size(), 10);
        assert_eq!(files[0].store_hash(), Some("h"));
        assert_eq!(files[0].read_chunk(8, 4).await.unwrap(), vec![8, 9]);
        assert!(files[0].read_chunk(12, 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn broken_image_fails_reads() {
        let store = MemoryStore::new();
        store.insert(MemoryImage::new(1, "a").with_scene(vec![plane(0, 0, 1)]));
        store.fail_image(1, "disk error");
        store.connect().await.unwrap();
        let image = store.images_after(0, 1).await.unwrap().remove(0);
        let err = image.plane(PlaneCoord::new(0, 0, 0, 0)).await.unwrap_err();
        assert!(!err.is_connection_loss());
    }

    #[tokio::test]
    async fn annotations_are_filtered_by_namespace() {
        let store = MemoryStore::new();
        store.insert(
            MemoryImage::new(1, "a")
                .with_annotation(Annotation::new("other").with("k", "v"))
                .with_annotation(Annotation::new("mine").with("k", "w")),
        );
        store.connect().await.unwrap();
        let image = store.images_after(0, 1).await.unwrap().remove(0);
        assert_eq!(image.annotations("mine").await.unwrap().len(), 1);

        image.write_annotation(&Annotation::new("mine")).await.unwrap();
        assert_eq!(store.annotations_of(1).len(), 3);
    }
}
