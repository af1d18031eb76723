//! biocode core
//!
//! Deterministic content identifiers for multidimensional bioimages.
//!
//! # Core Concepts
//!
//! - [`PixelArray`]: typed samples with a shape, decoded from store bytes
//! - [`canonicalize`]: 2D array → big-endian row-major bytes
//! - [`plane_coordinates`]: canonical traversal (scene → Z → C → T)
//! - [`ContentAccumulator`]: streaming fold into a [`ContentIdentifier`]
//! - [`IsccCode`]: header + body rendered as an `ISCC:` string
//! - [`RetryPolicy`]: capped exponential backoff shared by network callers
//!
//! # Example
//!
//! ```rust,ignore
//! use biocode_core::{canonicalize, ContentAccumulator, PixelArray, PixelData};
//!
//! let plane = PixelArray::plane(2, 2, PixelData::U8(vec![0, 1, 2, 3]))?;
//! let mut acc = ContentAccumulator::new();
//! acc.update(&canonicalize(&plane)?);
//! let id = acc.finalize();
//! println!("{}", id.content_code);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod accumulator;
mod canon;
mod code;
mod pixels;
mod retry;

pub use accumulator::{
    cut_point, identify_chunks, identify_reader, ContentAccumulator, ContentIdentifier,
    AVG_CHUNK, BLAKE3_MULTIHASH_PREFIX, MAX_CHUNK, MIN_CHUNK,
};
pub use canon::{canonicalize, canonicalize_plane, CanonError};
pub use code::{CodeError, Header, IsccCode, MainType, SubType, ISCC_PREFIX};
pub use pixels::{
    plane_coordinates, ByteOrder, PixelArray, PixelData, PixelError, PixelType, Plane,
    PlaneCoord, SceneInfo,
};
pub use retry::RetryPolicy;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identify a sequence of planes already in canonical order
///
/// # Errors
/// Returns [`CanonError::InvalidShape`] for the first plane that is not 2D
pub fn identify_planes<'a, I>(planes: I) -> Result<ContentIdentifier, CanonError>
where
    I: IntoIterator<Item = &'a Plane>,
{
    let mut acc = ContentAccumulator::new();
    for plane in planes {
        acc.update(&canonicalize_plane(plane)?);
    }
    Ok(acc.finalize())
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn u8_plane(coord: PlaneCoord, values: Vec<u8>) -> Plane {
        Plane {
            coord,
            pixels: PixelArray::plane(1, values.len(), PixelData::U8(values)).unwrap(),
        }
    }

    #[test]
    fn single_plane_scenario() {
        let plane = Plane {
            coord: PlaneCoord::new(0, 0, 0, 0),
            pixels: PixelArray::plane(2, 2, PixelData::U8(vec![0, 1, 2, 3])).unwrap(),
        };
        assert_eq!(canonicalize_plane(&plane).unwrap(), vec![0, 1, 2, 3]);

        let id = identify_planes([&plane]).unwrap();
        assert_eq!(id, identify_chunks([[0u8, 1, 2, 3]]));
        assert_eq!(id.filesize, 4);
        assert_eq!(
            id.content_code,
            "ISCC:K4AEW64CYHVCEPNB2X5O3CS3PMXEJ4YPLKZI7YCHSBADP533NWSP5II"
        );
        assert_eq!(
            id.data_hash,
            "1e20f30f5ab28fe047904037f77b6da4fea1e27241c5d132638d8bedce9d40494f32"
        );
        assert_eq!(
            id.unit_codes,
            vec![
                "ISCC:GADUW64CYHVCEPNB2X5O3CS3PMXEJ472CZKJIQB27SXQXETVRCFVUZQ".to_string(),
                "ISCC:IAD7GD22WKH6AR4QIA37O63NUT7KDYTSIHC5CMTDRWF63TU5IBEU6MQ".to_string(),
            ]
        );
    }

    #[test]
    fn empty_stream_golden() {
        let id = identify_chunks(Vec::<Vec<u8>>::new());
        assert_eq!(
            id.content_code,
            "ISCC:K4AOK7V5CBALBTOPJ2Q3V2SHDUCBVLYTJG47L6NBU2QEATPKG3OMSSI"
        );
        assert_eq!(
            id.data_hash,
            "1e20af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
        );
    }

    #[test]
    fn multi_scene_stream_is_continuous() {
        let scenes = [SceneInfo {
            size_z: 1,
            size_c: 1,
            size_t: 2,
            size_y: 1,
            size_x: 3,
            pixel_type: PixelType::U8,
        }; 2];
        let planes: Vec<Plane> = plane_coordinates(&scenes)
            .enumerate()
            .map(|(i, coord)| u8_plane(coord, vec![i as u8; 3]))
            .collect();

        let order: Vec<_> = planes.iter().map(|p| p.coord).collect();
        assert_eq!(
            order,
            vec![
                PlaneCoord::new(0, 0, 0, 0),
                PlaneCoord::new(0, 0, 0, 1),
                PlaneCoord::new(1, 0, 0, 0),
                PlaneCoord::new(1, 0, 0, 1),
            ]
        );

        let whole = identify_planes(&planes).unwrap();
        let chunks: Vec<Vec<u8>> = planes.iter().map(|p| canonicalize_plane(p).unwrap()).collect();
        assert_eq!(whole, identify_chunks(&chunks));

        let per_scene_0 = identify_planes(&planes[..2]).unwrap();
        let per_scene_1 = identify_planes(&planes[2..]).unwrap();
        assert_ne!(whole.content_code, per_scene_0.content_code);
        assert_ne!(whole.content_code, per_scene_1.content_code);
    }

    #[test]
    fn invalid_plane_aborts_identification() {
        let bad = Plane {
            coord: PlaneCoord::new(0, 0, 0, 0),
            pixels: PixelArray::new(vec![4], PixelData::U8(vec![0; 4])).unwrap(),
        };
        assert!(matches!(
            identify_planes([&bad]),
            Err(CanonError::InvalidShape { .. })
        ));
    }
}
