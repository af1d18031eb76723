//! Plane canonicalization
//!
//! Turns a 2D sample array into the byte form that is hashed. Samples are
//! walked row-major (Y outer, X inner) and every element is written
//! big-endian, so the output never depends on the byte order of the host or
//! of the store that produced the array.

use crate::pixels::{PixelArray, PixelData, Plane};

/// Canonical bytes of a 2D array
///
/// Output length is `size_y * size_x * element_size`. Zero-sized dimensions
/// produce an empty buffer.
///
/// # Errors
/// Returns [`CanonError::InvalidShape`] unless the array has rank 2
pub fn canonicalize(array: &PixelArray) -> Result<Vec<u8>, CanonError> {
    if array.rank() != 2 {
        return Err(CanonError::InvalidShape {
            shape: array.shape().to_vec(),
        });
    }

    let mut out = Vec::with_capacity(array.data().len() * array.pixel_type().size());
    match array.data() {
        PixelData::U8(v) => out.extend_from_slice(v),
        PixelData::U16(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes())),
        PixelData::U32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes())),
        PixelData::I8(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes())),
        PixelData::I16(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes())),
        PixelData::I32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes())),
        PixelData::F32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes())),
        PixelData::F64(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes())),
    }
    Ok(out)
}

/// Canonical bytes of a plane
///
/// # Errors
/// Returns [`CanonError::InvalidShape`] unless the plane's array has rank 2
#[inline]
pub fn canonicalize_plane(plane: &Plane) -> Result<Vec<u8>, CanonError> {
    canonicalize(&plane.pixels)
}

/// Canonicalization failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CanonError {
    /// Array is not two-dimensional
    #[error("expected a 2D plane, got shape {shape:?} (rank {})", .shape.len())]
    InvalidShape { shape: Vec<usize> },
}
