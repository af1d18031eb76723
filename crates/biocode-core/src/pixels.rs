//! Pixel model
//!
//! Provides the typed sample arrays read from an image store:
//! - [`PixelType`]: the eight supported element types
//! - [`PixelArray`]: dense typed samples plus a shape
//! - [`SceneInfo`]: per-scene dimensions used to enumerate planes
//! - [`Plane`]: one 2D array tagged with its `(scene, z, c, t)` coordinate

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Element type of a pixel array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    /// Unsigned 8-bit
    U8,
    /// Unsigned 16-bit
    U16,
    /// Unsigned 32-bit
    U32,
    /// Signed 8-bit
    I8,
    /// Signed 16-bit
    I16,
    /// Signed 32-bit
    I32,
    /// IEEE 754 single precision
    F32,
    /// IEEE 754 double precision
    F64,
}

impl PixelType {
    /// Size of one element in bytes
    #[inline]
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    /// Name used by OMERO pixel stores (`uint16`, `float`, ...)
    #[must_use]
    pub const fn store_name(self) -> &'static str {
        match self {
            Self::U8 => "uint8",
            Self::U16 => "uint16",
            Self::U32 => "uint32",
            Self::I8 => "int8",
            Self::I16 => "int16",
            Self::I32 => "int32",
            Self::F32 => "float",
            Self::F64 => "double",
        }
    }
}

impl Display for PixelType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.store_name())
    }
}

impl FromStr for PixelType {
    type Err = PixelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uint8" | "u8" => Ok(Self::U8),
            "uint16" | "u16" => Ok(Self::U16),
            "uint32" | "u32" => Ok(Self::U32),
            "int8" | "i8" => Ok(Self::I8),
            "int16" | "i16" => Ok(Self::I16),
            "int32" | "i32" => Ok(Self::I32),
            "float" | "float32" | "f32" => Ok(Self::F32),
            "double" | "float64" | "f64" => Ok(Self::F64),
            other => Err(PixelError::UnknownPixelType(other.to_string())),
        }
    }
}

/// Byte order of raw sample bytes handed out by a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Most significant byte first
    Big,
    /// Least significant byte first
    Little,
}

impl ByteOrder {
    /// Byte order of the running host
    #[inline]
    #[must_use]
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }
}

/// Typed sample storage
#[derive(Debug, Clone, PartialEq)]
pub enum PixelData {
    /// `uint8` samples
    U8(Vec<u8>),
    /// `uint16` samples
    U16(Vec<u16>),
    /// `uint32` samples
    U32(Vec<u32>),
    /// `int8` samples
    I8(Vec<i8>),
    /// `int16` samples
    I16(Vec<i16>),
    /// `int32` samples
    I32(Vec<i32>),
    /// `float` samples
    F32(Vec<f32>),
    /// `double` samples
    F64(Vec<f64>),
}

impl PixelData {
    /// Element type of the storage
    #[must_use]
    pub fn pixel_type(&self) -> PixelType {
        match self {
            Self::U8(_) => PixelType::U8,
            Self::U16(_) => PixelType::U16,
            Self::U32(_) => PixelType::U32,
            Self::I8(_) => PixelType::I8,
            Self::I16(_) => PixelType::I16,
            Self::I32(_) => PixelType::I32,
            Self::F32(_) => PixelType::F32,
            Self::F64(_) => PixelType::F64,
        }
    }

    /// Number of samples
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::U8(v) => v.len(),
            Self::U16(v) => v.len(),
            Self::U32(v) => v.len(),
            Self::I8(v) => v.len(),
            Self::I16(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
        }
    }

    /// True when there are no samples
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode raw bytes of the given element type and byte order
    ///
    /// # Errors
    /// Returns [`PixelError::ByteLength`] if `bytes` is not a whole number of elements
    pub fn from_bytes(
        pixel_type: PixelType,
        bytes: &[u8],
        order: ByteOrder,
    ) -> Result<Self, PixelError> {
        let size = pixel_type.size();
        if bytes.len() % size != 0 {
            return Err(PixelError::ByteLength {
                len: bytes.len(),
                element_size: size,
            });
        }

        macro_rules! decode {
            ($variant:ident, $ty:ty, $n:expr) => {{
                let values = bytes
                    .chunks_exact($n)
                    .map(|c| {
                        let mut raw = [0u8; $n];
                        raw.copy_from_slice(c);
                        match order {
                            ByteOrder::Big => <$ty>::from_be_bytes(raw),
                            ByteOrder::Little => <$ty>::from_le_bytes(raw),
                        }
                    })
                    .collect();
                Self::$variant(values)
            }};
        }

        Ok(match pixel_type {
            PixelType::U8 => Self::U8(bytes.to_vec()),
            PixelType::I8 => decode!(I8, i8, 1),
            PixelType::U16 => decode!(U16, u16, 2),
            PixelType::I16 => decode!(I16, i16, 2),
            PixelType::U32 => decode!(U32, u32, 4),
            PixelType::I32 => decode!(I32, i32, 4),
            PixelType::F32 => decode!(F32, f32, 4),
            PixelType::F64 => decode!(F64, f64, 8),
        })
    }
}

/// Dense N-dimensional sample array in row-major order
///
/// Rank is carried as data so arrays of any rank can be represented; the
/// canonicalizer is the component that insists on rank 2.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelArray {
    shape: Vec<usize>,
    data: PixelData,
}

impl PixelArray {
    /// Create an array, checking that the shape covers every sample
    ///
    /// # Errors
    /// Returns [`PixelError::LengthMismatch`] if the shape product differs from the sample count
    pub fn new(shape: Vec<usize>, data: PixelData) -> Result<Self, PixelError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(PixelError::LengthMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// Create a 2D array of `size_y` rows and `size_x` columns
    ///
    /// # Errors
    /// Returns [`PixelError::LengthMismatch`] if `data` does not hold `size_y * size_x` samples
    pub fn plane(size_y: usize, size_x: usize, data: PixelData) -> Result<Self, PixelError> {
        Self::new(vec![size_y, size_x], data)
    }

    /// Decode a raw plane buffer from a store
    ///
    /// # Errors
    /// Returns error if the buffer length does not match the shape and element type
    pub fn from_bytes(
        shape: Vec<usize>,
        pixel_type: PixelType,
        bytes: &[u8],
        order: ByteOrder,
    ) -> Result<Self, PixelError> {
        Self::new(shape, PixelData::from_bytes(pixel_type, bytes, order)?)
    }

    /// Shape, outermost dimension first
    #[inline]
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of dimensions
    #[inline]
    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Typed samples
    #[inline]
    #[must_use]
    pub fn data(&self) -> &PixelData {
        &self.data
    }

    /// Element type
    #[inline]
    #[must_use]
    pub fn pixel_type(&self) -> PixelType {
        self.data.pixel_type()
    }
}

/// Dimensions of one scene
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneInfo {
    /// Focal planes
    pub size_z: usize,
    /// Channels
    pub size_c: usize,
    /// Time points
    pub size_t: usize,
    /// Rows per plane
    pub size_y: usize,
    /// Columns per plane
    pub size_x: usize,
    /// Element type
    pub pixel_type: PixelType,
}

impl SceneInfo {
    /// Number of planes in the dense Z×C×T product
    #[inline]
    #[must_use]
    pub fn plane_count(&self) -> usize {
        self.size_z * self.size_c * self.size_t
    }

    /// Canonical bytes contributed by one plane
    #[inline]
    #[must_use]
    pub fn plane_bytes(&self) -> usize {
        self.size_y * self.size_x * self.pixel_type.size()
    }
}

/// Position of a plane within a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlaneCoord {
    /// Scene index
    pub scene: usize,
    /// Focal plane index
    pub z: usize,
    /// Channel index
    pub c: usize,
    /// Time point index
    pub t: usize,
}

impl PlaneCoord {
    /// Create a coordinate
    #[inline]
    #[must_use]
    pub const fn new(scene: usize, z: usize, c: usize, t: usize) -> Self {
        Self { scene, z, c, t }
    }
}

impl Display for PlaneCoord {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "(s{},z{},c{},t{})", self.scene, self.z, self.c, self.t)
    }
}

/// A 2D sample array with its coordinate
#[derive(Debug, Clone, PartialEq)]
pub struct Plane {
    /// Where the plane sits in the dataset
    pub coord: PlaneCoord,
    /// Samples, shape `[size_y, size_x]`
    pub pixels: PixelArray,
}

/// Enumerate plane coordinates in canonical traversal order
///
/// Scenes in list order; within a scene Z is outermost, then C, with T
/// innermost. Consumers hashing a dataset must feed planes in exactly this
/// order.
pub fn plane_coordinates(scenes: &[SceneInfo]) -> impl Iterator<Item = PlaneCoord> + '_ {
    scenes.iter().enumerate().flat_map(|(scene, info)| {
        (0..info.size_z).flat_map(move |z| {
            (0..info.size_c)
                .flat_map(move |c| (0..info.size_t).map(move |t| PlaneCoord::new(scene, z, c, t)))
        })
    })
}

/// Errors building pixel arrays
#[derive(Debug, thiserror::Error)]
pub enum PixelError {
    /// Shape does not match sample count
    #[error("shape covers {expected} samples, data holds {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// Raw buffer is not a whole number of elements
    #[error("buffer of {len} bytes is not a multiple of element size {element_size}")]
    ByteLength { len: usize, element_size: usize },

    /// Store reported a pixel type name we do not handle
    #[error("unknown pixel type: {0}")]
    UnknownPixelType(String),
}
