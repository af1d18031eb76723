//! ISCC code encoding
//!
//! A code is `ISCC:` followed by the unpadded RFC 4648 base32 form of a
//! two-byte header and a body. The header packs four nibbles:
//! main type, sub type, version and length.

use data_encoding::BASE32_NOPAD;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Prefix of every rendered code
pub const ISCC_PREFIX: &str = "ISCC:";

/// Main type nibble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MainType {
    /// Data-Code unit (similarity over raw bytes)
    Data = 3,
    /// Instance-Code unit (exact checksum)
    Instance = 4,
    /// Composite code
    Iscc = 5,
}

impl TryFrom<u8> for MainType {
    type Error = CodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            3 => Ok(Self::Data),
            4 => Ok(Self::Instance),
            5 => Ok(Self::Iscc),
            other => Err(CodeError::UnsupportedMainType(other)),
        }
    }
}

/// Sub type nibble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SubType {
    /// Plain unit
    None = 0,
    /// Composite of 64-bit data and instance bodies
    Sum = 5,
    /// Composite of 128-bit data and instance bodies
    Wide = 7,
}

impl TryFrom<u8> for SubType {
    type Error = CodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            5 => Ok(Self::Sum),
            7 => Ok(Self::Wide),
            other => Err(CodeError::UnsupportedSubType(other)),
        }
    }
}

/// Decoded code header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Header {
    /// Main type
    pub main_type: MainType,
    /// Sub type
    pub sub_type: SubType,
    /// Version nibble
    pub version: u8,
    /// Length nibble; for units the body is `(length + 1) * 32` bits
    pub length: u8,
}

impl Header {
    /// Header of a plain unit with a body of `bits` bits
    ///
    /// # Errors
    /// Returns [`CodeError::InvalidBodyLength`] unless `bits` is a multiple of 32 in `32..=512`
    pub fn unit(main_type: MainType, bits: usize) -> Result<Self, CodeError> {
        if bits == 0 || bits % 32 != 0 || bits > 512 {
            return Err(CodeError::InvalidBodyLength(bits));
        }
        Ok(Self {
            main_type,
            sub_type: SubType::None,
            version: 0,
            length: u8::try_from(bits / 32 - 1).map_err(|_| CodeError::InvalidBodyLength(bits))?,
        })
    }

    /// Header of a composite data+instance code
    #[must_use]
    pub const fn composite(wide: bool) -> Self {
        Self {
            main_type: MainType::Iscc,
            sub_type: if wide { SubType::Wide } else { SubType::Sum },
            version: 0,
            length: 0,
        }
    }

    /// Packed two-byte form
    #[inline]
    #[must_use]
    pub fn to_bytes(self) -> [u8; 2] {
        [
            ((self.main_type as u8) << 4) | (self.sub_type as u8),
            (self.version << 4) | (self.length & 0x0F),
        ]
    }

    /// Unpack a two-byte header
    ///
    /// # Errors
    /// Returns error if either type nibble is unknown
    pub fn from_bytes(bytes: [u8; 2]) -> Result<Self, CodeError> {
        Ok(Self {
            main_type: MainType::try_from(bytes[0] >> 4)?,
            sub_type: SubType::try_from(bytes[0] & 0x0F)?,
            version: bytes[1] >> 4,
            length: bytes[1] & 0x0F,
        })
    }
}

/// A header plus body, renderable as an `ISCC:` string
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IsccCode {
    header: Header,
    body: Vec<u8>,
}

impl IsccCode {
    /// Build a unit code from a body
    ///
    /// # Errors
    /// Returns error if the body length is not a valid unit size
    pub fn unit(main_type: MainType, body: &[u8]) -> Result<Self, CodeError> {
        Ok(Self {
            header: Header::unit(main_type, body.len() * 8)?,
            body: body.to_vec(),
        })
    }

    /// Build a 256-bit unit code from a full digest
    #[must_use]
    pub fn unit_256(main_type: MainType, digest: &[u8; 32]) -> Self {
        Self {
            header: Header {
                main_type,
                sub_type: SubType::None,
                version: 0,
                length: 7,
            },
            body: digest.to_vec(),
        }
    }

    /// Build a composite code from two full 256-bit digests
    #[must_use]
    pub fn composite_256(data: &[u8; 32], instance: &[u8; 32], wide: bool) -> Self {
        let n = if wide { 16 } else { 8 };
        let mut body = Vec::with_capacity(2 * n);
        body.extend_from_slice(&data[..n]);
        body.extend_from_slice(&instance[..n]);
        Self {
            header: Header::composite(wide),
            body,
        }
    }

    /// Build a composite code from the data and instance digests
    ///
    /// Takes the leading 128 bits (wide) or 64 bits of each digest.
    ///
    /// # Errors
    /// Returns error if either digest is too short
    pub fn composite(data: &[u8], instance: &[u8], wide: bool) -> Result<Self, CodeError> {
        let n = if wide { 16 } else { 8 };
        if data.len() < n || instance.len() < n {
            return Err(CodeError::InvalidBodyLength(data.len().min(instance.len()) * 8));
        }
        let mut body = Vec::with_capacity(2 * n);
        body.extend_from_slice(&data[..n]);
        body.extend_from_slice(&instance[..n]);
        Ok(Self {
            header: Header::composite(wide),
            body,
        })
    }

    /// Header
    #[inline]
    #[must_use]
    pub fn header(&self) -> Header {
        self.header
    }

    /// Body bytes
    #[inline]
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

impl Display for IsccCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut raw = Vec::with_capacity(2 + self.body.len());
        raw.extend_from_slice(&self.header.to_bytes());
        raw.extend_from_slice(&self.body);
        write!(f, "{ISCC_PREFIX}{}", BASE32_NOPAD.encode(&raw))
    }
}

impl FromStr for IsccCode {
    type Err = CodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = s.strip_prefix(ISCC_PREFIX).ok_or(CodeError::MissingPrefix)?;
        let raw = BASE32_NOPAD.decode(encoded.as_bytes())?;
        if raw.len() < 2 {
            return Err(CodeError::Truncated);
        }
        Ok(Self {
            header: Header::from_bytes([raw[0], raw[1]])?,
            body: raw[2..].to_vec(),
        })
    }
}

/// Errors encoding or decoding codes
#[derive(Debug, thiserror::Error)]
pub enum CodeError {
    /// String does not start with `ISCC:`
    #[error("code is missing the ISCC: prefix")]
    MissingPrefix,

    /// Base32 payload is malformed
    #[error("base32 decode error: {0}")]
    Base32(#[from] data_encoding::DecodeError),

    /// Payload shorter than a header
    #[error("code is shorter than its header")]
    Truncated,

    /// Unknown main type nibble
    #[error("unsupported main type {0}")]
    UnsupportedMainType(u8),

    /// Unknown sub type nibble
    #[error("unsupported sub type {0}")]
    UnsupportedSubType(u8),

    /// Body is not a whole number of 32-bit words
    #[error("invalid body length: {0} bits")]
    InvalidBodyLength(usize),
}
