//! Streaming content accumulator
//!
//! Folds an ordered sequence of byte chunks into a [`ContentIdentifier`]
//! without holding the whole input. Two digests run side by side:
//!
//! - **Data unit**: content-defined chunking with a gear rolling hash,
//!   an xxh32 feature per chunk and a 64-way MinHash. Only the undecided
//!   tail of the current chunk is buffered between updates.
//! - **Instance unit**: BLAKE3 over the exact byte stream.
//!
//! Chunk boundaries of the *input* never matter, only the concatenated
//! stream does; chunk *order* does.

use crate::code::{IsccCode, MainType};
use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::sync::OnceLock;
use xxhash_rust::xxh32::xxh32;

/// Smallest content-defined chunk
pub const MIN_CHUNK: usize = 256;
/// Target average chunk
pub const AVG_CHUNK: usize = 1024;
/// Largest content-defined chunk
pub const MAX_CHUNK: usize = 8192;

// Harder mask before the average size, easier one after it.
const MASK_S: u32 = (1 << 11) - 1;
const MASK_L: u32 = (1 << 9) - 1;

const PERMUTATIONS: usize = 64;
const MERSENNE_PRIME: u64 = (1 << 61) - 1;
const MAX_HASH: u64 = (1 << 32) - 1;
const COMPRESS_BITS: usize = 4;

/// Multihash prefix for a 32-byte BLAKE3 digest
pub const BLAKE3_MULTIHASH_PREFIX: &str = "1e20";

const GEAR_TAG: &[u8] = b"biocode/data-unit/gear/v1";
const MINHASH_TAG: &[u8] = b"biocode/data-unit/minhash/v1";

fn xof(tag: &[u8], out: &mut [u8]) {
    let mut hasher = blake3::Hasher::new();
    hasher.update(tag);
    hasher.finalize_xof().fill(out);
}

fn gear_table() -> &'static [u32; 256] {
    static GEAR: OnceLock<[u32; 256]> = OnceLock::new();
    GEAR.get_or_init(|| {
        let mut raw = [0u8; 256 * 4];
        xof(GEAR_TAG, &mut raw);
        let mut table = [0u32; 256];
        for (slot, word) in table.iter_mut().zip(raw.chunks_exact(4)) {
            *slot = u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
        }
        table
    })
}

fn minhash_params() -> &'static [(u64, u64); PERMUTATIONS] {
    static PARAMS: OnceLock<[(u64, u64); PERMUTATIONS]> = OnceLock::new();
    PARAMS.get_or_init(|| {
        let mut raw = [0u8; PERMUTATIONS * 16];
        xof(MINHASH_TAG, &mut raw);
        let mut params = [(0u64, 0u64); PERMUTATIONS];
        for (slot, words) in params.iter_mut().zip(raw.chunks_exact(16)) {
            let mut a = [0u8; 8];
            let mut b = [0u8; 8];
            a.copy_from_slice(&words[..8]);
            b.copy_from_slice(&words[8..]);
            *slot = (
                u64::from_be_bytes(a) % (MERSENNE_PRIME - 1) + 1,
                u64::from_be_bytes(b) % MERSENNE_PRIME,
            );
        }
        params
    })
}

/// Length of the first content-defined chunk of `buf`
///
/// A result shorter than `buf` is final: appending bytes never moves it.
/// A result equal to `buf.len()` means the chunk may still grow.
#[must_use]
pub fn cut_point(buf: &[u8]) -> usize {
    let size = buf.len();
    if size <= MIN_CHUNK {
        return size;
    }
    let gear = gear_table();
    let mut pattern: u32 = 0;
    let mut i = MIN_CHUNK;

    let center = AVG_CHUNK.min(size);
    while i < center {
        pattern = (pattern >> 1).wrapping_add(gear[usize::from(buf[i])]);
        if pattern & MASK_S == 0 {
            return i + 1;
        }
        i += 1;
    }

    let limit = MAX_CHUNK.min(size);
    while i < limit {
        pattern = (pattern >> 1).wrapping_add(gear[usize::from(buf[i])]);
        if pattern & MASK_L == 0 {
            return i + 1;
        }
        i += 1;
    }
    i
}

/// Similarity digest over content-defined chunks
#[derive(Debug, Clone)]
struct DataHasher {
    tail: Vec<u8>,
    mins: [u64; PERMUTATIONS],
    chunks: u64,
}

impl DataHasher {
    fn new() -> Self {
        Self {
            tail: Vec::new(),
            mins: [u64::MAX; PERMUTATIONS],
            chunks: 0,
        }
    }

    fn absorb(&mut self, feature: u32) {
        let f = u128::from(feature);
        for (min, &(a, b)) in self.mins.iter_mut().zip(minhash_params()) {
            let permuted = (u128::from(a) * f + u128::from(b)) % u128::from(MERSENNE_PRIME);
            // The modulus keeps `permuted` below 2^61.
            let h = (permuted as u64) & MAX_HASH;
            if h < *min {
                *min = h;
            }
        }
        self.chunks += 1;
    }

    fn update(&mut self, data: &[u8]) {
        self.tail.extend_from_slice(data);
        let mut start = 0;
        loop {
            let cut = cut_point(&self.tail[start..]);
            if cut == self.tail.len() - start {
                break;
            }
            let feature = xxh32(&self.tail[start..start + cut], 0);
            self.absorb(feature);
            start += cut;
        }
        self.tail.drain(..start);
    }

    fn finalize(mut self) -> [u8; 32] {
        let tail = std::mem::take(&mut self.tail);
        let mut start = 0;
        while start < tail.len() {
            let cut = cut_point(&tail[start..]);
            self.absorb(xxh32(&tail[start..start + cut], 0));
            start += cut;
        }
        if self.chunks == 0 {
            self.absorb(xxh32(b"", 0));
        }

        // Bit-plane compression: bit `k` of every permutation, lowest bit first.
        let mut digest = [0u8; 32];
        let mut pos = 0;
        for bit in 0..COMPRESS_BITS {
            for h in &self.mins {
                if (h >> bit) & 1 == 1 {
                    digest[pos / 8] |= 0x80 >> (pos % 8);
                }
                pos += 1;
            }
        }
        digest
    }
}

/// Content identifier record
///
/// Pure function of the byte stream fed to the accumulator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentIdentifier {
    /// Composite content code (`ISCC:K4A...` when wide)
    pub content_code: String,
    /// Multihash of the whole stream (`1e20` + BLAKE3 hex)
    pub data_hash: String,
    /// Unit codes: data unit, then instance unit
    pub unit_codes: Vec<String>,
    /// Bytes consumed
    pub filesize: u64,
}

impl ContentIdentifier {
    /// Units reported to a registry
    ///
    /// The last unit is reserved: the instance unit is recoverable from
    /// `data_hash`, so it is not repeated externally.
    #[must_use]
    pub fn reported_units(&self) -> &[String] {
        match self.unit_codes.split_last() {
            Some((_, rest)) => rest,
            None => &[],
        }
    }
}

/// Streaming fold over ordered chunks
///
/// `finalize` consumes the accumulator, so nothing can be fed afterwards.
#[derive(Debug, Clone)]
pub struct ContentAccumulator {
    data: DataHasher,
    instance: blake3::Hasher,
    filesize: u64,
    wide: bool,
}

impl ContentAccumulator {
    /// Accumulator producing a wide (128+128 bit) composite code
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_width(true)
    }

    /// Accumulator with an explicit composite width
    #[must_use]
    pub fn with_width(wide: bool) -> Self {
        Self {
            data: DataHasher::new(),
            instance: blake3::Hasher::new(),
            filesize: 0,
            wide,
        }
    }

    /// Feed the next chunk
    pub fn update(&mut self, chunk: &[u8]) {
        self.data.update(chunk);
        self.instance.update(chunk);
        self.filesize += chunk.len() as u64;
    }

    /// Bytes fed so far
    #[inline]
    #[must_use]
    pub fn filesize(&self) -> u64 {
        self.filesize
    }

    /// Finish and produce the identifier
    #[must_use]
    pub fn finalize(self) -> ContentIdentifier {
        let data_digest = self.data.finalize();
        let instance_digest = *self.instance.finalize().as_bytes();

        let unit_codes = vec![
            IsccCode::unit_256(MainType::Data, &data_digest).to_string(),
            IsccCode::unit_256(MainType::Instance, &instance_digest).to_string(),
        ];
        let content_code =
            IsccCode::composite_256(&data_digest, &instance_digest, self.wide).to_string();

        ContentIdentifier {
            content_code,
            data_hash: format!("{BLAKE3_MULTIHASH_PREFIX}{}", hex::encode(instance_digest)),
            unit_codes,
            filesize: self.filesize,
        }
    }
}

impl Default for ContentAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Identify an ordered sequence of chunks
#[must_use]
pub fn identify_chunks<I, B>(chunks: I) -> ContentIdentifier
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut acc = ContentAccumulator::new();
    for chunk in chunks {
        acc.update(chunk.as_ref());
    }
    acc.finalize()
}

/// Identify a reader, pulling `chunk_size` bytes at a time in offset order
///
/// # Errors
/// Propagates read errors
pub fn identify_reader<R: Read>(mut reader: R, chunk_size: usize) -> io::Result<ContentIdentifier> {
    let mut acc = ContentAccumulator::new();
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        acc.update(&buf[..n]);
    }
    Ok(acc.finalize())
}
