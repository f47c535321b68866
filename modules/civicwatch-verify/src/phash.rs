//! Difference-hash perceptual fingerprints.
//!
//! A dHash survives resizing, recompression and minor color shifts because
//! it encodes only the sign of adjacent-pixel brightness gradients on a
//! tiny grayscale grid. It does not survive rotation or cropping, which is
//! acceptable: two citizens photographing the same pothole rarely rotate
//! their phones between shots, and the geo proximity path backstops it.

use image::imageops::FilterType;
use image::GrayImage;
use serde::{Deserialize, Serialize};

use civicwatch_common::VerifyError;

/// Hashes are 64 bits: 8 rows of 8 left-vs-right comparisons on a 9x8 grid.
pub const DHASH_BITS: u32 = 64;

/// Hamming distance at or below this means "visually similar".
pub const DEFAULT_SIMILARITY_THRESHOLD: u32 = 10;

/// 64-bit difference hash. The top 16 bits double as the bucket key used
/// for candidate lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DHash(pub u64);

impl DHash {
    pub fn hamming_distance(self, other: DHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    pub fn is_similar_to(self, other: DHash, threshold: u32) -> bool {
        self.hamming_distance(other) <= threshold
    }

    /// Index key for fast candidate lookup: the first 16 bits of the hash.
    /// Rows are emitted top-down, so this is the top two rows' gradients —
    /// stable across recompression for near-identical shots.
    pub fn bucket(self) -> u16 {
        (self.0 >> 48) as u16
    }
}

impl std::fmt::Display for DHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl std::str::FromStr for DHash {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(DHash)
    }
}

/// Hash encoded image bytes. Decode failure is the one fallible step and is
/// non-fatal to ingestion: the caller stores `None` and moves on.
pub fn dhash_bytes(bytes: &[u8]) -> Result<DHash, VerifyError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| VerifyError::ImageDecode(e.to_string()))?;
    Ok(dhash_gray(&img.to_luma8()))
}

/// Hash an already-decoded grayscale raster. Pure and infallible — safe from
/// any number of concurrent workers.
pub fn dhash_gray(gray: &GrayImage) -> DHash {
    let small = image::imageops::resize(gray, 9, 8, FilterType::Triangle);
    let mut bits = 0u64;
    for y in 0..8 {
        for x in 0..8 {
            bits <<= 1;
            if small.get_pixel(x, y)[0] > small.get_pixel(x + 1, y)[0] {
                bits |= 1;
            }
        }
    }
    DHash(bits)
}
