//! Bloom filter sizing and persistence
//!
//! Filters are `bloomfilter::Bloom` values. The persisted form carries the
//! bitmap together with the sip keys, so a filter saved by one process hashes
//! identically when another process loads it.

use bloomfilter::Bloom;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

pub type VideoFilter = Bloom<String>;

#[derive(Debug, Serialize, Deserialize)]
struct StoredFilter {
    bitmap: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
    sip_keys: [(u64, u64); 2],
}

/// Empty filter sized for `expected_items` at `false_positive_rate`.
pub fn sized_filter(expected_items: usize, false_positive_rate: f64) -> VideoFilter {
    Bloom::new_for_fp_rate(
        expected_items.max(1),
        false_positive_rate.clamp(f64::MIN_POSITIVE, 0.5),
    )
}

pub fn encode(filter: &VideoFilter) -> Result<Vec<u8>> {
    let stored = StoredFilter {
        bitmap: filter.bitmap(),
        num_bits: filter.number_of_bits(),
        num_hashes: filter.number_of_hash_functions(),
        sip_keys: filter.sip_keys(),
    };
    Ok(bincode::serialize(&stored)?)
}

pub fn decode(bytes: &[u8]) -> Result<VideoFilter> {
    let stored: StoredFilter = bincode::deserialize(bytes)?;
    if stored.num_bits == 0
        || stored.num_hashes == 0
        || (stored.bitmap.len() as u64) * 8 < stored.num_bits
    {
        return Err(AppError::Codec(format!(
            "bloom filter has {} bytes for {} bits and {} hashes",
            stored.bitmap.len(),
            stored.num_bits,
            stored.num_hashes
        )));
    }

    Ok(Bloom::from_existing(
        &stored.bitmap,
        stored.num_bits,
        stored.num_hashes,
        stored.sip_keys,
    ))
}
