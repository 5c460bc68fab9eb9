#![forbid(unsafe_code)]

use std::ops::Range;

use crc32fast::Hasher;

/// CRC over a log page with the stored checksum field read as zeros.
///
/// `crc_range` is at most four bytes wide and lies inside `page`.
pub fn page_crc32(page: &[u8], crc_range: Range<usize>) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&page[..crc_range.start]);
    hasher.update(&[0u8; 4][..crc_range.len()]);
    hasher.update(&page[crc_range.end..]);
    hasher.finalize()
}

/// CRC over record pieces that may straddle page boundaries.
pub fn chunks_crc32(chunks: &[&[u8]]) -> u32 {
    chunks
        .iter()
        .fold(Hasher::new(), |mut hasher, chunk| {
            hasher.update(chunk);
            hasher
        })
        .finalize()
}
