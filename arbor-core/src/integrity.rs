//! Integrity: CRC32 over the frame body, stored big-endian in the trailer.

/// CRC32 (IEEE) of `body`.
pub fn checksum(body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    hasher.finalize()
}

/// Verify `body` against the expected checksum.
pub fn verify(body: &[u8], expected: u32) -> bool {
    checksum(body) == expected
}
