// ABOUTME: Gzip encoding of request bodies above a size threshold.

use std::io::Write;

use flate2::Compression;
use flate2::write::GzEncoder;

/// Bodies shorter than this are sent uncompressed.
pub const MIN_GZIP_LENGTH: usize = 1400;

pub fn should_compress(body: &[u8], enabled: bool) -> bool {
    enabled && body.len() >= MIN_GZIP_LENGTH
}

pub fn gzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}
