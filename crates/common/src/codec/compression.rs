use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};

use crate::domain::LifecycleResult;

pub const BROTLI: &str = "Brotli";
pub const NO_COMPRESSION: &str = "None";

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_LG_WINDOW: u32 = 22;

pub fn brotli_compress(data: &[u8]) -> LifecycleResult<Vec<u8>> {
    let mut writer = brotli::CompressorWriter::new(
        Vec::new(),
        BROTLI_BUFFER_SIZE,
        BROTLI_QUALITY,
        BROTLI_LG_WINDOW,
    );
    writer.write_all(data)?;
    writer.flush()?;
    Ok(writer.into_inner())
}

pub fn brotli_decompress(data: &[u8]) -> LifecycleResult<Vec<u8>> {
    let mut decompressed = Vec::new();
    brotli::Decompressor::new(data, BROTLI_BUFFER_SIZE).read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

pub fn gzip_compress(data: &[u8]) -> LifecycleResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn gzip_decompress(data: &[u8]) -> LifecycleResult<Vec<u8>> {
    let mut decompressed = Vec::new();
    GzDecoder::new(data).read_to_end(&mut decompressed)?;
    Ok(decompressed)
}
