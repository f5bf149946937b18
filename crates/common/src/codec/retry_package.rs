use bytes::Bytes;

use crate::codec::compression::{gzip_compress, gzip_decompress};
use crate::codec::split::split_to_fit;
use crate::domain::{Envelope, LifecycleResult};

/// Gzip-compressed JSON array of envelopes, the body of a retry queue message
pub fn package(envelopes: &[Envelope]) -> LifecycleResult<Bytes> {
    let json = serde_json::to_vec(envelopes)?;
    Ok(Bytes::from(gzip_compress(&json)?))
}

pub fn unpackage(body: &[u8]) -> LifecycleResult<Vec<Envelope>> {
    let json = gzip_decompress(body)?;
    Ok(serde_json::from_slice(&json)?)
}

/// Packages envelopes into as many queue messages as needed to respect `max_message_size`
pub fn package_with_split(envelopes: &[Envelope], max_message_size: usize) -> LifecycleResult<Vec<Bytes>> {
    split_to_fit(envelopes, max_message_size, &mut |slice: &[Envelope]| package(slice))
}
