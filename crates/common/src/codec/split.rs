use bytes::Bytes;

use crate::domain::{LifecycleError, LifecycleResult};

/// Encodes `items` into as few blobs as possible, each at most `max_size` bytes.
///
/// A range that encodes too large is halved (left gets `floor(n / 2)`) and each
/// half is encoded again. Item order is preserved across the output. A single
/// item that still does not fit fails with `EventTooLarge`.
pub fn split_to_fit<T, F>(items: &[T], max_size: usize, encode: &mut F) -> LifecycleResult<Vec<Bytes>>
where
    F: FnMut(&[T]) -> LifecycleResult<Bytes>,
{
    let mut chunks = Vec::new();
    split_recursive(items, max_size, encode, &mut chunks)?;
    Ok(chunks)
}

fn split_recursive<T, F>(
    items: &[T],
    max_size: usize,
    encode: &mut F,
    chunks: &mut Vec<Bytes>,
) -> LifecycleResult<()>
where
    F: FnMut(&[T]) -> LifecycleResult<Bytes>,
{
    if items.is_empty() {
        return Ok(());
    }

    let encoded = encode(items)?;
    if encoded.len() <= max_size {
        chunks.push(encoded);
        return Ok(());
    }

    if items.len() == 1 {
        return Err(LifecycleError::EventTooLarge {
            size: encoded.len(),
            max: max_size,
        });
    }

    let (left, right) = items.split_at(items.len() / 2);
    split_recursive(left, max_size, encode, chunks)?;
    split_recursive(right, max_size, encode, chunks)
}
