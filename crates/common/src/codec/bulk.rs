use bytes::Bytes;
use serde_json::{Map, Value};
use tracing::{error, instrument};

use crate::codec::compression::{brotli_compress, brotli_decompress, BROTLI, NO_COMPRESSION};
use crate::codec::split::split_to_fit;
use crate::domain::{
    Envelope, LifecycleError, LifecycleEvent, LifecycleEventKind, LifecycleResult,
    BULK_TYPE_NAME, COMPRESSION_ALGORITHM_PROPERTY, LEGACY_AUDIT_TYPE_NAME, NOOP_TYPE_NAME,
};

/// Events packed per bulk envelope before size-driven splitting
pub const BULK_CHUNK_SIZE: usize = 50;

const LOGGED_RAW_COMMANDS: usize = 5;

/// Packs events into bulk envelopes no larger than `max_publish_size_bytes`.
///
/// Events go into groups of at most [`BULK_CHUNK_SIZE`]; an oversized group is
/// split in half until every envelope fits. Payloads are Brotli compressed
/// unless `compress` is false.
#[instrument(skip(events), fields(event_count = events.len()))]
pub fn serialize_events(
    events: &[LifecycleEvent],
    max_publish_size_bytes: usize,
    compress: bool,
) -> LifecycleResult<Vec<Envelope>> {
    let compression = if compress { BROTLI } else { NO_COMPRESSION };
    let mut envelopes = Vec::new();

    for group in events.chunks(BULK_CHUNK_SIZE) {
        let packed = group
            .iter()
            .enumerate()
            .map(|(index, event)| -> LifecycleResult<PackedEvent> {
                Ok(PackedEvent {
                    index,
                    name: event.name(),
                    payload: event.to_payload()?,
                })
            })
            .collect::<LifecycleResult<Vec<_>>>()?;

        let mut encode = |slice: &[PackedEvent]| -> LifecycleResult<Bytes> {
            let encoded = encode_bulk(slice, compress)?;
            if slice.len() == 1 && encoded.len() > max_publish_size_bytes {
                log_oversized_event(&group[slice[0].index], encoded.len());
            }
            Ok(encoded)
        };

        for payload in split_to_fit(&packed, max_publish_size_bytes, &mut encode)? {
            envelopes.push(
                Envelope::new(BULK_TYPE_NAME, payload)
                    .with_property(COMPRESSION_ALGORITHM_PROPERTY, compression),
            );
        }
    }

    Ok(envelopes)
}

struct PackedEvent {
    index: usize,
    name: &'static str,
    payload: Value,
}

fn encode_bulk(slice: &[PackedEvent], compress: bool) -> LifecycleResult<Bytes> {
    let mut bulk: Map<String, Value> = Map::new();
    for event in slice {
        let entry = bulk
            .entry(event.name)
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = entry {
            items.push(event.payload.clone());
        }
    }

    let json = serde_json::to_vec(&bulk)?;
    if compress {
        Ok(Bytes::from(brotli_compress(&json)?))
    } else {
        Ok(Bytes::from(json))
    }
}

fn log_oversized_event(event: &LifecycleEvent, size: usize) {
    match event {
        LifecycleEvent::RawData(raw) => {
            let sample: Vec<String> = raw
                .pxs_commands
                .iter()
                .take(LOGGED_RAW_COMMANDS)
                .map(Value::to_string)
                .collect();
            error!(
                event_name = event.name(),
                command_type = %event.header().command_type,
                size = size,
                total_pxs_commands = raw.pxs_commands.len(),
                pxs_commands = ?sample,
                "Single event is too big to publish"
            );
        }
        _ => {
            error!(
                event_name = event.name(),
                command_type = %event.header().command_type,
                command_id = %event.command_id(),
                size = size,
                "Single event is too big to publish"
            );
        }
    }
}

/// Turns an envelope back into events.
///
/// Keep-alive and legacy audit envelopes yield no events. An unknown event name
/// anywhere in the envelope fails the whole envelope.
pub fn parse_envelope(envelope: &Envelope) -> LifecycleResult<Vec<LifecycleEvent>> {
    let type_name = envelope
        .type_name()
        .ok_or(LifecycleError::MissingProperty("TypeName"))?;

    if type_name != BULK_TYPE_NAME {
        if is_ignored(type_name) {
            return Ok(Vec::new());
        }
        let payload: Value = serde_json::from_slice(&envelope.payload)?;
        return Ok(parse_named(type_name, payload)?.into_iter().collect());
    }

    let json = match envelope.compression_algorithm() {
        Some(BROTLI) => brotli_decompress(&envelope.payload)?,
        Some(NO_COMPRESSION) | None => envelope.payload.to_vec(),
        Some(other) => return Err(LifecycleError::UnsupportedCompression(other.to_string())),
    };

    let bulk: Map<String, Value> = serde_json::from_slice(&json)?;
    let mut events = Vec::new();
    for (name, payloads) in bulk {
        let Value::Array(payloads) = payloads else {
            return Err(LifecycleError::Validation(format!(
                "bulk entry {name} is not an array"
            )));
        };
        for payload in payloads {
            if let Some(event) = parse_named(&name, payload)? {
                events.push(event);
            }
        }
    }

    Ok(events)
}

fn is_ignored(name: &str) -> bool {
    name == NOOP_TYPE_NAME || name == LEGACY_AUDIT_TYPE_NAME
}

fn parse_named(name: &str, payload: Value) -> LifecycleResult<Option<LifecycleEvent>> {
    if is_ignored(name) {
        return Ok(None);
    }
    let kind = LifecycleEventKind::from_name(name)
        .ok_or_else(|| LifecycleError::UnknownEventType(name.to_string()))?;
    LifecycleEvent::from_payload(kind, payload).map(Some)
}
