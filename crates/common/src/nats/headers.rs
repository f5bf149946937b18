use async_nats::HeaderMap;
use bytes::Bytes;

use crate::domain::{Envelope, COMPRESSION_ALGORITHM_PROPERTY, TYPE_NAME_PROPERTY};

const CARRIED_PROPERTIES: [&str; 2] = [TYPE_NAME_PROPERTY, COMPRESSION_ALGORITHM_PROPERTY];

pub fn envelope_headers(envelope: &Envelope) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for key in CARRIED_PROPERTIES {
        if let Some(value) = envelope.property(key) {
            headers.insert(key, value);
        }
    }
    headers
}

pub fn envelope_from_parts(headers: Option<&HeaderMap>, payload: Bytes) -> Envelope {
    let mut envelope = Envelope {
        payload,
        ..Default::default()
    };
    if let Some(headers) = headers {
        for key in CARRIED_PROPERTIES {
            if let Some(value) = headers.get(key) {
                envelope
                    .properties
                    .insert(key.to_string(), value.as_str().to_string());
            }
        }
    }
    envelope
}
