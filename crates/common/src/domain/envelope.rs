use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

pub const TYPE_NAME_PROPERTY: &str = "TypeName";
pub const COMPRESSION_ALGORITHM_PROPERTY: &str = "CompressionAlgorithm";

/// Type name that marks a bulk envelope holding several named event arrays
pub const BULK_TYPE_NAME: &str = "$bulk$";

/// Keep-alive marker, parsed to no event
pub const NOOP_TYPE_NAME: &str = "noop";

/// Legacy audit events still present on old partitions, parsed to no event
pub const LEGACY_AUDIT_TYPE_NAME: &str = "CommandIngestionAudit";

/// Opaque transport unit: a property bag plus payload bytes
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Properties", default)]
    pub properties: BTreeMap<String, String>,
    #[serde(
        rename = "Data",
        serialize_with = "serialize_base64",
        deserialize_with = "deserialize_base64"
    )]
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(type_name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert(TYPE_NAME_PROPERTY.to_string(), type_name.into());
        Self {
            properties,
            payload: payload.into(),
        }
    }

    /// Five zero bytes tagged `noop`, used to keep idle partitions warm
    pub fn noop() -> Self {
        Self::new(NOOP_TYPE_NAME, Bytes::from_static(&[0u8; 5]))
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn type_name(&self) -> Option<&str> {
        self.property(TYPE_NAME_PROPERTY)
    }

    pub fn compression_algorithm(&self) -> Option<&str> {
        self.property(COMPRESSION_ALGORITHM_PROPERTY)
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Bytes this envelope occupies on the wire, properties included
    pub fn size(&self) -> usize {
        self.payload.len()
            + self
                .properties
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

fn serialize_base64<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(payload))
}

fn deserialize_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded.as_bytes())
        .map(Bytes::from)
        .map_err(serde::de::Error::custom)
}
