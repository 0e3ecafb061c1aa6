//! The metadata channel.
//!
//! Callers pass a map of transport-level values alongside the payload:
//! `port` routes to a sub-schema when the schema declares `ports`, and any
//! name the schema's `metadata` list declares is copied into the decoded
//! record. Nested entries are addressed by dotted path with numeric list
//! indices, e.g. `rx_metadata.0.rssi`. Unknown keys are ignored.

use crate::value::{Record, Value};

/// Caller-supplied metadata: `port`, `received_at`, `rx_metadata`, …
pub type Metadata = Record;

/// The transport port, when present and integral.
pub fn port_of(metadata: Option<&Metadata>) -> Option<u32> {
    metadata?
        .get("port")
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
}

/// Resolves a dotted path (`rx_metadata.0.rssi`) into the metadata tree.
pub fn lookup_path<'a>(metadata: &'a Metadata, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = metadata.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Map(map) => map.get(segment)?,
            Value::List(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Metadata {
        let mut gateway = Record::new();
        gateway.insert("rssi".into(), Value::Int(-107));
        gateway.insert("snr".into(), Value::Float(5.2));
        let mut metadata = Metadata::new();
        metadata.insert("port".into(), Value::UInt(5));
        metadata.insert("dev_eui".into(), Value::from("70B3D57ED0001234"));
        metadata.insert("rx_metadata".into(), Value::List(vec![Value::Map(gateway)]));
        metadata
    }

    #[test]
    fn port_extraction() {
        let metadata = sample();
        assert_eq!(port_of(Some(&metadata)), Some(5));
        assert_eq!(port_of(None), None);
    }

    #[test]
    fn dotted_paths_with_list_indices() {
        let metadata = sample();
        assert_eq!(
            lookup_path(&metadata, "rx_metadata.0.rssi"),
            Some(&Value::Int(-107))
        );
        assert_eq!(lookup_path(&metadata, "rx_metadata.1.rssi"), None);
        assert_eq!(lookup_path(&metadata, "dev_eui").and_then(Value::as_str), Some("70B3D57ED0001234"));
        assert_eq!(lookup_path(&metadata, "nothing.here"), None);
    }
}
