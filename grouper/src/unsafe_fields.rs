use serde_json::Value;
use tracing::warn;

use crate::diff::Delta;

/// Payload fields holding arbitrary user-supplied nesting. Their keys can
/// contain characters the store rejects as field names, so they are stored
/// as opaque JSON strings and parsed back on read.
pub const UNSAFE_FIELDS: [&str; 2] = ["context", "addons"];

/// Stringify the unsafe fields of a payload before storage. Fields that are
/// absent or already strings are left alone.
pub fn encode_unsafe_fields(payload: &mut Value) {
    let Some(map) = payload.as_object_mut() else {
        return;
    };
    for field in UNSAFE_FIELDS {
        let Some(value) = map.get(field) else {
            continue;
        };
        if value.is_string() {
            continue;
        }
        let encoded = value.to_string();
        map.insert(field.to_string(), Value::String(encoded));
    }
}

/// Parse the unsafe fields of a stored payload back into structure. An
/// unparsable field is logged and left as the stored string.
pub fn decode_unsafe_fields(payload: &mut Value) {
    let Some(map) = payload.as_object_mut() else {
        return;
    };
    for field in UNSAFE_FIELDS {
        let Some(Value::String(raw)) = map.get(field) else {
            continue;
        };
        match serde_json::from_str::<Value>(raw) {
            Ok(decoded) => {
                map.insert(field.to_string(), decoded);
            }
            Err(parse_error) => {
                warn!(field, %parse_error, "failed to parse stored unsafe field");
            }
        }
    }
}

/// Wrap the unsafe-field entries of a record delta as opaque strings before
/// storage, mirroring what happens to the payloads the delta was computed
/// from. Deltas that are not records carry no store-visible keys.
pub fn encode_unsafe_delta(delta: &mut Delta) {
    let Delta::Record(entries) = delta else {
        return;
    };
    for field in UNSAFE_FIELDS {
        let Some(entry) = entries.get_mut(field) else {
            continue;
        };
        if matches!(entry, Delta::Encoded(_)) {
            continue;
        }
        match serde_json::to_string(entry) {
            Ok(encoded) => *entry = Delta::Encoded(encoded),
            Err(encode_error) => {
                warn!(field, %encode_error, "failed to encode unsafe delta entry");
            }
        }
    }
}

/// Parse the unsafe-field entries of a stored record delta back into
/// structure. An unparsable entry is logged and left encoded.
pub fn decode_unsafe_delta(delta: &mut Delta) {
    let Delta::Record(entries) = delta else {
        return;
    };
    for field in UNSAFE_FIELDS {
        let Some(Delta::Encoded(raw)) = entries.get_mut(field) else {
            continue;
        };
        match serde_json::from_str::<Delta>(raw) {
            Ok(decoded) => {
                entries.insert(field.to_string(), decoded);
            }
            Err(parse_error) => {
                warn!(field, %parse_error, "failed to parse stored unsafe delta entry");
            }
        }
    }
}
