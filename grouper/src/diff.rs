use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structural difference between an original payload and a repeat payload.
///
/// Deltas are stored instead of full repeat payloads; `merge` reconstructs
/// the repeat from the original record. The representation is deliberately
/// lossy in three documented ways:
/// - keys present in the original but absent from the repeat are never
///   represented (removal is rare and reconstructable from the original);
/// - sequence slots at or beyond the repeat's length are unrepresented;
/// - a nested shape mismatch stores the `Incomparable` marker verbatim and
///   discards the new value, so `merge` keeps the original at that position.
///
/// `Encoded` never comes out of `diff`: it wraps a serialized sub-delta for
/// payload fields whose keys the store rejects, the same treatment the
/// stored payloads themselves get. `merge` decodes it transparently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Delta {
    Unchanged,
    Incomparable,
    Replace(Value),
    Record(BTreeMap<String, Delta>),
    Seq(Vec<Delta>),
    Encoded(String),
}

impl Delta {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Delta::Unchanged)
    }
}

/// Compute the delta that turns `a` into `b`.
pub fn diff(a: &Value, b: &Value) -> Delta {
    match (a, b) {
        (Value::Object(a_map), Value::Object(b_map)) => {
            let mut entries = BTreeMap::new();
            for (key, b_value) in b_map {
                let delta = match a_map.get(key) {
                    Some(a_value) => diff(a_value, b_value),
                    None => Delta::Replace(b_value.clone()),
                };
                if !delta.is_unchanged() {
                    entries.insert(key.clone(), delta);
                }
            }
            if entries.is_empty() {
                Delta::Unchanged
            } else {
                Delta::Record(entries)
            }
        }
        (Value::Array(a_items), Value::Array(b_items)) => {
            let deltas: Vec<Delta> = b_items
                .iter()
                .enumerate()
                .map(|(i, b_item)| match a_items.get(i) {
                    Some(a_item) => diff(a_item, b_item),
                    None => Delta::Replace(b_item.clone()),
                })
                .collect();
            if deltas.iter().all(Delta::is_unchanged) {
                Delta::Unchanged
            } else {
                Delta::Seq(deltas)
            }
        }
        // Mixing a collection with a scalar, or a record with a sequence,
        // is not diffable.
        (Value::Object(_) | Value::Array(_), _) | (_, Value::Object(_) | Value::Array(_)) => {
            Delta::Incomparable
        }
        (a_scalar, b_scalar) => {
            if a_scalar == b_scalar {
                Delta::Unchanged
            } else {
                Delta::Replace(b_scalar.clone())
            }
        }
    }
}

/// Reconstruct the repeat payload by walking `delta` over the original `a`.
pub fn merge(a: &Value, delta: &Delta) -> Value {
    match delta {
        Delta::Unchanged | Delta::Incomparable => a.clone(),
        Delta::Replace(value) => value.clone(),
        Delta::Record(entries) => {
            let mut merged = match a {
                Value::Object(map) => map.clone(),
                _ => serde_json::Map::new(),
            };
            for (key, entry) in entries {
                let base = merged.get(key).cloned().unwrap_or(Value::Null);
                merged.insert(key.clone(), merge(&base, entry));
            }
            Value::Object(merged)
        }
        Delta::Encoded(raw) => match serde_json::from_str::<Delta>(raw) {
            Ok(inner) => merge(a, &inner),
            // An unparsable stored delta cannot be applied; keep the
            // original value.
            Err(_) => a.clone(),
        },
        Delta::Seq(deltas) => {
            let mut merged = match a {
                Value::Array(items) => items.clone(),
                _ => Vec::new(),
            };
            for (i, entry) in deltas.iter().enumerate() {
                if i < merged.len() {
                    let updated = merge(&merged[i], entry);
                    merged[i] = updated;
                } else {
                    merged.push(merge(&Value::Null, entry));
                }
            }
            Value::Array(merged)
        }
    }
}
