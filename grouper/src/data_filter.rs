use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::unsafe_fields::UNSAFE_FIELDS;

/// Substituted in place of a sensitive value.
const FILTERED_PLACEHOLDER: &str = "[filtered]";

/// Possibly sensitive keys, compared against lowercased key names.
static SENSITIVE_KEYS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        // Authorization and sessions
        "auth",
        "authorization",
        "access_token",
        "accesstoken",
        "token",
        "jwt",
        "session",
        "sessionid",
        "session_id",
        // API keys and secure tokens
        "api_key",
        "apikey",
        "x-api-key",
        "x-auth-token",
        "bearer",
        "client_secret",
        "secret",
        "credentials",
        // Passwords
        "password",
        "passwd",
        "mysql_pwd",
        "oldpassword",
        "old-password",
        "old_password",
        "newpassword",
        "new-password",
        "new_password",
        // Encryption keys
        "private_key",
        "ssh_key",
        // Payments data
        "card",
        "cardnumber",
        "card[number]",
        "creditcard",
        "credit_card",
        "pan",
        "pin",
        "security_code",
        "stripetoken",
        "cloudpayments_public_id",
        "cloudpayments_secret",
        // Config and connections
        "dsn",
        // Personal data
        "ssn",
    ])
});

/// Bank card PAN patterns for the major payment networks, matched against a
/// digits-only rendition of the value.
static BANK_CARD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:4[0-9]{12}(?:[0-9]{3})?|[25][1-7][0-9]{14}|6(?:011|5[0-9][0-9])[0-9]{12}|3[47][0-9]{13}|3(?:0[0-5]|[68][0-9])[0-9]{11}|(?:2131|1800|35\d{3})\d{11})$",
    )
    .expect("bank card regex is valid")
});

/// Store-native object ids are 24 hex characters and must never be treated
/// as card numbers.
static OBJECT_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{24}$").expect("object id regex is valid"));

/// UUIDs, dashed or undashed, are exempt for the same reason.
static UUID_LIKE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}|[0-9a-fA-F]{32})$",
    )
    .expect("uuid regex is valid")
});

/// Scrubs sensitive data from the user-controlled payload fields before they
/// are persisted. Only the unsafe fields (`context`, `addons`) are touched;
/// the rest of the payload is collector-generated and trusted.
#[derive(Debug, Default, Clone, Copy)]
pub struct DataFilter;

impl DataFilter {
    pub fn new() -> Self {
        Self
    }

    /// Scrub the unsafe fields of an event payload in place.
    pub fn scrub_event(&self, payload: &mut Value) {
        let Some(map) = payload.as_object_mut() else {
            return;
        };
        for field in UNSAFE_FIELDS {
            if let Some(value) = map.get_mut(field) {
                scrub_field(value);
            }
        }
    }
}

fn scrub_field(value: &mut Value) {
    // An already-encoded field is an opaque string; nothing to scan.
    if value.is_string() {
        return;
    }
    if let Value::Object(map) = value {
        scrub_record(map);
    }
}

/// Walk nested records, filtering leaf entries. Sequences are treated as
/// leaves and left intact.
fn scrub_record(map: &mut Map<String, Value>) {
    for (key, value) in map.iter_mut() {
        if let Value::Object(inner) = value {
            scrub_record(inner);
        } else {
            filter_pan(value);
            filter_sensitive_key(key, value);
        }
    }
}

fn filter_pan(value: &mut Value) {
    let Some(text) = value.as_str() else {
        return;
    };
    if OBJECT_ID.is_match(text) || UUID_LIKE.is_match(text) {
        return;
    }
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    if BANK_CARD.is_match(&digits) {
        *value = Value::String(FILTERED_PLACEHOLDER.to_string());
    }
}

fn filter_sensitive_key(key: &str, value: &mut Value) {
    // Collections and nulls pass through untouched, whatever their key.
    if value.is_array() || value.is_null() {
        return;
    }
    if SENSITIVE_KEYS.contains(key.to_lowercase().as_str()) {
        *value = Value::String(FILTERED_PLACEHOLDER.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scrubbed(payload: Value) -> Value {
        let mut payload = payload;
        DataFilter::new().scrub_event(&mut payload);
        payload
    }

    #[test]
    fn sensitive_keys_are_replaced_case_insensitively() {
        let result = scrubbed(json!({
            "context": {"Password": "hunter2", "Authorization": "Bearer abc", "build": "42"}
        }));
        assert_eq!(result["context"]["Password"], "[filtered]");
        assert_eq!(result["context"]["Authorization"], "[filtered]");
        assert_eq!(result["context"]["build"], "42");
    }

    #[test]
    fn pan_numbers_are_replaced_even_with_separators() {
        let result = scrubbed(json!({
            "context": {"note": "4111 1111 1111 1111", "order": "A-123"}
        }));
        assert_eq!(result["context"]["note"], "[filtered]");
        assert_eq!(result["context"]["order"], "A-123");
    }

    #[test]
    fn object_ids_and_uuids_are_exempt_from_pan_filtering() {
        let result = scrubbed(json!({
            "context": {
                "ref": "507f1f77bcf86cd799439011",
                "trace": "9f86d081-8848-4c1d-9b93-0a9cb1a8e6b2"
            }
        }));
        assert_eq!(result["context"]["ref"], "507f1f77bcf86cd799439011");
        assert_eq!(
            result["context"]["trace"],
            "9f86d081-8848-4c1d-9b93-0a9cb1a8e6b2"
        );
    }

    #[test]
    fn nested_records_are_scrubbed() {
        let result = scrubbed(json!({
            "addons": {"request": {"headers": {"x-api-key": "k-123"}}}
        }));
        assert_eq!(
            result["addons"]["request"]["headers"]["x-api-key"],
            "[filtered]"
        );
    }

    #[test]
    fn only_unsafe_fields_are_touched() {
        let result = scrubbed(json!({
            "title": "password",
            "password": "not-scrubbed-here",
            "context": {"password": "scrubbed"}
        }));
        assert_eq!(result["password"], "not-scrubbed-here");
        assert_eq!(result["context"]["password"], "[filtered]");
    }

    #[test]
    fn already_encoded_string_fields_are_skipped() {
        let encoded = json!({"context": "{\"password\":\"x\"}"});
        assert_eq!(scrubbed(encoded.clone()), encoded);
    }
}
