use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Deterministic fingerprint of "the same logical error": a keyed hash of
/// the catcher type and the event title, and nothing else, so near-identical
/// repeats (different timestamps, stack noise) land in one group.
pub fn group_hash(secret: &str, catcher_type: &str, title: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC-SHA256 accepts keys of any length");
    mac.update(catcher_type.as_bytes());
    mac.update(title.as_bytes());
    format!("{:x}", mac.finalize().into_bytes())
}
