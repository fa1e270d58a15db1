//! Identifier generation and user-key derivation.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Derive the opaque, tenant-scoped user key from a phone number.
///
/// The raw phone never leaves the process; everything downstream (audit
/// chain, exports, logs) keys on `HMAC-SHA256(pepper, phone)`. Without a
/// configured pepper (development only) an empty pepper is used, which keeps
/// the derivation deterministic but offers no secrecy.
pub fn derive_user_key(pepper: Option<&str>, phone_e164: &str) -> String {
    let pepper = pepper.unwrap_or("");
    // HMAC accepts any key length; this cannot fail
    let mut mac =
        HmacSha256::new_from_slice(pepper.as_bytes()).expect("hmac accepts any key length");
    mac.update(phone_e164.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}
