use hmac::{Hmac, Mac};
use sha2::Sha256;

// ============================================================================
// Webhook Signature Signer
// ============================================================================
//
// Computes the `X-Webhook-Signature` header value so receivers holding the
// shared secret can authenticate a callback. The payload must already be the
// exact bytes sent on the wire; event maps are ordered, so serialization is
// canonical and signatures are deterministic.
//
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over the UTF-8 payload bytes, keyed by `secret`.
/// Returns `"sha256=" + hex(digest)`.
pub fn sign(payload: &str, secret: &str) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length
        Err(_) => unreachable!("HMAC-SHA256 key length is unrestricted"),
    };
    mac.update(payload.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
