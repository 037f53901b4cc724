//! Webhook signature handling
//!
//! HMAC-SHA256 over the exact request body, sent as
//! `X-NemakiWare-Signature: sha256=<hex>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature
pub const SIGNATURE_HEADER: &str = "X-NemakiWare-Signature";

/// Prefix of the signature header value
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Compute the lowercase hex HMAC-SHA256 of `payload`.
///
/// Returns `None` when no secret is configured or the secret is empty.
pub fn compute_hmac_signature(payload: &str, secret: Option<&str>) -> Option<String> {
    let secret = secret.filter(|s| !s.is_empty())?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Full `sha256=<hex>` header value for `payload`
pub fn signature_header_value(payload: &str, secret: Option<&str>) -> Option<String> {
    compute_hmac_signature(payload, secret).map(|sig| format!("{}{}", SIGNATURE_PREFIX, sig))
}

/// Receiver-side check of a signature header against the raw body.
///
/// Accepts the header with or without the `sha256=` prefix.
pub fn verify_signature(payload: &str, secret: &str, header: &str) -> bool {
    let provided = header.trim();
    let provided = provided.strip_prefix(SIGNATURE_PREFIX).unwrap_or(provided);

    match compute_hmac_signature(payload, Some(secret)) {
        Some(expected) => constant_time_compare(&provided.to_ascii_lowercase(), &expected),
        None => false,
    }
}

/// Constant-time string comparison to prevent timing attacks
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }

    result == 0
}

/// Generate a random secret suitable for a new webhook registration
pub fn generate_webhook_secret() -> String {
    use rand::Rng;
    let secret: [u8; 32] = rand::thread_rng().gen();
    format!("whsec_{}", hex::encode(secret))
}
