//! HMAC-SHA256 batch signing
//!
//! The signed message is the canonical JSON of `{"rows":[...]}`: the rows in
//! push order, each with the fixed field order of [`CaptureEvent`], and no
//! whitespace. The receiver rebuilds the same bytes from the `rows` it got and
//! compares signatures. Output is standard padded base64.

use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use crate::error::{Error, Result};
use crate::types::{Batch, CaptureEvent, SealedBatch};

type HmacSha256 = Hmac<Sha256>;

/// What gets signed; the signature itself is never part of it
#[derive(Serialize)]
struct SigningPayload<'a> {
    rows: &'a [CaptureEvent],
}

/// Canonical bytes the signature covers
pub fn canonical_payload(rows: &[CaptureEvent]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&SigningPayload { rows })?)
}

fn mac_for(secret: &str) -> Result<HmacSha256> {
    if secret.is_empty() {
        return Err(Error::Signing("secret is empty".to_string()));
    }
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Signing(format!("invalid secret: {}", e)))
}

/// Sign rows with the shared secret
pub fn sign(rows: &[CaptureEvent], secret: &str) -> Result<String> {
    let mut mac = mac_for(secret)?;
    mac.update(&canonical_payload(rows)?);
    Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

/// Check a signature in constant time
pub fn verify(rows: &[CaptureEvent], secret: &str, signature: &str) -> Result<bool> {
    let expected = match base64::engine::general_purpose::STANDARD.decode(signature) {
        Ok(bytes) => bytes,
        Err(_) => return Ok(false),
    };
    let mut mac = mac_for(secret)?;
    mac.update(&canonical_payload(rows)?);
    Ok(mac.verify_slice(&expected).is_ok())
}

/// Sign rows and fix the wire body. Happens once per batch.
pub fn seal(rows: Vec<CaptureEvent>, secret: &str) -> Result<SealedBatch> {
    let signature = sign(&rows, secret)?;
    SealedBatch::new(Batch { rows, signature })
}
