//! Host key fingerprinting: base64(SHA-256(public key)), the format the
//! caller supplies and expects back, versus russh's own hex-rendered
//! fingerprint type.

use base64::Engine;
use russh::keys::{HashAlg, PublicKey};

pub fn base64_sha256(key: &PublicKey) -> String {
    let fp = key.fingerprint(HashAlg::Sha256);
    base64::engine::general_purpose::STANDARD.encode(fp.as_bytes())
}

/// Returns `Ok(fingerprint)` if `expected` is absent or matches, else the
/// mismatch error carrying both values.
pub fn verify(key: &PublicKey, expected: Option<&str>) -> Result<String, crate::error::SshAdapterError> {
    let actual = base64_sha256(key);
    match expected {
        Some(expected) if expected != actual => {
            Err(crate::error::SshAdapterError::FingerprintMismatch {
                expected: expected.to_string(),
                received: actual,
            })
        }
        _ => Ok(actual),
    }
}
