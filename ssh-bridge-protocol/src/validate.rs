//! Decode and validate the JSON payloads of control frames into the
//! strongly-typed records in `payload`. Every failure here is fatal: the
//! daemon/client turn a `ValidationError` into an `EXCEPTION` frame rather
//! than a recoverable per-operation failure.

use base64::Engine;
use thiserror::Error;

use crate::payload::{ChallengeResponsePayload, ConnectParams, ConnectParamsWire, ReuseParams, ReuseParamsWire};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("username must not be empty")]
    EmptyUsername,
    #[error("hostname must not be empty")]
    EmptyHostname,
    #[error("port must be in 1..=65535, got {0}")]
    BadPort(u32),
    #[error("passphrase requires privateKey")]
    PassphraseWithoutKey,
    #[error("privateKeyEncoded requires privateKey")]
    EncodedFlagWithoutKey,
    #[error("privateKey is not valid base64: {0}")]
    BadBase64(#[from] base64::DecodeError),
    #[error("command must not be empty")]
    EmptyCommand,
    #[error("command is not valid UTF-8")]
    NonUtf8Command,
    #[error("command contains a control character at byte offset {0}")]
    ControlCharacter(usize),
}

const DEFAULT_PORT: u32 = 22;

fn validate_port(port: Option<u32>) -> Result<u16, ValidationError> {
    let port = port.unwrap_or(DEFAULT_PORT);
    if port == 0 || port > 65535 {
        return Err(ValidationError::BadPort(port));
    }
    Ok(port as u16)
}

pub fn validate_reuse(bytes: &[u8]) -> Result<ReuseParams, ValidationError> {
    let wire: ReuseParamsWire = serde_json::from_slice(bytes)?;
    if wire.username.is_empty() {
        return Err(ValidationError::EmptyUsername);
    }
    if wire.hostname.is_empty() {
        return Err(ValidationError::EmptyHostname);
    }
    let port = validate_port(wire.port)?;

    Ok(ReuseParams {
        username: wire.username,
        hostname: wire.hostname.to_lowercase(),
        port,
        share_key: wire.share_key,
    })
}

pub fn validate_connect(bytes: &[u8]) -> Result<ConnectParams, ValidationError> {
    let wire: ConnectParamsWire = serde_json::from_slice(bytes)?;
    if wire.username.is_empty() {
        return Err(ValidationError::EmptyUsername);
    }
    if wire.hostname.is_empty() {
        return Err(ValidationError::EmptyHostname);
    }
    let port = validate_port(wire.port)?;

    if wire.private_key.is_none() {
        if wire.passphrase.is_some() {
            return Err(ValidationError::PassphraseWithoutKey);
        }
        if wire.private_key_encoded.unwrap_or(false) {
            return Err(ValidationError::EncodedFlagWithoutKey);
        }
    }

    let private_key = match wire.private_key {
        Some(key) => {
            if wire.private_key_encoded.unwrap_or(false) {
                Some(base64::engine::general_purpose::STANDARD.decode(key)?)
            } else {
                Some(key.into_bytes())
            }
        }
        None => None,
    };

    Ok(ConnectParams {
        username: wire.username,
        hostname: wire.hostname.to_lowercase(),
        port,
        share_key: wire.share_key,
        fingerprint: wire.fingerprint,
        reusable: wire.reusable.unwrap_or(false),
        private_key,
        passphrase: wire.passphrase,
        password: wire.password,
        try_keyboard: wire.try_keyboard.unwrap_or(false),
    })
}

pub fn validate_challenge_response(bytes: &[u8]) -> Result<ChallengeResponsePayload, ValidationError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Control characters forbidden in command strings:
/// `[U+0000, U+001F] ∪ [U+007F, U+009F]`.
fn is_forbidden_control(c: char) -> bool {
    let c = c as u32;
    (0x00..=0x1F).contains(&c) || (0x7F..=0x9F).contains(&c)
}

pub fn validate_command(bytes: &[u8]) -> Result<String, ValidationError> {
    let command = std::str::from_utf8(bytes).map_err(|_| ValidationError::NonUtf8Command)?;
    if command.is_empty() {
        return Err(ValidationError::EmptyCommand);
    }
    if let Some((offset, _)) = command.char_indices().find(|(_, c)| is_forbidden_control(*c)) {
        return Err(ValidationError::ControlCharacter(offset));
    }
    Ok(command.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuse_lowercases_hostname_and_defaults_port() {
        let r = validate_reuse(br#"{"username":"u","hostname":"HOST.example"}"#).unwrap();
        assert_eq!(r.hostname, "host.example");
        assert_eq!(r.port, 22);
        assert_eq!(r.share_key, None);
    }

    #[test]
    fn reuse_rejects_empty_username() {
        let err = validate_reuse(br#"{"username":"","hostname":"h"}"#).unwrap_err();
        assert!(matches!(err, ValidationError::EmptyUsername));
    }

    #[test]
    fn port_boundaries() {
        assert!(validate_reuse(br#"{"username":"u","hostname":"h","port":0}"#).is_err());
        assert!(validate_reuse(br#"{"username":"u","hostname":"h","port":65536}"#).is_err());
        assert!(validate_reuse(br#"{"username":"u","hostname":"h","port":1}"#).is_ok());
        assert!(validate_reuse(br#"{"username":"u","hostname":"h","port":65535}"#).is_ok());
    }

    #[test]
    fn connect_rejects_passphrase_without_key() {
        let err = validate_connect(br#"{"username":"u","hostname":"h","passphrase":"p"}"#).unwrap_err();
        assert!(matches!(err, ValidationError::PassphraseWithoutKey));
    }

    #[test]
    fn connect_rejects_encoded_flag_without_key() {
        let err =
            validate_connect(br#"{"username":"u","hostname":"h","privateKeyEncoded":true}"#).unwrap_err();
        assert!(matches!(err, ValidationError::EncodedFlagWithoutKey));
    }

    #[test]
    fn connect_decodes_base64_private_key() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"raw-key-bytes");
        let body = format!(
            r#"{{"username":"u","hostname":"h","privateKey":"{encoded}","privateKeyEncoded":true}}"#,
        );
        let params = validate_connect(body.as_bytes()).unwrap();
        assert_eq!(params.private_key.unwrap(), b"raw-key-bytes");
    }

    #[test]
    fn connect_leaves_unencoded_private_key_as_utf8_bytes() {
        let body = br#"{"username":"u","hostname":"h","privateKey":"-----BEGIN KEY-----"}"#;
        let params = validate_connect(body).unwrap();
        assert_eq!(params.private_key.unwrap(), b"-----BEGIN KEY-----".to_vec());
    }

    #[test]
    fn command_rejects_control_characters() {
        for bad in [&b"a\nb"[..], &b"a\tb"[..], &b"a\x00b"[..], &b"a\x7fb"[..]] {
            let err = validate_command(bad).unwrap_err();
            assert!(matches!(err, ValidationError::ControlCharacter(_)));
        }
    }

    #[test]
    fn command_rejects_empty() {
        assert!(matches!(validate_command(b"").unwrap_err(), ValidationError::EmptyCommand));
    }

    #[test]
    fn command_accepts_plain_text() {
        assert_eq!(validate_command(b"echo hello").unwrap(), "echo hello");
    }
}
