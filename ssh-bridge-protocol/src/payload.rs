//! JSON payload types carried inside frames. These are the typed records
//! that request validators (see `validate`) decode wire JSON into; unknown
//! fields are ignored on decode, missing required fields are a decode
//! error that the caller turns into a fatal protocol violation.

use serde::{Deserialize, Serialize};

/// Rows/cols clamped to [1, 512] on both ends of the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub rows: u16,
    pub cols: u16,
}

impl Default for Size {
    fn default() -> Size {
        Size { rows: 24, cols: 80 }
    }
}

pub const MIN_DIMENSION: u16 = 1;
pub const MAX_DIMENSION: u16 = 512;

/// Apply the resize clamp rule: a dimension <= 0 leaves that axis
/// unchanged; otherwise the upper bound is applied after.
///
/// `requested` uses `i32` so callers can represent "0 or negative" from a
/// wire value that validation only constrains to fit in an `i32`.
pub fn clamp_resize(current: Size, requested_rows: i32, requested_cols: i32) -> Size {
    let rows = if requested_rows <= 0 {
        current.rows
    } else {
        (requested_rows as u16).min(MAX_DIMENSION).max(MIN_DIMENSION)
    };
    let cols = if requested_cols <= 0 {
        current.cols
    } else {
        (requested_cols as u16).min(MAX_DIMENSION).max(MIN_DIMENSION)
    };
    Size { rows, cols }
}

/// Wire payload of a `REUSE` frame, prior to hostname-lowercasing and
/// default-port substitution (see `validate::validate_reuse`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReuseParamsWire {
    pub username: String,
    pub hostname: String,
    #[serde(default)]
    pub port: Option<u32>,
    #[serde(rename = "shareKey", default)]
    pub share_key: Option<String>,
}

/// Validated `REUSE` parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReuseParams {
    pub username: String,
    pub hostname: String,
    pub port: u16,
    pub share_key: Option<String>,
}

/// Wire payload of a `CONNECT` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectParamsWire {
    pub username: String,
    pub hostname: String,
    #[serde(default)]
    pub port: Option<u32>,
    #[serde(rename = "shareKey", default)]
    pub share_key: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub reusable: Option<bool>,
    #[serde(rename = "privateKey", default)]
    pub private_key: Option<String>,
    #[serde(rename = "privateKeyEncoded", default)]
    pub private_key_encoded: Option<bool>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(rename = "tryKeyboard", default)]
    pub try_keyboard: Option<bool>,
}

/// Validated `CONNECT` parameters. `private_key` has already been
/// base64-decoded when `privateKeyEncoded` was set.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub username: String,
    pub hostname: String,
    pub port: u16,
    pub share_key: Option<String>,
    pub fingerprint: Option<String>,
    pub reusable: bool,
    pub private_key: Option<Vec<u8>>,
    pub passphrase: Option<String>,
    pub password: Option<String>,
    pub try_keyboard: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeResponsePayload {
    pub responses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengePayload {
    pub title: String,
    pub instructions: String,
    pub language: String,
    pub prompts: Vec<ChallengePrompt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengePrompt {
    pub prompt: String,
    pub echo: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedPayload {
    pub fingerprint: String,
    pub banner: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasonPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultPayload {
    #[serde(default)]
    pub code: Option<i32>,
    #[serde(default)]
    pub signal: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedPayload {
    #[serde(rename = "shareKey")]
    pub share_key: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResizePayload {
    pub rows: i32,
    pub cols: i32,
}
