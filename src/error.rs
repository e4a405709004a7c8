//! Error taxonomy for the bridge core.
//!
//! Framer/transport errors abort the current connection and trigger a
//! supervisor reconnect; validation errors abort only the single command
//! that raised them; protocol errors (appliance `code` field) are surfaced
//! as state updates and logged, never force a reconnect.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HcError {
    #[error("short frame: {0} bytes, need at least 32")]
    ShortFrame(usize),

    #[error("HMAC mismatch on inbound frame")]
    MacMismatch,

    #[error("invalid padding: pad_len={pad_len} plaintext_len={plaintext_len}")]
    PadError { pad_len: usize, plaintext_len: usize },

    #[error("uid {0} is not an integer")]
    InvalidUid(String),

    #[error("feature {uid} ({name}) has access {access}, refusing write")]
    InvalidAccess { uid: String, name: String, access: String },

    #[error("value {value} is not valid for feature {uid}: {reason}")]
    InvalidValue { uid: String, value: String, reason: String },

    #[error("program {program} is invalid: {reason}")]
    InvalidProgram { program: String, reason: String },

    #[error("option uid {0} is not valid for this device")]
    InvalidOption(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("appliance reported error code {code} for resource {resource}")]
    Protocol { code: i64, resource: String },

    #[error("unknown resource {0}")]
    UnknownResource(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("websocket closed")]
    Closed,
}
