//! Error types for the session engine (thiserror-based).

use std::io;

use thiserror::Error;

use crate::config::CodecKind;

/// Errors surfaced to the command surface by `SessionManager::start`.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid stream address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Render surface refused to register a frame source")]
    RegistrationFailed,

    #[error("Connection to {address} failed: {source}")]
    ConnectFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Decoder error: {0}")]
    Decoder(#[from] DecodeError),

    #[error("Failed to spawn session thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("Invalid engine configuration: {0}")]
    Config(String),

    #[error("Session thread exited before reporting readiness")]
    ThreadVanished,
}

/// Fatal wire-framing errors. Buffer overflow is not one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("Payload length {length} exceeds the {limit} byte ceiling")]
    PayloadTooLarge { length: u32, limit: u32 },

    #[error("Payload of {length} bytes does not fit the 32-bit length field")]
    PayloadUnencodable { length: usize },
}

/// Decoder errors.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("No decoder available for {0:?}")]
    UnsupportedCodec(CodecKind),

    #[error("Decoder open failed for {codec:?}: {reason}")]
    OpenFailed { codec: CodecKind, reason: String },

    #[error("Fault inside native decode call: {0}")]
    Fault(String),

    #[error("Decoder backend error: {0}")]
    Backend(String),
}

/// Pixel conversion errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvertError {
    #[error("Cannot convert {format} at {width}x{height} to RGBA")]
    ConversionUnsupported {
        format: String,
        width: u32,
        height: u32,
    },

    #[error("Fault inside native conversion call: {0}")]
    Fault(String),

    #[error("Destination buffer is {actual} bytes, expected {expected}")]
    DestinationMismatch { expected: usize, actual: usize },

    #[error("Scaler backend error: {0}")]
    Backend(String),
}

/// Render a caught panic payload as text for the fault log.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
