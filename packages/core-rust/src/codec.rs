//! Envelope serialization.
//!
//! `MsgPack` uses named maps (`rmp_serde::to_vec_named()`) so field names
//! stay on the wire and JSON peers see the same shape. The format of an
//! incoming payload is detected from its first byte, which lets a server
//! answer each caller in the format it spoke.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Errors from encoding or decoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("msgpack encode failed: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
    #[error("msgpack decode failed: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
    #[error("json codec failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unrecognized payload format")]
    UnknownFormat,
}

/// Serialization format of an envelope blob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireFormat {
    #[default]
    MsgPack,
    Json,
}

impl WireFormat {
    /// Serializes `value` in this format.
    ///
    /// # Errors
    ///
    /// Returns a `CodecError` if `value` cannot be serialized.
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::MsgPack => Ok(rmp_serde::to_vec_named(value)?),
            Self::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    /// Deserializes `bytes` in this format.
    ///
    /// # Errors
    ///
    /// Returns a `CodecError` if `bytes` is not a valid `T` in this format.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            Self::MsgPack => Ok(rmp_serde::from_slice(bytes)?),
            Self::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }

    /// Guesses the format of an envelope blob.
    ///
    /// Envelopes are always maps: a JSON object opens with `{` (after
    /// optional whitespace), a `MsgPack` map with a fixmap, map16 or
    /// map32 marker.
    #[must_use]
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        let first = bytes.iter().copied().find(|b| !b.is_ascii_whitespace())?;
        match first {
            b'{' => Some(Self::Json),
            0x80..=0x8f | 0xde | 0xdf => Some(Self::MsgPack),
            _ => None,
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MsgPack => f.write_str("msgpack"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "msgpack" | "messagepack" => Ok(Self::MsgPack),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown wire format: {other}")),
        }
    }
}

/// Decodes a blob of unknown format, returning the value and the detected format.
///
/// # Errors
///
/// Returns `CodecError::UnknownFormat` if the format cannot be detected,
/// or the underlying decode error.
pub fn decode_any<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, WireFormat), CodecError> {
    let format = WireFormat::detect(bytes).ok_or(CodecError::UnknownFormat)?;
    let value = format.decode(bytes)?;
    Ok((value, format))
}
