//! Parameter payload compression.
//!
//! Producers compress serialized parameters with zstd once they exceed the
//! task's threshold and stamp the encoding in the `compression-type` header;
//! the supervisor reads the header and decodes before handing parameters to
//! a child.

use crate::error::TaskworkerError;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// zstd level used by producers
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    Plaintext,
    Zstd,
}

impl CompressionType {
    /// Parse the header value; a missing header means plaintext.
    pub fn from_header(value: Option<&str>) -> Result<Self, TaskworkerError> {
        match value {
            None => Ok(CompressionType::Plaintext),
            Some(raw) => raw.parse().map_err(|_| {
                TaskworkerError::serialization(format!("unknown compression type '{raw}'"))
            }),
        }
    }
}

/// Compress `raw` when it is strictly larger than `threshold` bytes.
pub fn compress_parameters(
    raw: Vec<u8>,
    threshold: usize,
) -> Result<(Vec<u8>, CompressionType), TaskworkerError> {
    if raw.len() <= threshold {
        return Ok((raw, CompressionType::Plaintext));
    }

    let compressed = zstd::encode_all(raw.as_slice(), ZSTD_LEVEL)?;
    tracing::debug!(
        original_bytes = raw.len(),
        compressed_bytes = compressed.len(),
        "Compressed task parameters"
    );
    Ok((compressed, CompressionType::Zstd))
}

pub fn decompress_parameters(
    payload: &[u8],
    compression: CompressionType,
) -> Result<Vec<u8>, TaskworkerError> {
    match compression {
        CompressionType::Plaintext => Ok(payload.to_vec()),
        CompressionType::Zstd => zstd::decode_all(payload).map_err(|e| {
            TaskworkerError::serialization(format!("corrupt zstd parameters: {e}"))
        }),
    }
}
