//! JSON frame codec
//!
//! Every alarm frame carries exactly one JSON record:
//! ```text
//! Text frame   -> UTF-8 JSON
//! Binary frame -> UTF-8 JSON bytes
//! ```
//!
//! The schema is owned by the server; the codec only answers "parseable or not".

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use crate::defaults;

/// Maximum frame size accepted by default
pub const MAX_FRAME_SIZE: usize = defaults::MAX_FRAME_BYTES;

/// One discrete message delivered over a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    /// Payload length in bytes
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for Frame {
    fn from(text: &str) -> Self {
        Frame::Text(text.to_string())
    }
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Frame::Text(text)
    }
}

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Frame is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode a frame into a JSON value
pub fn decode(frame: &Frame, max_size: usize) -> Result<Value, CodecError> {
    if frame.len() > max_size {
        return Err(CodecError::FrameTooLarge {
            size: frame.len(),
            max: max_size,
        });
    }

    let text = match frame {
        Frame::Text(text) => text.as_str(),
        Frame::Binary(bytes) => std::str::from_utf8(bytes)?,
    };

    Ok(serde_json::from_str(text)?)
}

/// Stateful decoder that applies a size limit and keeps counters
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
    decoded: u64,
    rejected: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl FrameDecoder {
    /// Create a decoder with the given size limit
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            decoded: 0,
            rejected: 0,
        }
    }

    /// Decode the next frame, counting successes and rejections
    pub fn decode_next(&mut self, frame: &Frame) -> Result<Value, CodecError> {
        match decode(frame, self.max_frame_size) {
            Ok(value) => {
                self.decoded += 1;
                Ok(value)
            }
            Err(e) => {
                self.rejected += 1;
                Err(e)
            }
        }
    }

    /// Frames decoded since the last reset
    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    /// Frames rejected since the last reset
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn reset(&mut self) {
        self.decoded = 0;
        self.rejected = 0;
    }
}
