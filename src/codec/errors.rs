//! Frame decoding errors.

use std::fmt;
use std::fmt::Display;

/// Failure modes when decoding a [`crate::codec::message::TunnelMessage`]
/// from a WebSocket text frame.
#[derive(Debug)]
pub enum FrameError {
    /// The frame exceeded `max_frame_bytes`. Fatal for the current
    /// session if it recurs (see [`crate::session`]).
    TooLarge(usize),

    /// The frame was not valid JSON, or the JSON was valid but did not
    /// match any known shape closely enough to parse.
    Invalid(String),

    /// `Data.payload` was not valid base64.
    BadPayload(String),
}

impl std::error::Error for FrameError {}

impl Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameError::TooLarge(n) => write!(f, "frame of {n} bytes exceeds max_frame_bytes"),
            FrameError::Invalid(msg) => write!(f, "invalid frame: {msg}"),
            FrameError::BadPayload(msg) => write!(f, "invalid base64 payload: {msg}"),
        }
    }
}
