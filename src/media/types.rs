use std::fmt::{Display, Formatter};
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Pixel layout of a `Frame` buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// Interleaved 8-bit RGB, 3 bytes per pixel.
    Rgb24,
    /// Planar 4:2:0, Y plane then U then V.
    Yuv420p,
}

impl Display for PixelFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PixelFormat::Rgb24 => write!(f, "rgb24"),
            PixelFormat::Yuv420p => write!(f, "yuv420p"),
        }
    }
}

/// One decoded picture with its capture metadata.
///
/// Created by the image decoder, immutable afterwards; moved between
/// pipeline stages, never copied.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Monotonic index within the session, assigned at decode.
    pub seq: u64,
    /// Capture timestamp, epoch milliseconds.
    pub timestamp_ms: i64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Bytes,
}

impl Frame {
    pub fn new(
        seq: u64,
        timestamp_ms: i64,
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Self {
        Self {
            seq,
            timestamp_ms,
            width,
            height,
            format,
            data: Bytes::from(data),
        }
    }
}

/// One compressed video frame with timing and keyframe metadata.
#[derive(Clone, Debug)]
pub struct EncodedUnit {
    pub seq: u64,
    pub is_keyframe: bool,
    /// Presentation timestamp, milliseconds.
    pub pts_ms: i64,
    /// Decode timestamp, milliseconds. Equal to pts: no frame reordering.
    pub dts_ms: i64,
    pub duration_ms: i64,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

/// Inbound batch body: parallel `frames` and `timestamps` arrays plus the
/// declared frame rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPayload {
    pub frames: Vec<String>,
    pub timestamps: Vec<i64>,
    pub framerate: f32,
}

/// Queue behavior when full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Enqueue suspends until space is available. Every frame reaches the
    /// stream; latency is unbounded.
    Blocking,
    /// Enqueue drops the frame when full. Drops are counted and logged.
    Drop,
}

impl FromStr for AdmissionPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "blocking" => Ok(AdmissionPolicy::Blocking),
            "drop" => Ok(AdmissionPolicy::Drop),
            other => Err(format!("unknown admission policy: {}", other)),
        }
    }
}

/// Consumer pacing: pure backpressure or a fixed wall-clock interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacingMode {
    Backpressure,
    FixedInterval,
}

impl FromStr for PacingMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "backpressure" => Ok(PacingMode::Backpressure),
            "fixed" => Ok(PacingMode::FixedInterval),
            other => Err(format!("unknown pacing mode: {}", other)),
        }
    }
}

/// Upload strategy, selected once at session construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadMode {
    /// Queue + projector, one dispatch per encoded frame.
    Frames,
    /// Inline encode + mux, one dispatch per finished container.
    Container,
}

impl FromStr for UploadMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "frames" => Ok(UploadMode::Frames),
            "container" => Ok(UploadMode::Container),
            other => Err(format!("unknown upload mode: {}", other)),
        }
    }
}

/// How upload timecodes are mapped before leaving the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimecodeMode {
    /// Relative to session start (the first dispatched unit).
    Relative,
    /// Absolute wall-clock epoch milliseconds.
    Absolute,
}

impl FromStr for TimecodeMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "relative" => Ok(TimecodeMode::Relative),
            "absolute" => Ok(TimecodeMode::Absolute),
            other => Err(format!("unknown timecode mode: {}", other)),
        }
    }
}
