use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::{Result, StreamError};
use crate::media::types::{Frame, PixelFormat};

/// Strip the configured data-URI prefix (e.g. `data:image/jpeg;base64,`)
/// when present. A payload without the prefix passes through unchanged;
/// a payload with a *different* prefix is left intact and will fail base64
/// decoding cleanly instead of being corrupted by a blind length strip.
pub fn normalize<'a>(payload: &'a str, prefix: &str) -> &'a str {
    if prefix.is_empty() {
        return payload;
    }
    payload.strip_prefix(prefix).unwrap_or(payload)
}

/// Decode one base64 payload element into an RGB frame.
///
/// Failures are per-frame: the caller logs, skips the element and keeps
/// processing the rest of the batch. An absent frame is never forwarded.
pub fn decode_frame(payload: &str, prefix: &str, seq: u64, timestamp_ms: i64) -> Result<Frame> {
    let trimmed = normalize(payload, prefix);
    let raw = STANDARD
        .decode(trimmed.trim())
        .map_err(|e| StreamError::Decode(format!("malformed base64: {}", e)))?;

    let decoded = image::load_from_memory(&raw)
        .map_err(|e| StreamError::Decode(format!("unreadable image container: {}", e)))?;
    let rgb = decoded.to_rgb8();
    let (width, height) = (rgb.width(), rgb.height());
    if width == 0 || height == 0 {
        return Err(StreamError::Decode("image has zero dimension".into()));
    }

    Ok(Frame::new(
        seq,
        timestamp_ms,
        width,
        height,
        PixelFormat::Rgb24,
        rgb.into_raw(),
    ))
}
