use jpeg_encoder::{ColorType, Encoder as JpegEncoder, SamplingFactor};

use crate::error::{Result, StreamError};
use crate::media::convert;
use crate::media::types::{EncodedUnit, Frame, PixelFormat};

/// Black-box compression capability.
///
/// The pipeline never looks inside the bitstream; it only needs a
/// worst-case size estimate before allocating output storage, the pixel
/// format the codec wants in, and a codec id string for the container.
pub trait FrameCodec: Send {
    /// Upper bound on compressed bytes for a picture of this geometry.
    fn estimate_size(&self, width: u32, height: u32) -> usize;

    /// Pixel format this codec consumes.
    fn pixel_format(&self) -> PixelFormat;

    /// Matroska codec id for the produced packets.
    fn codec_id(&self) -> &'static str;

    /// Compress one picture into `out`. `out` arrives empty with capacity
    /// at least `estimate_size(frame.width, frame.height)`.
    fn encode_picture(&mut self, frame: &Frame, out: &mut Vec<u8>) -> Result<()>;
}

/// Motion-JPEG codec: every frame is compressed independently.
pub struct MjpegCodec {
    quality: u8,
}

impl MjpegCodec {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl Default for MjpegCodec {
    fn default() -> Self {
        Self::new(85)
    }
}

impl FrameCodec for MjpegCodec {
    fn estimate_size(&self, width: u32, height: u32) -> usize {
        // JPEG never beats raw interleaved size by less than the header
        // slack on pathological input.
        (width as usize) * (height as usize) * 3 + 2048
    }

    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Yuv420p
    }

    fn codec_id(&self) -> &'static str {
        "V_MJPEG"
    }

    fn encode_picture(&mut self, frame: &Frame, out: &mut Vec<u8>) -> Result<()> {
        if frame.format != PixelFormat::Yuv420p {
            return Err(StreamError::UnsupportedFormat(frame.format.to_string()));
        }
        if frame.width > u16::MAX as u32 || frame.height > u16::MAX as u32 {
            return Err(StreamError::Encode(format!(
                "picture {}x{} exceeds codec geometry limit",
                frame.width, frame.height
            )));
        }

        let interleaved = interleave_yuv420p(frame);
        let mut encoder = JpegEncoder::new(&mut *out, self.quality);
        encoder.set_sampling_factor(SamplingFactor::F_2_2);
        encoder
            .encode(
                &interleaved,
                frame.width as u16,
                frame.height as u16,
                ColorType::Ycbcr,
            )
            .map_err(|e| StreamError::Encode(e.to_string()))?;
        Ok(())
    }
}

/// Nearest-neighbor chroma upsample from planar 4:2:0 to interleaved YCbCr.
fn interleave_yuv420p(frame: &Frame) -> Vec<u8> {
    let width = frame.width as usize;
    let height = frame.height as usize;
    let chroma_w = width.div_ceil(2);
    let y_plane = &frame.data[..width * height];
    let u_plane = &frame.data[width * height..width * height + chroma_w * height.div_ceil(2)];
    let v_plane = &frame.data[width * height + chroma_w * height.div_ceil(2)..];

    let mut out = Vec::with_capacity(width * height * 3);
    for row in 0..height {
        for col in 0..width {
            let c = (row / 2) * chroma_w + col / 2;
            out.push(y_plane[row * width + col]);
            out.push(u_plane[c]);
            out.push(v_plane[c]);
        }
    }
    out
}

/// Per-frame encoder: applies the keyframe policy, sizes the output
/// buffer from the codec's estimate and stamps unit timing.
///
/// Stateless with respect to prior frames; there are no inter-frame
/// dependency chains in this pipeline.
pub struct FrameEncoder {
    codec: Box<dyn FrameCodec>,
    keyframe_interval: u32,
    frame_duration_ms: i64,
}

impl FrameEncoder {
    pub fn new(codec: Box<dyn FrameCodec>, keyframe_interval: u32, fps: f32) -> Self {
        debug_assert!(keyframe_interval > 0);
        debug_assert!(fps > 0.0);
        Self {
            codec,
            keyframe_interval: keyframe_interval.max(1),
            frame_duration_ms: frame_duration_ms(fps),
        }
    }

    pub fn codec_id(&self) -> &'static str {
        self.codec.codec_id()
    }

    pub fn encode(&mut self, frame: &Frame) -> Result<EncodedUnit> {
        let converted;
        let picture = match (frame.format, self.codec.pixel_format()) {
            (a, b) if a == b => frame,
            (PixelFormat::Rgb24, PixelFormat::Yuv420p) => {
                converted = convert::to_yuv420p(frame)?;
                &converted
            }
            (from, to) => {
                return Err(StreamError::UnsupportedFormat(format!(
                    "no conversion from {} to {}",
                    from, to
                )))
            }
        };

        let mut out = Vec::with_capacity(self.codec.estimate_size(frame.width, frame.height));
        self.codec.encode_picture(picture, &mut out)?;

        Ok(EncodedUnit {
            seq: frame.seq,
            is_keyframe: frame.seq % self.keyframe_interval as u64 == 0,
            pts_ms: frame.timestamp_ms,
            dts_ms: frame.timestamp_ms,
            duration_ms: self.frame_duration_ms,
            width: frame.width,
            height: frame.height,
            data: out.into(),
        })
    }
}

/// Frame duration in milliseconds for a given rate, rounded.
pub fn frame_duration_ms(fps: f32) -> i64 {
    (1000.0 / fps).round() as i64
}
