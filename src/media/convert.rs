use crate::error::Result;
use crate::media::types::{Frame, PixelFormat};

/// Convert an RGB frame to planar YUV 4:2:0 (BT.601), same geometry.
///
/// Pure function; the only failure mode is a source format this converter
/// does not understand. Chroma planes are `(w+1)/2 x (h+1)/2`, each sample
/// averaged over its (up to) 2x2 pixel block, so odd dimensions are fine.
pub fn to_yuv420p(frame: &Frame) -> Result<Frame> {
    match frame.format {
        PixelFormat::Rgb24 => {}
        PixelFormat::Yuv420p => return Ok(frame.clone()),
    }

    let width = frame.width as usize;
    let height = frame.height as usize;
    let rgb = &frame.data;
    debug_assert_eq!(rgb.len(), width * height * 3);

    let chroma_w = width.div_ceil(2);
    let chroma_h = height.div_ceil(2);
    let mut data = vec![0u8; width * height + 2 * chroma_w * chroma_h];
    let (y_plane, uv) = data.split_at_mut(width * height);
    let (u_plane, v_plane) = uv.split_at_mut(chroma_w * chroma_h);

    for row in 0..height {
        for col in 0..width {
            let p = (row * width + col) * 3;
            let (r, g, b) = (rgb[p] as f32, rgb[p + 1] as f32, rgb[p + 2] as f32);
            let y = 0.299 * r + 0.587 * g + 0.114 * b;
            y_plane[row * width + col] = y.round().clamp(0.0, 255.0) as u8;
        }
    }

    for crow in 0..chroma_h {
        for ccol in 0..chroma_w {
            // Average the 2x2 block, clamped at the right/bottom edges.
            let mut sum_u = 0.0f32;
            let mut sum_v = 0.0f32;
            let mut samples = 0.0f32;
            for dy in 0..2usize {
                for dx in 0..2usize {
                    let row = (crow * 2 + dy).min(height - 1);
                    let col = (ccol * 2 + dx).min(width - 1);
                    if crow * 2 + dy < height && ccol * 2 + dx < width {
                        let p = (row * width + col) * 3;
                        let (r, g, b) = (rgb[p] as f32, rgb[p + 1] as f32, rgb[p + 2] as f32);
                        sum_u += -0.168736 * r - 0.331264 * g + 0.5 * b;
                        sum_v += 0.5 * r - 0.418688 * g - 0.081312 * b;
                        samples += 1.0;
                    }
                }
            }
            let idx = crow * chroma_w + ccol;
            u_plane[idx] = (sum_u / samples + 128.0).round().clamp(0.0, 255.0) as u8;
            v_plane[idx] = (sum_v / samples + 128.0).round().clamp(0.0, 255.0) as u8;
        }
    }

    Ok(Frame::new(
        frame.seq,
        frame.timestamp_ms,
        frame.width,
        frame.height,
        PixelFormat::Yuv420p,
        data,
    ))
}
