use bytes::Bytes;

use crate::error::{Result, StreamError};
use crate::media::encode::frame_duration_ms;
use crate::media::types::EncodedUnit;

// Matroska element ids.
const EBML_HEADER: u32 = 0x1A45_DFA3;
const EBML_VERSION: u32 = 0x4286;
const EBML_READ_VERSION: u32 = 0x42F7;
const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
const DOC_TYPE: u32 = 0x4282;
const DOC_TYPE_VERSION: u32 = 0x4287;
const DOC_TYPE_READ_VERSION: u32 = 0x4285;
const SEGMENT: u32 = 0x1853_8067;
const SEGMENT_INFO: u32 = 0x1549_A966;
const TIMECODE_SCALE: u32 = 0x2AD7B1;
const MUXING_APP: u32 = 0x4D80;
const WRITING_APP: u32 = 0x5741;
const DURATION: u32 = 0x4489;
const TRACKS: u32 = 0x1654_AE6B;
const TRACK_ENTRY: u32 = 0xAE;
const TRACK_NUMBER: u32 = 0xD7;
const TRACK_UID: u32 = 0x73C5;
const TRACK_TYPE: u32 = 0x83;
const CODEC_ID: u32 = 0x86;
const DEFAULT_DURATION: u32 = 0x23E383;
const VIDEO: u32 = 0xE0;
const PIXEL_WIDTH: u32 = 0xB0;
const PIXEL_HEIGHT: u32 = 0xBA;
const CLUSTER: u32 = 0x1F43_B675;
const CLUSTER_TIMECODE: u32 = 0xE7;
const SIMPLE_BLOCK: u32 = 0xA3;

const TRACK_TYPE_VIDEO: u64 = 1;
/// One timecode tick = 1 ms.
const TIMECODE_SCALE_NS: u64 = 1_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct TrackGeometry {
    width: u32,
    height: u32,
}

struct Block {
    timecode_ms: i64,
    keyframe: bool,
    data: Bytes,
}

/// Single-track streamable container assembler.
///
/// The track is created lazily from the first pushed unit and fixes the
/// session geometry; a later unit with different dimensions is a contract
/// violation. `finish` consumes the muxer, so mux-after-finalize cannot be
/// expressed.
pub struct Muxer {
    codec_id: &'static str,
    fps: f32,
    frame_duration: i64,
    track: Option<TrackGeometry>,
    blocks: Vec<Block>,
}

impl Muxer {
    pub fn new(codec_id: &'static str, fps: f32) -> Self {
        Self {
            codec_id,
            fps,
            frame_duration: frame_duration_ms(fps),
            track: None,
            blocks: Vec::new(),
        }
    }

    /// Append one encoded unit. Block timing is derived from the frame
    /// rate, not the unit's capture timestamp: packet `i` lands at
    /// `i * 1000 / fps` ms.
    pub fn push(&mut self, unit: &EncodedUnit) -> Result<()> {
        match self.track {
            None => {
                self.track = Some(TrackGeometry {
                    width: unit.width,
                    height: unit.height,
                });
            }
            Some(track) if track.width != unit.width || track.height != unit.height => {
                return Err(StreamError::DimensionMismatch {
                    track_width: track.width,
                    track_height: track.height,
                    got_width: unit.width,
                    got_height: unit.height,
                });
            }
            Some(_) => {}
        }

        let index = self.blocks.len() as f64;
        let timecode_ms = (index * 1000.0 / self.fps as f64).round() as i64;
        self.blocks.push(Block {
            timecode_ms,
            keyframe: unit.is_keyframe,
            data: unit.data.clone(),
        });
        Ok(())
    }

    pub fn frame_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn frame_duration_ms(&self) -> i64 {
        self.frame_duration
    }

    /// Assemble the finished container. Must be called exactly once; the
    /// buffer is not valid for transmission before this.
    pub fn finish(self) -> Result<Bytes> {
        let track = self.track.ok_or_else(|| {
            StreamError::Encode("container finalized with no frames".to_string())
        })?;

        let mut out = Vec::new();
        write_element(&mut out, EBML_HEADER, &ebml_header());
        write_element(
            &mut out,
            SEGMENT,
            &segment_body(self.codec_id, self.fps, track, &self.blocks),
        );
        Ok(Bytes::from(out))
    }
}

fn ebml_header() -> Vec<u8> {
    let mut body = Vec::new();
    write_uint_element(&mut body, EBML_VERSION, 1);
    write_uint_element(&mut body, EBML_READ_VERSION, 1);
    write_uint_element(&mut body, EBML_MAX_ID_LENGTH, 4);
    write_uint_element(&mut body, EBML_MAX_SIZE_LENGTH, 8);
    write_element(&mut body, DOC_TYPE, b"matroska");
    write_uint_element(&mut body, DOC_TYPE_VERSION, 2);
    write_uint_element(&mut body, DOC_TYPE_READ_VERSION, 2);
    body
}

fn segment_body(
    codec_id: &str,
    fps: f32,
    track: TrackGeometry,
    blocks: &[Block],
) -> Vec<u8> {
    let mut segment = Vec::new();

    let duration_ms = blocks.len() as f64 * 1000.0 / fps as f64;
    let mut info = Vec::new();
    write_uint_element(&mut info, TIMECODE_SCALE, TIMECODE_SCALE_NS);
    write_element(&mut info, MUXING_APP, b"framecast");
    write_element(&mut info, WRITING_APP, b"framecast");
    write_float_element(&mut info, DURATION, duration_ms);
    write_element(&mut segment, SEGMENT_INFO, &info);

    let mut entry = Vec::new();
    write_uint_element(&mut entry, TRACK_NUMBER, 1);
    write_uint_element(&mut entry, TRACK_UID, 1);
    write_uint_element(&mut entry, TRACK_TYPE, TRACK_TYPE_VIDEO);
    write_element(&mut entry, CODEC_ID, codec_id.as_bytes());
    write_uint_element(
        &mut entry,
        DEFAULT_DURATION,
        (1_000_000_000.0 / fps as f64).round() as u64,
    );
    let mut video = Vec::new();
    write_uint_element(&mut video, PIXEL_WIDTH, track.width as u64);
    write_uint_element(&mut video, PIXEL_HEIGHT, track.height as u64);
    write_element(&mut entry, VIDEO, &video);
    let mut tracks = Vec::new();
    write_element(&mut tracks, TRACK_ENTRY, &entry);
    write_element(&mut segment, TRACKS, &tracks);

    // A cluster per keyframe run; SimpleBlock timecodes are i16-relative
    // to the cluster, so a long run is also split when it would overflow.
    let mut cluster: Vec<u8> = Vec::new();
    let mut cluster_base = 0i64;
    let mut open = false;
    for block in blocks {
        let relative = block.timecode_ms - cluster_base;
        if open && (block.keyframe || relative > i16::MAX as i64) {
            write_element(&mut segment, CLUSTER, &cluster);
            cluster.clear();
            open = false;
        }
        if !open {
            cluster_base = block.timecode_ms;
            write_uint_element(&mut cluster, CLUSTER_TIMECODE, cluster_base as u64);
            open = true;
        }
        let relative = (block.timecode_ms - cluster_base) as i16;
        let mut sb = Vec::with_capacity(block.data.len() + 4);
        sb.push(0x81); // track 1 as a vint
        sb.extend_from_slice(&relative.to_be_bytes());
        sb.push(if block.keyframe { 0x80 } else { 0x00 });
        sb.extend_from_slice(&block.data);
        write_element(&mut cluster, SIMPLE_BLOCK, &sb);
    }
    if open {
        write_element(&mut segment, CLUSTER, &cluster);
    }

    segment
}

/// Element id bytes: ids already carry their length marker, written as-is.
fn write_id(out: &mut Vec<u8>, id: u32) {
    let bytes = id.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.extend_from_slice(&bytes[skip..]);
}

/// Size as a minimal-length EBML vint.
fn write_size(out: &mut Vec<u8>, size: u64) {
    let mut length = 1usize;
    while length < 8 && size >= (1u64 << (7 * length)) - 1 {
        length += 1;
    }
    let marked = size | (1u64 << (7 * length));
    let bytes = marked.to_be_bytes();
    out.extend_from_slice(&bytes[8 - length..]);
}

fn write_element(out: &mut Vec<u8>, id: u32, body: &[u8]) {
    write_id(out, id);
    write_size(out, body.len() as u64);
    out.extend_from_slice(body);
}

fn write_uint_element(out: &mut Vec<u8>, id: u32, value: u64) {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
    write_element(out, id, &bytes[skip..]);
}

fn write_float_element(out: &mut Vec<u8>, id: u32, value: f64) {
    write_element(out, id, &value.to_be_bytes());
}
