//! Batch-to-stream conversion pipeline: timestamped still images in,
//! encoded video out.
//!
//! Data Flow:
//! ```text
//! HTTP batch ──► decode (base64 + image) ──► Frame (RGB24)
//!                                              │
//!                     live mode                │        container mode
//!              ┌───────────────────────────────┴──────────────────────┐
//!              ▼                                                      ▼
//!        FrameQueue (bounded)                              encode + mux inline
//!              │                                                      │
//!              ▼                                                      ▼
//!        StreamProjector ──► encode ──► UploadSink           UploadSink (one
//!        (single consumer)              (per frame)          container per batch)
//! ```
//!
//! Both paths end at an [`upload::UploadSink`]; every dispatch hands back
//! an [`upload::UploadGate`] the caller can block on.

pub mod convert;
pub mod decode;
pub mod encode;
pub mod mux;
pub mod pipeline;
pub mod projector;
pub mod queue;
pub mod types;
pub mod upload;
