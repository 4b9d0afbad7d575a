use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::media::decode;
use crate::media::encode::{FrameEncoder, MjpegCodec};
use crate::media::mux::Muxer;
use crate::media::projector::StreamProjector;
use crate::media::queue::FrameQueue;
use crate::media::types::{BatchPayload, Frame, UploadMode};
use crate::media::upload::{UploadPayload, UploadSink, UploadTracker};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Initialized,
    Running,
    Stopped,
}

impl Display for PipelineState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Idle => write!(f, "idle"),
            PipelineState::Initialized => write!(f, "initialized"),
            PipelineState::Running => write!(f, "running"),
            PipelineState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Outcome of one processed batch. Every frame is accounted for: decoded,
/// skipped on a per-frame error, or dropped by the admission policy.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BatchReport {
    pub frames: usize,
    pub decoded: usize,
    pub skipped: usize,
    pub enqueued: usize,
    pub dropped: usize,
    pub uploaded: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PipelineStatus {
    pub state: String,
    pub queue_len: usize,
    pub queue_dropped: u64,
    pub processed_frames: u64,
    /// Cause of the upload failure that ended the session, when one has.
    pub upload_failure: Option<String>,
}

/// Wires decoder, queue, projector and upload sink together for one
/// streaming session and owns the start/stop lifecycle.
///
/// `Idle -> Initialized -> Running -> Stopped`; a stopped pipeline only
/// returns to `Initialized` through an explicit `initialize`.
pub struct Pipeline {
    config: StreamConfig,
    sink: Arc<dyn UploadSink>,
    state: Mutex<PipelineState>,
    queue: Mutex<Arc<FrameQueue<Frame>>>,
    projector: StreamProjector,
    uploads: Arc<UploadTracker>,
    /// Next sequence index; continuous across batches within a session,
    /// reset by `initialize`.
    next_seq: AtomicU64,
}

impl Pipeline {
    pub fn new(config: StreamConfig, sink: Arc<dyn UploadSink>) -> Self {
        let queue = Arc::new(FrameQueue::new(config.queue_capacity, config.admission));
        Self {
            config,
            sink,
            state: Mutex::new(PipelineState::Idle),
            queue: Mutex::new(queue),
            projector: StreamProjector::new(),
            uploads: UploadTracker::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    pub fn status(&self) -> PipelineStatus {
        let queue = self.queue.lock().clone();
        PipelineStatus {
            state: self.state().to_string(),
            queue_len: queue.len(),
            queue_dropped: queue.dropped(),
            processed_frames: self.next_seq.load(Ordering::Relaxed),
            upload_failure: self.uploads.failure(),
        }
    }

    /// Prepare a fresh session: new queue, sequence counter reset.
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state == PipelineState::Running {
            return Err(StreamError::IllegalState(
                "cannot re-initialize a running pipeline".to_string(),
            ));
        }
        *self.queue.lock() = Arc::new(FrameQueue::new(
            self.config.queue_capacity,
            self.config.admission,
        ));
        self.uploads.clear();
        self.next_seq.store(0, Ordering::Relaxed);
        *state = PipelineState::Initialized;
        Ok(())
    }

    /// Start the projector loop. Only legal from `Initialized`.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            PipelineState::Running => Err(StreamError::IllegalState(
                "start while already running".to_string(),
            )),
            PipelineState::Idle | PipelineState::Stopped => Err(StreamError::IllegalState(
                format!("start from {} (initialize first)", state),
            )),
            PipelineState::Initialized => {
                if self.config.upload_mode == UploadMode::Frames {
                    self.projector.start(
                        self.queue.lock().clone(),
                        self.build_encoder(self.config.fps),
                        Arc::clone(&self.sink),
                        self.config.pacing,
                        self.config.fps,
                        Arc::clone(&self.uploads),
                    )?;
                }
                *state = PipelineState::Running;
                Ok(())
            }
        }
    }

    /// Tear the session down: stop the projector, discard whatever is
    /// still queued and wait for the in-flight upload to resolve.
    /// Idempotent; reports the in-flight upload's failure if it had one.
    pub async fn stop(&self) -> Result<()> {
        let was_running = {
            let mut state = self.state.lock();
            let prev = *state;
            *state = PipelineState::Stopped;
            prev == PipelineState::Running
        };
        if !was_running {
            return Ok(());
        }

        self.projector.stop();
        let queue = self.queue.lock().clone();
        queue.close();
        let discarded = queue.drain();
        if discarded > 0 {
            log::info!("discarded {} queued frames on stop", discarded);
        }
        self.projector.join().await;

        let uploads = Arc::clone(&self.uploads);
        let timeout = self.config.upload_timeout();
        tokio::task::spawn_blocking(move || uploads.wait_idle(timeout))
            .await
            .map_err(|e| StreamError::UploadFailed(e.to_string()))??;
        Ok(())
    }

    /// Process one inbound batch according to the session upload mode.
    /// Blocks the calling thread (queue admission, container upload
    /// wait); run it on a blocking task from async contexts.
    pub fn process_batch(&self, batch: &BatchPayload) -> Result<BatchReport> {
        if batch.frames.len() != batch.timestamps.len() {
            return Err(StreamError::Decode(format!(
                "frames/timestamps length mismatch: {} vs {}",
                batch.frames.len(),
                batch.timestamps.len()
            )));
        }
        if self.state() != PipelineState::Running {
            return Err(StreamError::IllegalState(format!(
                "cannot process a batch while {}",
                self.state()
            )));
        }

        match self.config.upload_mode {
            UploadMode::Frames => self.process_live(batch),
            UploadMode::Container => self.process_container(batch),
        }
    }

    /// Live path: decode into the queue, the projector does the rest.
    fn process_live(&self, batch: &BatchPayload) -> Result<BatchReport> {
        if let Some(cause) = self.uploads.failure() {
            return Err(StreamError::UploadFailed(cause));
        }
        let queue = self.queue.lock().clone();
        let mut report = BatchReport {
            frames: batch.frames.len(),
            ..Default::default()
        };

        for (payload, &timestamp) in batch.frames.iter().zip(batch.timestamps.iter()) {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            match decode::decode_frame(payload, &self.config.url_data_format, seq, timestamp) {
                Ok(frame) => {
                    report.decoded += 1;
                    match queue.enqueue(frame) {
                        Ok(true) => report.enqueued += 1,
                        Ok(false) => report.dropped += 1,
                        Err(_) => return Err(self.session_error()),
                    }
                }
                Err(e) if e.is_recoverable() => {
                    log::warn!("frame {} skipped: {}", seq, e);
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    /// A closed queue mid-session usually means a failed upload shut it;
    /// report that cause when one is recorded.
    fn session_error(&self) -> StreamError {
        match self.uploads.failure() {
            Some(cause) => StreamError::UploadFailed(cause),
            None => StreamError::QueueClosed,
        }
    }

    /// Batch path: encode and mux inline, one upload per batch, and wait
    /// for the acknowledgment before answering the caller.
    fn process_container(&self, batch: &BatchPayload) -> Result<BatchReport> {
        if !(batch.framerate > 0.0) {
            return Err(StreamError::Decode(format!(
                "invalid declared framerate: {}",
                batch.framerate
            )));
        }

        let mut encoder = self.build_encoder(batch.framerate);
        let mut muxer = Muxer::new(encoder.codec_id(), batch.framerate);
        let mut report = BatchReport {
            frames: batch.frames.len(),
            ..Default::default()
        };

        for (payload, &timestamp) in batch.frames.iter().zip(batch.timestamps.iter()) {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            let frame =
                match decode::decode_frame(payload, &self.config.url_data_format, seq, timestamp) {
                    Ok(frame) => frame,
                    Err(e) if e.is_recoverable() => {
                        log::warn!("frame {} skipped: {}", seq, e);
                        report.skipped += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                };
            match encoder.encode(&frame) {
                Ok(unit) => {
                    muxer.push(&unit)?;
                    report.decoded += 1;
                }
                Err(e) if e.is_recoverable() => {
                    log::warn!("frame {} skipped: {}", seq, e);
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if report.decoded == 0 {
            log::debug!("batch produced no units, nothing to upload");
            return Ok(report);
        }

        let container = muxer.finish()?;
        let gate = self.sink.dispatch(UploadPayload::Container(container));
        self.uploads.track(Arc::clone(&gate));
        let waited = gate.wait(self.config.upload_timeout());
        // The caller observes the outcome here; `stop` must not see the
        // same gate again.
        self.uploads.settle(&gate);
        waited?;
        report.uploaded = report.decoded;
        Ok(report)
    }

    fn build_encoder(&self, fps: f32) -> FrameEncoder {
        FrameEncoder::new(
            Box::new(MjpegCodec::new(self.config.jpeg_quality)),
            self.config.keyframe_interval,
            fps,
        )
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
