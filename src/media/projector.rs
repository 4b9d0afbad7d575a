use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StreamError};
use crate::media::encode::FrameEncoder;
use crate::media::queue::{FrameQueue, TimedDequeue};
use crate::media::types::{Frame, PacingMode};
use crate::media::upload::{UploadOutcome, UploadPayload, UploadSink, UploadTracker};

/// The single consumer side of the frame queue.
///
/// Exactly one projector loop runs per session; a second concurrent
/// consumer would break frame ordering. The loop lives on a blocking
/// thread: dequeue, encode, forward to the sink, repeat until cancelled,
/// the queue closes or an upload fails.
pub struct StreamProjector {
    running: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StreamProjector {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            cancel: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn the consumer loop. Rejected while a loop is already running.
    pub fn start(
        &self,
        queue: Arc<FrameQueue<Frame>>,
        mut encoder: FrameEncoder,
        sink: Arc<dyn UploadSink>,
        pacing: PacingMode,
        fps: f32,
        uploads: Arc<UploadTracker>,
    ) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(StreamError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock() = Some(cancel.clone());

        let interval = Duration::from_millis((1000.0 / fps).round().max(1.0) as u64);
        let handle = tokio::task::spawn_blocking(move || {
            log::info!("projector loop started ({:?} pacing)", pacing);
            let mut forwarded: u64 = 0;
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                // A failed upload is session-fatal; the gate watcher has
                // already closed the queue, this drops what it drained.
                if uploads.failure().is_some() {
                    break;
                }

                let frame = match pacing {
                    PacingMode::Backpressure => match queue.dequeue() {
                        Some(frame) => Some(frame),
                        None => break,
                    },
                    PacingMode::FixedInterval => {
                        let started = std::time::Instant::now();
                        let polled = match queue.dequeue_timeout(interval) {
                            TimedDequeue::Item(frame) => Some(frame),
                            // Underrun: skip the forward step, keep pacing.
                            TimedDequeue::Empty => None,
                            TimedDequeue::Closed => break,
                        };
                        if let Some(remaining) = interval.checked_sub(started.elapsed()) {
                            std::thread::sleep(remaining);
                        }
                        polled
                    }
                };

                let Some(frame) = frame else { continue };

                let encoded = match encoder.encode(&frame) {
                    Ok(encoded) => encoded,
                    Err(e) if e.is_recoverable() => {
                        log::warn!("skipping frame {}: {}", frame.seq, e);
                        continue;
                    }
                    Err(e) => {
                        log::error!("encode failed on frame {}: {}", frame.seq, e);
                        continue;
                    }
                };

                let gate = sink.dispatch(UploadPayload::Frame(encoded));
                // Every dispatch is watched, so a failure surfaces even
                // when later dispatches have long since overtaken it.
                let watch_queue = Arc::clone(&queue);
                let watch_uploads = Arc::clone(&uploads);
                gate.watch(move |outcome| {
                    if let UploadOutcome::Failed(cause) = outcome {
                        watch_uploads.fail(cause.clone());
                        watch_queue.close();
                    }
                });
                uploads.track(gate);
                forwarded += 1;
            }
            if let Some(cause) = uploads.failure() {
                log::error!("session ended by failed upload: {}", cause);
            }
            log::info!("projector loop finished, {} units forwarded", forwarded);
        });
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Request the loop to stop. Idempotent; the loop also needs its
    /// queue closed to wake a blocked dequeue.
    pub fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().as_ref() {
            cancel.cancel();
        }
    }

    /// Wait for the loop thread to exit after `stop`.
    pub async fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::warn!("projector task join failed: {}", e);
            }
        }
        self.running.store(false, Ordering::Release);
    }
}

impl Default for StreamProjector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::encode::MjpegCodec;
    use crate::media::types::{AdmissionPolicy, Frame, PixelFormat};
    use crate::media::upload::testing::StubSink;

    fn encoder() -> FrameEncoder {
        FrameEncoder::new(Box::new(MjpegCodec::default()), 25, 25.0)
    }

    fn raw_frame(seq: u64) -> Frame {
        let data = vec![128u8; 8 * 8 * 3];
        Frame::new(seq, seq as i64 * 40, 8, 8, PixelFormat::Rgb24, data)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_twice_rejected() {
        let projector = StreamProjector::new();
        let queue = Arc::new(FrameQueue::new(4, AdmissionPolicy::Blocking));
        let sink = StubSink::completing();
        let uploads = UploadTracker::new();

        projector
            .start(
                Arc::clone(&queue),
                encoder(),
                sink.clone(),
                PacingMode::Backpressure,
                25.0,
                Arc::clone(&uploads),
            )
            .unwrap();
        let err = projector
            .start(queue.clone(), encoder(), sink, PacingMode::Backpressure, 25.0, uploads)
            .unwrap_err();
        assert!(matches!(err, StreamError::AlreadyRunning));

        projector.stop();
        queue.close();
        projector.join().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_forwards_queued_frames_in_order() {
        let projector = StreamProjector::new();
        let queue = Arc::new(FrameQueue::new(8, AdmissionPolicy::Blocking));
        let sink = StubSink::completing();

        for seq in 0..3 {
            queue.enqueue(raw_frame(seq)).unwrap();
        }
        projector
            .start(
                Arc::clone(&queue),
                encoder(),
                sink.clone(),
                PacingMode::Backpressure,
                25.0,
                UploadTracker::new(),
            )
            .unwrap();

        // Closing after the enqueues lets the loop drain and exit.
        queue.close();
        projector.join().await;

        let frames = sink.frames.lock();
        assert_eq!(frames.len(), 3);
        assert_eq!(
            frames.iter().map(|u| u.seq).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(frames[0].is_keyframe);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_is_idempotent() {
        let projector = StreamProjector::new();
        let queue = Arc::new(FrameQueue::new(4, AdmissionPolicy::Blocking));
        projector
            .start(
                Arc::clone(&queue),
                encoder(),
                StubSink::completing(),
                PacingMode::Backpressure,
                25.0,
                UploadTracker::new(),
            )
            .unwrap();
        projector.stop();
        projector.stop();
        queue.close();
        projector.join().await;
        assert!(!projector.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fixed_interval_tolerates_underrun() {
        let projector = StreamProjector::new();
        let queue = Arc::new(FrameQueue::new(4, AdmissionPolicy::Blocking));
        let sink = StubSink::completing();

        projector
            .start(
                Arc::clone(&queue),
                encoder(),
                sink.clone(),
                PacingMode::FixedInterval,
                50.0,
                UploadTracker::new(),
            )
            .unwrap();

        // Let a few empty intervals pass, then feed one frame.
        tokio::time::sleep(Duration::from_millis(80)).await;
        queue.enqueue(raw_frame(0)).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        projector.stop();
        queue.close();
        projector.join().await;
        assert_eq!(sink.frames.lock().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_slow_upload_failure_still_ends_session() {
        let projector = StreamProjector::new();
        let queue = Arc::new(FrameQueue::new(8, AdmissionPolicy::Blocking));
        // The first dispatch fails 50 ms in, long after all three frames
        // have been forwarded past it.
        let sink = StubSink::failing_first_after("ingest rejected the stream", Duration::from_millis(50));
        let uploads = UploadTracker::new();

        for seq in 0..3 {
            queue.enqueue(raw_frame(seq)).unwrap();
        }
        projector
            .start(
                Arc::clone(&queue),
                encoder(),
                sink,
                PacingMode::Backpressure,
                25.0,
                Arc::clone(&uploads),
            )
            .unwrap();

        for _ in 0..100 {
            if queue.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(queue.is_closed(), "failure never shut the session down");
        assert_eq!(
            uploads.failure().as_deref(),
            Some("ingest rejected the stream")
        );
        projector.join().await;
        assert!(queue.enqueue(raw_frame(3)).is_err());
    }
}
