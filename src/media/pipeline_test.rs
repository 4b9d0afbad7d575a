// ============================================================================
// Pipeline Controller Tests
// ============================================================================

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use super::{BatchReport, Pipeline, PipelineState};
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::media::types::{AdmissionPolicy, BatchPayload, UploadMode};
use crate::media::upload::testing::StubSink;

const PNG_PREFIX: &str = "data:image/png;base64,";

fn png_payload(shade: u8) -> String {
    let img = image::RgbImage::from_pixel(8, 8, image::Rgb([shade, shade, shade]));
    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
    format!("{}{}", PNG_PREFIX, STANDARD.encode(buf.into_inner()))
}

fn batch(n: usize) -> BatchPayload {
    BatchPayload {
        frames: (0..n).map(|i| png_payload(i as u8 * 20)).collect(),
        timestamps: (0..n).map(|i| i as i64 * 40).collect(),
        framerate: 25.0,
    }
}

fn test_config(mode: UploadMode) -> StreamConfig {
    StreamConfig {
        upload_mode: mode,
        url_data_format: PNG_PREFIX.to_string(),
        queue_capacity: 16,
        admission: AdmissionPolicy::Blocking,
        upload_timeout_ms: Some(2_000),
        ..Default::default()
    }
}

// ------------------------------------------------------------------------
// State machine
// ------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn test_lifecycle_states() {
    let pipeline = Pipeline::new(test_config(UploadMode::Frames), StubSink::completing());
    assert_eq!(pipeline.state(), PipelineState::Idle);

    pipeline.initialize().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Initialized);

    pipeline.start().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Running);

    pipeline.stop().await.unwrap();
    assert_eq!(pipeline.state(), PipelineState::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_from_running_is_illegal() {
    let pipeline = Pipeline::new(test_config(UploadMode::Frames), StubSink::completing());
    pipeline.initialize().unwrap();
    pipeline.start().unwrap();
    assert!(matches!(
        pipeline.start(),
        Err(StreamError::IllegalState(_))
    ));
    pipeline.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_without_initialize_is_illegal() {
    let pipeline = Pipeline::new(test_config(UploadMode::Frames), StubSink::completing());
    assert!(matches!(
        pipeline.start(),
        Err(StreamError::IllegalState(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stopped_requires_explicit_reinitialize() {
    let pipeline = Pipeline::new(test_config(UploadMode::Frames), StubSink::completing());
    pipeline.initialize().unwrap();
    pipeline.start().unwrap();
    pipeline.stop().await.unwrap();

    // No automatic transition back.
    assert!(matches!(
        pipeline.start(),
        Err(StreamError::IllegalState(_))
    ));

    pipeline.initialize().unwrap();
    pipeline.start().unwrap();
    pipeline.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_is_idempotent() {
    let pipeline = Pipeline::new(test_config(UploadMode::Frames), StubSink::completing());
    pipeline.initialize().unwrap();
    pipeline.start().unwrap();
    pipeline.stop().await.unwrap();
    pipeline.stop().await.unwrap();
    assert_eq!(pipeline.state(), PipelineState::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_initialize_while_running_is_illegal() {
    let pipeline = Pipeline::new(test_config(UploadMode::Frames), StubSink::completing());
    pipeline.initialize().unwrap();
    pipeline.start().unwrap();
    assert!(matches!(
        pipeline.initialize(),
        Err(StreamError::IllegalState(_))
    ));
    pipeline.stop().await.unwrap();
}

// ------------------------------------------------------------------------
// Live (frames) mode
// ------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn test_live_batch_reaches_sink_in_order() {
    let sink = StubSink::completing();
    let pipeline = Pipeline::new(test_config(UploadMode::Frames), sink.clone());
    pipeline.initialize().unwrap();
    pipeline.start().unwrap();

    let report = pipeline.process_batch(&batch(3)).unwrap();
    assert_eq!(report.frames, 3);
    assert_eq!(report.decoded, 3);
    assert_eq!(report.enqueued, 3);
    assert_eq!(report.skipped, 0);

    // The projector drains asynchronously.
    for _ in 0..100 {
        if sink.frames.lock().len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    {
        let frames = sink.frames.lock();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames.iter().map(|u| u.seq).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(frames[0].pts_ms, 0);
        assert_eq!(frames[1].pts_ms, 40);
    }
    pipeline.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sequence_continues_across_batches_and_resets_on_reinitialize() {
    let sink = StubSink::completing();
    let pipeline = Pipeline::new(test_config(UploadMode::Frames), sink.clone());
    pipeline.initialize().unwrap();
    pipeline.start().unwrap();

    pipeline.process_batch(&batch(2)).unwrap();
    pipeline.process_batch(&batch(2)).unwrap();
    for _ in 0..100 {
        if sink.frames.lock().len() == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        sink.frames.lock().iter().map(|u| u.seq).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );
    pipeline.stop().await.unwrap();

    pipeline.initialize().unwrap();
    assert_eq!(pipeline.status().processed_frames, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_live_batch_skips_bad_frames_and_continues() {
    let sink = StubSink::completing();
    let pipeline = Pipeline::new(test_config(UploadMode::Frames), sink.clone());
    pipeline.initialize().unwrap();
    pipeline.start().unwrap();

    let mut bad = batch(3);
    bad.frames[1] = "!!garbage!!".to_string();
    let report = pipeline.process_batch(&bad).unwrap();
    assert_eq!(report.decoded, 2);
    assert_eq!(report.skipped, 1);

    for _ in 0..100 {
        if sink.frames.lock().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // The skipped element still consumed sequence index 1.
    assert_eq!(
        sink.frames.lock().iter().map(|u| u.seq).collect::<Vec<_>>(),
        vec![0, 2]
    );
    pipeline.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_live_upload_failure_ends_session_with_cause() {
    // First dispatch fails after later dispatches have already overtaken
    // it; the session must still end and name the cause.
    let sink = StubSink::failing_first_after("stream revoked", Duration::from_millis(40));
    let pipeline = Pipeline::new(test_config(UploadMode::Frames), sink);
    pipeline.initialize().unwrap();
    pipeline.start().unwrap();

    pipeline.process_batch(&batch(3)).unwrap();

    for _ in 0..100 {
        if pipeline.status().upload_failure.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        pipeline.status().upload_failure.as_deref(),
        Some("stream revoked")
    );

    // The next batch reports the upload failure, not a bare closed queue.
    match pipeline.process_batch(&batch(1)).unwrap_err() {
        StreamError::UploadFailed(cause) => assert_eq!(cause, "stream revoked"),
        other => panic!("expected UploadFailed, got {:?}", other),
    }

    // Teardown surfaces it too, and a fresh session starts clean.
    assert!(matches!(
        pipeline.stop().await,
        Err(StreamError::UploadFailed(_))
    ));
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    pipeline.initialize().unwrap();
    assert!(pipeline.status().upload_failure.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_while_not_running_is_illegal() {
    let pipeline = Pipeline::new(test_config(UploadMode::Frames), StubSink::completing());
    pipeline.initialize().unwrap();
    assert!(matches!(
        pipeline.process_batch(&batch(1)),
        Err(StreamError::IllegalState(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mismatched_parallel_arrays_rejected() {
    let pipeline = Pipeline::new(test_config(UploadMode::Frames), StubSink::completing());
    pipeline.initialize().unwrap();
    pipeline.start().unwrap();
    let mut bad = batch(2);
    bad.timestamps.pop();
    assert!(matches!(
        pipeline.process_batch(&bad),
        Err(StreamError::Decode(_))
    ));
    pipeline.stop().await.unwrap();
}

// ------------------------------------------------------------------------
// Container mode
// ------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn test_container_batch_uploads_one_mkv() {
    let sink = StubSink::completing();
    let pipeline = Pipeline::new(test_config(UploadMode::Container), sink.clone());
    pipeline.initialize().unwrap();
    pipeline.start().unwrap();

    // 3 frames at [0, 40, 80] ms, 25 fps, keyframe interval 25: every
    // index is below the interval, so all three are keyframes.
    let report: BatchReport = pipeline.process_batch(&batch(3)).unwrap();
    assert_eq!(report.decoded, 3);
    assert_eq!(report.uploaded, 3);

    let containers = sink.containers.lock();
    assert_eq!(containers.len(), 1);
    assert_eq!(&containers[0][..4], &[0x1A, 0x45, 0xDF, 0xA3]);
    drop(containers);
    pipeline.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_container_batch_all_frames_bad_skips_upload() {
    let sink = StubSink::completing();
    let pipeline = Pipeline::new(test_config(UploadMode::Container), sink.clone());
    pipeline.initialize().unwrap();
    pipeline.start().unwrap();

    let bad = BatchPayload {
        frames: vec!["not-base64!".into(), "also bad".into()],
        timestamps: vec![0, 40],
        framerate: 25.0,
    };
    let report = pipeline.process_batch(&bad).unwrap();
    assert_eq!(report.decoded, 0);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.uploaded, 0);
    assert!(sink.containers.lock().is_empty());
    pipeline.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_container_upload_failure_is_session_fatal() {
    let sink = StubSink::failing("stream not found");
    let pipeline = Pipeline::new(test_config(UploadMode::Container), sink);
    pipeline.initialize().unwrap();
    pipeline.start().unwrap();

    let err = pipeline.process_batch(&batch(2)).unwrap_err();
    match err {
        StreamError::UploadFailed(cause) => assert_eq!(cause, "stream not found"),
        other => panic!("expected UploadFailed, got {:?}", other),
    }
    pipeline.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_container_upload_deadline_expiry_is_timeout() {
    let sink = StubSink::completing_after(Duration::from_millis(300));
    let mut config = test_config(UploadMode::Container);
    config.upload_timeout_ms = Some(50);
    let pipeline = Pipeline::new(config, sink);
    pipeline.initialize().unwrap();
    pipeline.start().unwrap();

    assert!(matches!(
        pipeline.process_batch(&batch(1)),
        Err(StreamError::Timeout(50))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_declared_framerate_rejected() {
    let pipeline = Pipeline::new(test_config(UploadMode::Container), StubSink::completing());
    pipeline.initialize().unwrap();
    pipeline.start().unwrap();
    let mut bad = batch(1);
    bad.framerate = 0.0;
    assert!(matches!(
        pipeline.process_batch(&bad),
        Err(StreamError::Decode(_))
    ));
    pipeline.stop().await.unwrap();
}

// ------------------------------------------------------------------------
// Status
// ------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn test_status_reports_counters() {
    let pipeline = Pipeline::new(test_config(UploadMode::Frames), StubSink::completing());
    let status = pipeline.status();
    assert_eq!(status.state, "idle");
    assert_eq!(status.queue_len, 0);
    assert_eq!(status.queue_dropped, 0);
    assert_eq!(status.processed_frames, 0);
    assert!(status.upload_failure.is_none());
}
