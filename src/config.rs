use std::time::Duration;

use anyhow::Context;

use crate::media::types::{AdmissionPolicy, PacingMode, TimecodeMode, UploadMode};

/// All knobs the pipeline consumes, resolved once in `main` and injected.
/// Business logic never reads the process environment itself.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Target frame rate; also the natural keyframe interval.
    pub fps: f32,
    pub queue_capacity: usize,
    pub keyframe_interval: u32,
    pub admission: AdmissionPolicy,
    pub pacing: PacingMode,
    pub upload_mode: UploadMode,
    pub timecode: TimecodeMode,
    /// Destination stream identity at the ingestion endpoint.
    pub stream_name: String,
    pub ingest_endpoint: String,
    /// Data-URI prefix stripped from inbound payload elements.
    pub url_data_format: String,
    /// Deadline for the blocking upload wait; `None` waits forever.
    pub upload_timeout_ms: Option<u64>,
    pub jpeg_quality: u8,
    pub bind_addr: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            fps: 25.0,
            queue_capacity: 64,
            keyframe_interval: 25,
            admission: AdmissionPolicy::Drop,
            pacing: PacingMode::Backpressure,
            upload_mode: UploadMode::Frames,
            timecode: TimecodeMode::Relative,
            stream_name: "webcam".to_string(),
            ingest_endpoint: "http://localhost:9090".to_string(),
            url_data_format: "data:image/jpeg;base64,".to_string(),
            upload_timeout_ms: Some(30_000),
            jpeg_quality: 85,
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl StreamConfig {
    /// Read the configuration from process environment variables, falling
    /// back to defaults for anything unset. Set values must parse.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(fps) = read("FPS")? {
            config.fps = fps;
            // Keyframe interval follows the frame rate unless overridden.
            config.keyframe_interval = (config.fps.round() as u32).max(1);
        }
        if let Some(capacity) = read("QUEUE_CAPACITY")? {
            config.queue_capacity = capacity;
        }
        if let Some(interval) = read("KEYFRAME_INTERVAL")? {
            config.keyframe_interval = interval;
        }
        if let Some(policy) = read_str("ADMISSION_POLICY") {
            config.admission = policy.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(pacing) = read_str("PACING_MODE") {
            config.pacing = pacing.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(mode) = read_str("UPLOAD_MODE") {
            config.upload_mode = mode.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(mode) = read_str("TIMECODE_MODE") {
            config.timecode = mode.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(name) = read_str("STREAM_NAME") {
            config.stream_name = name;
        }
        if let Some(endpoint) = read_str("INGEST_ENDPOINT") {
            config.ingest_endpoint = endpoint;
        }
        if let Some(prefix) = read_str("URL_DATA_FORMAT") {
            config.url_data_format = prefix;
        }
        if let Some(ms) = read("UPLOAD_TIMEOUT_MS")? {
            config.upload_timeout_ms = if ms == 0 { None } else { Some(ms) };
        }
        if let Some(quality) = read("JPEG_QUALITY")? {
            config.jpeg_quality = quality;
        }
        if let Some(addr) = read_str("BIND_ADDR") {
            config.bind_addr = addr;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.fps > 0.0, "FPS must be positive");
        anyhow::ensure!(self.queue_capacity > 0, "QUEUE_CAPACITY must be positive");
        anyhow::ensure!(self.keyframe_interval > 0, "KEYFRAME_INTERVAL must be positive");
        Ok(())
    }

    pub fn upload_timeout(&self) -> Option<Duration> {
        self.upload_timeout_ms.map(Duration::from_millis)
    }
}

fn read_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read<T: std::str::FromStr>(name: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match read_str(name) {
        Some(value) => {
            let parsed = value
                .parse()
                .with_context(|| format!("invalid value for {}: {}", name, value))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}
