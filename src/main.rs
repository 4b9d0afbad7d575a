use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::media::pipeline::Pipeline;
use crate::media::types::UploadMode;
use crate::media::upload::{HttpContainerSink, HttpFrameSink, UploadSink};

mod api;
mod config;
mod error;
mod media;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("framecast", log::LevelFilter::Debug)
        .init();
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    let config = config::StreamConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    });
    log::info!(
        "streaming {} to {} ({:?} mode, {} fps)",
        config.stream_name,
        config.ingest_endpoint,
        config.upload_mode,
        config.fps
    );

    let sink: Arc<dyn UploadSink> = match config.upload_mode {
        UploadMode::Frames => Arc::new(HttpFrameSink::new(
            config.ingest_endpoint.clone(),
            config.stream_name.clone(),
            config.timecode,
        )),
        UploadMode::Container => Arc::new(HttpContainerSink::new(
            config.ingest_endpoint.clone(),
            config.stream_name.clone(),
            config.timecode,
        )),
    };

    let bind_addr = config.bind_addr.clone();
    let pipeline = Arc::new(Pipeline::new(config, sink));

    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    api::start_api_server(cancel_clone, bind_addr, Arc::clone(&pipeline));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    if let Err(e) = pipeline.stop().await {
        log::warn!("shutdown left an unresolved upload: {}", e);
    }
    std::process::exit(0);
}
