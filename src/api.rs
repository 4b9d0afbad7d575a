use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::media::pipeline::{BatchReport, Pipeline, PipelineState, PipelineStatus};
use crate::media::types::BatchPayload;

pub(crate) fn start_api_server(
    cancel: CancellationToken,
    bind_addr: String,
    pipeline: Arc<Pipeline>,
) {
    tokio::spawn(async move {
        let app = Router::new()
            .route("/stream", post(ingest_batch).options(preflight))
            .route("/status", get(status))
            .route("/stop", post(stop))
            .layer(middleware::from_fn(cors))
            .with_state(pipeline);

        let listener = TcpListener::bind(&bind_addr).await.unwrap();
        log::info!("API server started on {}", bind_addr);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("Error starting API server: {}", e);
        }
    });
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {
            log::info!("Shutting down API server...");
        }
    }
}

/// Browser clients post batches cross-origin, so every answer carries
/// the permissive headers.
async fn cors(request: axum::extract::Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("OPTIONS,POST"),
    );
    response
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Accept one snapshot batch. The first batch of a session brings the
/// pipeline up; later batches reuse the running session.
async fn ingest_batch(
    State(pipeline): State<Arc<Pipeline>>,
    Json(batch): Json<BatchPayload>,
) -> ApiJsonResult<BatchReport> {
    match pipeline.state() {
        PipelineState::Idle | PipelineState::Stopped => {
            pipeline.initialize()?;
            pipeline.start()?;
        }
        PipelineState::Initialized => pipeline.start()?,
        PipelineState::Running => {}
    }

    let worker = Arc::clone(&pipeline);
    let report = tokio::task::spawn_blocking(move || worker.process_batch(&batch))
        .await
        .map_err(|e| StreamError::UploadFailed(e.to_string()))??;
    Ok(Json(report))
}

async fn status(State(pipeline): State<Arc<Pipeline>>) -> Json<PipelineStatus> {
    Json(pipeline.status())
}

async fn stop(State(pipeline): State<Arc<Pipeline>>) -> ApiJsonResult<PipelineStatus> {
    pipeline.stop().await?;
    Ok(Json(pipeline.status()))
}

pub type ApiResult<T> = Result<T, ApiError>;
pub type ApiJsonResult<T> = ApiResult<Json<T>>;

pub struct ApiError(StreamError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StreamError::Decode(_) | StreamError::UnsupportedFormat(_) => StatusCode::BAD_REQUEST,
            StreamError::IllegalState(_) | StreamError::AlreadyRunning => StatusCode::CONFLICT,
            StreamError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            StreamError::UploadFailed(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        log::error!("ApiError ({}): {}", self.0.kind(), self.0);
        (
            status,
            Json(serde_json::json!({
                "error": self.0.kind(),
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

impl From<StreamError> for ApiError {
    fn from(err: StreamError) -> Self {
        Self(err)
    }
}
