use crate::state::AppState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use compressd_core::job::{Job, JobState, Submission};
use compressd_core::startup::check_ffmpeg_version;
use compressd_core::PipelineError;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let uptime = (chrono::Utc::now() - state.started_at).num_seconds();

    let broker_ok = state.pipeline.broker.ping().await.is_ok();
    let transcoder_ok = tokio::task::spawn_blocking(|| check_ffmpeg_version().is_ok())
        .await
        .unwrap_or(false);

    let stats = state.pipeline.broker.stats().await.ok();

    let status = if broker_ok && transcoder_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if status == StatusCode::OK { "ok" } else { "degraded" },
            "broker_connected": broker_ok,
            "transcoder_available": transcoder_ok,
            "queue": stats,
            "uptime_secs": uptime,
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
        .into_response()
}

#[derive(Deserialize)]
pub struct CompressRequest {
    pub post_id: u64,
    pub wp_media_path: String,
    pub wp_video_url: Option<String>,
    pub wp_thumbnail_path: Option<String>,
    pub wp_thumbnail_url: Option<String>,
    pub wp_post_url: Option<String>,
    pub year: u32,
    pub month: u32,
}

/// Enqueues a compression job. Submission runs entirely against the broker;
/// the actual pipeline runs out-of-process in a worker.
pub async fn compress(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CompressRequest>,
) -> Response {
    let submission = Submission {
        post_id: req.post_id,
        wp_media_path: req.wp_media_path,
        wp_video_url: req.wp_video_url,
        wp_thumbnail_path: req.wp_thumbnail_path,
        wp_thumbnail_url: req.wp_thumbnail_url,
        wp_post_url: req.wp_post_url,
        year: req.year,
        month: req.month,
    };

    let unix_millis = chrono::Utc::now().timestamp_millis();
    match state.pipeline.broker.enqueue(submission, unix_millis).await {
        Ok(result) => {
            let queue_length = state
                .pipeline
                .broker
                .stats()
                .await
                .map(|s| s.pending + s.processing)
                .unwrap_or(0);
            (
                StatusCode::ACCEPTED,
                Json(json!({
                    "job_id": result.job_id,
                    "queue_position": result.queue_position,
                    "queue_length": queue_length,
                })),
            )
                .into_response()
        }
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize, Default)]
pub struct StatusQuery {
    pub job_id: Option<String>,
    pub post_id: Option<u64>,
}

/// Without parameters, reports aggregate queue stats. Otherwise looks up a
/// single job by `job_id` or, failing that, the most recent job for
/// `post_id`.
pub async fn status(State(state): State<Arc<AppState>>, Query(q): Query<StatusQuery>) -> Response {
    let job = match (&q.job_id, q.post_id) {
        (Some(job_id), _) => state.pipeline.broker.load(job_id).await,
        (None, Some(post_id)) => state.pipeline.broker.find_by_post_id(post_id).await,
        (None, None) => {
            return match state.pipeline.broker.stats().await {
                Ok(stats) => Json(json!({ "queue": stats })).into_response(),
                Err(e) => error_response(&e),
            }
        }
    };

    match job {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({ "error": "job not found" }))).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub limit: Option<isize>,
}

pub async fn admin_jobs(State(state): State<Arc<AppState>>, Query(q): Query<ListQuery>) -> Response {
    let limit = q.limit.unwrap_or(50).clamp(1, 100);
    match state.pipeline.broker.list_recent(limit).await {
        Ok(jobs) => Json(json!({ "jobs": jobs })).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookAction {
    Acknowledge,
    Status,
    Retry,
    Cancel,
}

#[derive(Deserialize)]
pub struct WebhookRequest {
    pub job_id: String,
    pub action: WebhookAction,
}

/// Single administrative endpoint: `acknowledge`/`status` are read-only,
/// `retry`/`cancel` gate on the job's current state.
pub async fn webhook(
    State(state): State<Arc<AppState>>,
    Json(req): Json<WebhookRequest>,
) -> Response {
    let broker = &state.pipeline.broker;

    match req.action {
        WebhookAction::Acknowledge | WebhookAction::Status => match broker.load(&req.job_id).await {
            Ok(Some(job)) => Json(job).into_response(),
            Ok(None) => (StatusCode::NOT_FOUND, Json(json!({ "error": "job not found" }))).into_response(),
            Err(e) => error_response(&e),
        },
        WebhookAction::Retry => match broker.retry(&req.job_id).await {
            Ok(true) => Json(json!({ "ok": true })).into_response(),
            Ok(false) => (
                StatusCode::CONFLICT,
                Json(json!({ "error": "job not eligible for retry" })),
            )
                .into_response(),
            Err(e) => error_response(&e),
        },
        WebhookAction::Cancel => match cancel_job(broker, &req.job_id).await {
            Ok(true) => Json(json!({ "ok": true })).into_response(),
            Ok(false) => (
                StatusCode::CONFLICT,
                Json(json!({ "error": "job not eligible for cancellation" })),
            )
                .into_response(),
            Err(e) => error_response(&e),
        },
    }
}

/// Cancellation is only valid while a job hasn't reached a terminal state;
/// completed/failed jobs are history, not something to cancel.
async fn cancel_job(broker: &compressd_core::Broker, job_id: &str) -> anyhow::Result<bool> {
    let job: Option<Job> = broker.load(job_id).await?;
    match job {
        Some(job) if !matches!(job.state, JobState::Completed | JobState::Failed) => {
            broker.remove(job_id).await
        }
        _ => Ok(false),
    }
}

fn error_response(err: &anyhow::Error) -> Response {
    let code = err
        .downcast_ref::<PipelineError>()
        .map(|p| p.code())
        .unwrap_or("internal_error");
    let status = match code {
        "validation_error" => StatusCode::BAD_REQUEST,
        "unauthorized" => StatusCode::UNAUTHORIZED,
        "rate_limited" => StatusCode::TOO_MANY_REQUESTS,
        "broker_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string(), "code": code }))).into_response()
}
