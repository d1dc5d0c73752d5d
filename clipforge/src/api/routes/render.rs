//! Render job routes.

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    routing::{get, post},
};

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{JobResponse, RenderRequest, SubmitResponse};
use crate::api::server::AppState;
use crate::scheduler::CancelOutcome;

/// Create the render router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(submit_render))
        .route("/{job_id}", get(get_render).delete(cancel_render))
}

/// Submit a render job.
async fn submit_render(
    State(state): State<AppState>,
    payload: Result<Json<RenderRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let Json(request) = payload.map_err(|e| ApiError::validation(e.body_text()))?;
    let job = state.scheduler.submit(&request).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse::from(&job))))
}

/// Poll a render job.
async fn get_render(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobResponse>> {
    let job = state.scheduler.get_job(&job_id)?;
    Ok(Json(JobResponse::from_job(&job, &state.public_base_url)))
}

/// Cancel a render job.
///
/// `200` once cancelled, `202` while a running render is stopping.
async fn cancel_render(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<(StatusCode, Json<JobResponse>)> {
    let outcome = state.scheduler.cancel_job(&job_id)?;
    let status = match outcome {
        CancelOutcome::Cancelled(_) => StatusCode::OK,
        CancelOutcome::Cancelling(_) => StatusCode::ACCEPTED,
    };
    Ok((
        status,
        Json(JobResponse::from_job(outcome.job(), &state.public_base_url)),
    ))
}
