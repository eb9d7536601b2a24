use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::{app::AppState, pipeline::Stage};

#[derive(Debug, Serialize)]
struct TriggerResponse {
    job_id: Uuid,
    stage: Stage,
    status: &'static str,
}

pub(crate) async fn fetch_orders(State(state): State<AppState>) -> Response {
    accept(&state, Stage::IngestOrders)
}

pub(crate) async fn get_product_codes(State(state): State<AppState>) -> Response {
    accept(&state, Stage::BackfillDetails)
}

pub(crate) async fn send_notification(State(state): State<AppState>) -> Response {
    accept(&state, Stage::DispatchNotifications)
}

/// Submits the stage and acknowledges without waiting for the run.
fn accept(state: &AppState, stage: Stage) -> Response {
    state.telemetry().record_trigger_invocation(stage);

    let job = state.scheduler().submit(stage);
    info!(job_id = %job.job_id, %stage, "stage run accepted");

    let body = Json(TriggerResponse {
        job_id: job.job_id,
        stage,
        status: "accepted",
    });
    (StatusCode::ACCEPTED, body).into_response()
}
