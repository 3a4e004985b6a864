//! HTTP surface of the cell agent.
//!
//! Thin routing glue over the auction cell and the evacuation trigger;
//! every handler delegates to a core capability.

pub mod error;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use hive_cell_api::Work;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::auction::{AuctionCell, OperationError, StateError};
use crate::evacuation::EvacuationTrigger;
use error::ApiError;

#[derive(Clone)]
pub struct ApiState {
    pub cell: AuctionCell,
    pub evacuation: EvacuationTrigger,
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/state", get(cell_state))
        .route("/work", post(perform))
        .route(
            "/v1/lrps/{process_guid}/instances/{instance_guid}/stop",
            post(stop_lrp_instance),
        )
        .route("/v1/tasks/{task_guid}/cancel", post(cancel_task))
        .route("/evacuate", post(evacuate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ping() -> impl IntoResponse {
    StatusCode::OK
}

async fn cell_state(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    match state.cell.state().await {
        Ok(cell_state) => Ok(Json(cell_state)),
        Err(StateError::Unhealthy) => Err(ApiError::service_unavailable(
            "cell-unhealthy",
            "container backend health probe failing",
        )),
    }
}

async fn perform(
    State(state): State<ApiState>,
    Json(work): Json<Work>,
) -> impl IntoResponse {
    debug!(items = work.len(), "work batch received");
    let failed = state.cell.perform(work).await;
    Json(failed)
}

async fn stop_lrp_instance(
    State(state): State<ApiState>,
    Path((process_guid, instance_guid)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .cell
        .stop_lrp_instance(&process_guid, &instance_guid)
        .await
        .map(|()| StatusCode::ACCEPTED)
        .map_err(operation_error)
}

async fn cancel_task(
    State(state): State<ApiState>,
    Path(task_guid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .cell
        .cancel_task(&task_guid)
        .await
        .map(|()| StatusCode::ACCEPTED)
        .map_err(operation_error)
}

async fn evacuate(State(state): State<ApiState>) -> impl IntoResponse {
    state.evacuation.request();
    StatusCode::ACCEPTED
}

fn operation_error(err: OperationError) -> ApiError {
    match err {
        OperationError::NotFound(what) => ApiError::not_found("unknown-instance", what),
        OperationError::Backend(e) => ApiError::internal("backend-error", e.to_string()),
        OperationError::Store(e) => ApiError::internal("store-error", e.to_string()),
    }
}
