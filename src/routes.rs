use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json,
    Router,
};
use backfill_utils::split_delivery;
use data_model::{BackfillRequest, GapNotice, OrphanSignal, WindowRecord};
use gap_engine::GapEngine;
use processor::{
    queue::{Queue, SendOptions},
    stream::EventStream,
    TimerConfig,
};
use serde::de::DeserializeOwned;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::http_objects::{Accepted, ApiError, Health};

#[derive(Clone)]
pub struct RouteState {
    pub gap_engine: Arc<GapEngine>,
    pub orphan_signals: Arc<EventStream>,
    pub gap_notices: Arc<EventStream>,
    pub retry_queue: Arc<Queue>,
    pub timers: TimerConfig,
    pub instance_id: String,
}

pub fn create_routes(route_state: RouteState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/windows", post(record_window))
        .route("/v1/signals/orphans", post(publish_orphan_signals))
        .route("/v1/signals/gaps", post(publish_gap_notices))
        .route("/v1/backfill/retry", post(enqueue_retry))
        .layer(TraceLayer::new_for_http())
        .with_state(route_state)
}

async fn health(State(state): State<RouteState>) -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
        instance_id: state.instance_id,
    })
}

async fn record_window(
    State(state): State<RouteState>,
    body: String,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let window: WindowRecord = serde_json::from_str(&body)?;
    if window.end_window < window.start_window {
        return Err(ApiError::bad_request("endWindow precedes startWindow"));
    }
    state.gap_engine.record_window(&window).await?;
    Ok((StatusCode::CREATED, Json(Accepted { messages: 1 })))
}

/// Checks every line of a newline-delimited body and returns how many
/// messages it holds.
fn validate_delivery<T: DeserializeOwned>(body: &str) -> Result<usize, ApiError> {
    let mut count = 0;
    for line in split_delivery(body) {
        serde_json::from_str::<T>(line)?;
        count += 1;
    }
    if count == 0 {
        return Err(ApiError::bad_request("empty delivery"));
    }
    Ok(count)
}

async fn publish_orphan_signals(
    State(state): State<RouteState>,
    body: String,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let messages = validate_delivery::<OrphanSignal>(&body)?;
    state
        .orphan_signals
        .publish(body)
        .await
        .map_err(ApiError::internal_error)?;
    info!(messages, "accepted orphan signals");
    Ok((StatusCode::ACCEPTED, Json(Accepted { messages })))
}

async fn publish_gap_notices(
    State(state): State<RouteState>,
    body: String,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let messages = validate_delivery::<GapNotice>(&body)?;
    state
        .gap_notices
        .publish(body)
        .await
        .map_err(ApiError::internal_error)?;
    info!(messages, "accepted gap notices");
    Ok((StatusCode::ACCEPTED, Json(Accepted { messages })))
}

async fn enqueue_retry(
    State(state): State<RouteState>,
    body: String,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let request: BackfillRequest = serde_json::from_str(&body)?;
    let options = SendOptions {
        ttl: state.timers.data_gaps_ttl(),
        visibility_delay: state.timers.backfill_retry_visibility(),
    };
    state
        .retry_queue
        .send_json(&request, options)
        .await
        .map_err(ApiError::internal_error)?;
    info!(%request, "backfill request enqueued for retry");
    Ok((StatusCode::ACCEPTED, Json(Accepted { messages: 1 })))
}
