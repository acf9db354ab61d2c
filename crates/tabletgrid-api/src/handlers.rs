//! REST API handlers.
//!
//! Each handler reads from or pokes the shared `TabletScheduler` and
//! returns JSON responses.

use std::collections::HashMap;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::info;

use tabletgrid_scheduler::{QueueGauges, ScheduleQuery, StatSnapshot};

use crate::ApiState;

/// Rows returned by the queue listings when no limit is given.
const DEFAULT_LIMIT: usize = 100;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }
}

// ── Queues ─────────────────────────────────────────────────────

/// GET /api/v1/schedule/pending
pub async fn pending_tablets(State(state): State<ApiState>, Query(q): Query<LimitQuery>) -> impl IntoResponse {
    ApiResponse::ok(state.scheduler.pending_tablets_info(q.limit()))
}

/// GET /api/v1/schedule/running
pub async fn running_tablets(State(state): State<ApiState>, Query(q): Query<LimitQuery>) -> impl IntoResponse {
    ApiResponse::ok(state.scheduler.running_tablets_info(q.limit()))
}

/// GET /api/v1/schedule/history
pub async fn history_tablets(State(state): State<ApiState>, Query(q): Query<LimitQuery>) -> impl IntoResponse {
    ApiResponse::ok(state.scheduler.history_tablets_info(q.limit()))
}

/// GET /api/v1/schedule/tablets
pub async fn tablet_ids(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.scheduler.all_tablet_ids())
}

/// GET /api/v1/schedule
pub async fn tablet_schedule(State(state): State<ApiState>, Query(query): Query<ScheduleQuery>) -> impl IntoResponse {
    ApiResponse::ok(state.scheduler.tablet_schedule(&query))
}

// ── Administration ─────────────────────────────────────────────

/// POST /api/v1/schedule/clean
pub async fn force_clean(State(state): State<ApiState>) -> impl IntoResponse {
    state.scheduler.force_clean_sched_queue();
    ApiResponse::ok("force clean requested")
}

/// Priority request body.
#[derive(Debug, Deserialize)]
pub struct PriorityRequest {
    pub db_id: u64,
    pub table_id: u64,
    /// Logical or physical partition ids.
    pub partition_ids: Vec<u64>,
}

#[derive(Debug, Serialize)]
struct PriorityChanged {
    changed: usize,
}

/// POST /api/v1/schedule/priority
pub async fn raise_priority(State(state): State<ApiState>, Json(req): Json<PriorityRequest>) -> impl IntoResponse {
    if req.partition_ids.is_empty() {
        return error_response("partition_ids must not be empty", StatusCode::BAD_REQUEST).into_response();
    }
    let changed = state
        .scheduler
        .change_tablets_priority_to_very_high(req.db_id, req.table_id, &req.partition_ids);
    info!(db_id = req.db_id, table_id = req.table_id, changed, "tablet priority raised");
    ApiResponse::ok(PriorityChanged { changed }).into_response()
}

// ── Cluster ────────────────────────────────────────────────────

/// GET /api/v1/slots
pub async fn slots(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.scheduler.slots_info())
}

/// GET /api/v1/load
pub async fn cluster_load(State(state): State<ApiState>) -> impl IntoResponse {
    match state.scheduler.load_statistic() {
        Some(statistic) => ApiResponse::ok(serde_json::json!({
            "brief": statistic.brief(),
            "statistic": statistic.as_ref(),
        }))
        .into_response(),
        None => error_response("cluster load statistic is not ready", StatusCode::SERVICE_UNAVAILABLE)
            .into_response(),
    }
}

#[derive(Debug, Serialize)]
struct SchedulerStats {
    rebalancer: &'static str,
    counters: StatSnapshot,
    queues: QueueGauges,
    colocate_groups: HashMap<u64, usize>,
}

/// GET /api/v1/stats
pub async fn stats(State(state): State<ApiState>) -> impl IntoResponse {
    let scheduler = &state.scheduler;
    ApiResponse::ok(SchedulerStats {
        rebalancer: scheduler.rebalancer_name(),
        counters: scheduler.stat_snapshot(),
        queues: scheduler.queue_gauges(),
        colocate_groups: scheduler.tablets_in_sched_by_colocate_group(),
    })
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let body = state.scheduler.render_prometheus();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
