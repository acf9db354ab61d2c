//! tabletgrid-api — REST API for the tablet scheduler.
//!
//! Read-only views over the scheduler queues, slots and cluster load, plus
//! the two administrative actions the engine supports.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/schedule/pending?limit=` | Pending contexts, highest priority first |
//! | GET | `/api/v1/schedule/running?limit=` | Contexts with a command in flight |
//! | GET | `/api/v1/schedule/history?limit=` | Finalized contexts, newest first |
//! | GET | `/api/v1/schedule/tablets` | Every tablet id tracked by the scheduler |
//! | GET | `/api/v1/schedule` | Filtered query across all queues |
//! | POST | `/api/v1/schedule/clean` | Cancel everything on the next tick |
//! | POST | `/api/v1/schedule/priority` | Raise pending partitions to VERY_HIGH |
//! | GET | `/api/v1/slots` | Per-path clone slots |
//! | GET | `/api/v1/load` | Latest cluster load statistic |
//! | GET | `/api/v1/stats` | Counters and queue sizes |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tabletgrid_scheduler::TabletScheduler;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<TabletScheduler>,
}

/// Build the complete API router (REST + metrics).
pub fn build_router(scheduler: Arc<TabletScheduler>) -> Router {
    let api_state = ApiState { scheduler };

    let api_routes = Router::new()
        .route("/schedule", get(handlers::tablet_schedule))
        .route("/schedule/pending", get(handlers::pending_tablets))
        .route("/schedule/running", get(handlers::running_tablets))
        .route("/schedule/history", get(handlers::history_tablets))
        .route("/schedule/tablets", get(handlers::tablet_ids))
        .route("/schedule/clean", post(handlers::force_clean))
        .route("/schedule/priority", post(handlers::raise_priority))
        .route("/slots", get(handlers::slots))
        .route("/load", get(handlers::cluster_load))
        .route("/stats", get(handlers::stats))
        .with_state(api_state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(api_state))
}
