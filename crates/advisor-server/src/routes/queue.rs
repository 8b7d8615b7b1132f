use crate::state::AppState;
use advisor::queue::QueueStats;
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct OnlineRequest {
    online: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OnlineResponse {
    online: bool,
}

async fn stats(State(state): State<AppState>) -> Json<QueueStats> {
    Json(state.queue.stats())
}

/// Recover parked writes and drain the queue now
async fn flush(State(state): State<AppState>) -> Json<QueueStats> {
    let stats = state.queue.flush().await;
    tracing::info!(?stats, "Queue flushed on request");
    Json(stats)
}

/// Connectivity hook: going back online triggers a recovery and flush in
/// the worker, going offline pauses it
async fn set_online(
    State(state): State<AppState>,
    Json(request): Json<OnlineRequest>,
) -> Json<OnlineResponse> {
    let previous = state.online.send_replace(request.online);
    if previous != request.online {
        tracing::info!("Persistence marked {}", if request.online { "online" } else { "offline" });
    }
    Json(OnlineResponse {
        online: request.online,
    })
}

// Configure routes for this module
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/queue/stats", get(stats))
        .route("/queue/flush", post(flush))
        .route("/queue/online", post(set_online))
        .with_state(state)
}
