use crate::routes::{require_user, store_error_response};
use crate::state::AppState;
use advisor::models::chat::ChatMessage;
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Response,
    routing::get,
    Json, Router,
};

/// Stored history of a conversation, sorted by message order
async fn list_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<ChatMessage>>, Response> {
    let user_id = require_user(&headers)?;
    state
        .store
        .authorize(&conversation_id, &user_id)
        .await
        .map_err(store_error_response)?;

    let messages = state
        .store
        .list_messages(&conversation_id)
        .await
        .map_err(store_error_response)?;
    Ok(Json(messages))
}

// Configure routes for this module
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/conversations/:id/messages", get(list_messages))
        .with_state(state)
}
