// Export route modules
pub mod chat;
pub mod messages;
pub mod queue;

use advisor::errors::StoreError;
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

/// Header carrying the authenticated user, set by the auth layer in front of us
pub const USER_HEADER: &str = "x-user-id";

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

pub fn store_error_response(err: StoreError) -> Response {
    let status = match &err {
        StoreError::Forbidden { .. } => StatusCode::FORBIDDEN,
        StoreError::ConversationNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("Store error: {}", err);
    }
    error_response(status, err.to_string())
}

/// The requesting user, or a 401 response when the header is missing.
pub fn require_user(headers: &HeaderMap) -> Result<String, Response> {
    headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|user| !user.is_empty())
        .map(String::from)
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "Missing user"))
}

// Function to configure all routes
pub fn configure(state: AppState) -> Router {
    Router::new()
        .merge(chat::routes(state.clone()))
        .merge(messages::routes(state.clone()))
        .merge(queue::routes(state))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::configuration::ChatSettings;
    use advisor::providers::base::Provider;
    use advisor::queue::{QueueConfig, WriteQueue};
    use advisor::store::{InMemoryMessageStore, MemoryFallbackStore};
    use axum::body::{to_bytes, Body};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;

    pub struct TestApp {
        pub state: AppState,
        pub store: Arc<InMemoryMessageStore>,
        pub fallback: Arc<MemoryFallbackStore>,
    }

    pub fn test_app(provider: Arc<dyn Provider>) -> TestApp {
        test_app_with(provider, ChatSettings::default())
    }

    pub fn test_app_with(provider: Arc<dyn Provider>, chat: ChatSettings) -> TestApp {
        let store = Arc::new(InMemoryMessageStore::new());
        let fallback = Arc::new(MemoryFallbackStore::new());
        let queue = WriteQueue::new(
            QueueConfig {
                retry_delay: Duration::from_millis(10),
                ..QueueConfig::default()
            },
            store.clone(),
            fallback.clone(),
        );
        let (online, _) = watch::channel(true);
        TestApp {
            state: AppState::new(provider, store.clone(), queue, online, chat),
            store,
            fallback,
        }
    }

    pub async fn body_string(body: Body) -> String {
        let bytes = to_bytes(body, usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }
}
