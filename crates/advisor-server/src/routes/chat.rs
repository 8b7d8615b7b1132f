use crate::configuration::ChatSettings;
use crate::routes::{error_response, require_user, store_error_response};
use crate::state::AppState;
use advisor::advisor::{Advisor, Mode};
use advisor::codec;
use advisor::models::chat::{history_to_messages, ChatMessage, Sender};
use advisor::models::event::StreamEvent;
use advisor::models::message::Message;
use advisor::processor::{Effect, StreamProcessor};
use advisor::queue::{NewMessage, WriteQueue};
use advisor::sequence::MessageSequencer;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use futures::{stream::StreamExt, Stream};
use serde::Deserialize;
use serde_json::json;
use std::{
    convert::Infallible,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;

const INTERRUPTED: &str = "The advisor stopped unexpectedly. Please send your message again.";
const TIMED_OUT: &str = "The advisor took too long to respond. Please send your message again.";

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    mode: Mode,
}

// Server-sent event stream of advisor frames
pub struct SseResponse {
    rx: ReceiverStream<String>,
}

impl SseResponse {
    fn new(rx: ReceiverStream<String>) -> Self {
        Self { rx }
    }
}

impl Stream for SseResponse {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx)
            .poll_next(cx)
            .map(|opt| opt.map(|s| Ok(Bytes::from(s))))
    }
}

impl IntoResponse for SseResponse {
    fn into_response(self) -> Response {
        let body = Body::from_stream(self);

        (
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
                (header::CONNECTION, "keep-alive"),
            ],
            body,
        )
            .into_response()
    }
}

/// How the turn task stopped
#[derive(Debug, PartialEq)]
enum TurnEnd {
    /// A terminal frame went out
    Terminal,
    /// The client went away
    Disconnected,
    /// The advisor stream ended without a terminal event
    Exhausted,
}

/// Everything a turn task needs, detached from the request
struct Turn {
    conversation_id: String,
    queue: WriteQueue,
    sequencer: Arc<MessageSequencer>,
    settings: ChatSettings,
    tx: mpsc::Sender<String>,
}

impl Turn {
    /// Queue whatever the effect settled. Error bubbles skip the batch so
    /// they show up in history right away.
    async fn persist(&self, effect: &Effect) {
        for message in effect.persistable() {
            let new_message = NewMessage::from_chat(message);
            if message.sender == Sender::System {
                self.queue.enqueue_immediate(new_message).await;
            } else {
                self.queue.enqueue(new_message);
            }
        }
    }

    /// Apply, persist and forward one event. Returns false once the client
    /// is gone.
    async fn emit(&self, processor: &mut StreamProcessor, event: StreamEvent) -> bool {
        let effect = processor.process(&event);
        self.persist(&effect).await;
        self.tx.send(codec::encode_event(event)).await.is_ok()
    }

    fn save_partial(&self, processor: &mut StreamProcessor) {
        if let Some(partial) = processor.take_partial() {
            tracing::info!(
                conversation = %self.conversation_id,
                "Client disconnected, keeping {} characters of partial text",
                partial.content.len()
            );
            self.queue.enqueue(partial_message(&partial));
        }
    }

    async fn drive(self, advisor: Advisor, history: Vec<Message>) -> TurnEnd {
        let mut processor =
            StreamProcessor::new(self.conversation_id.as_str(), Arc::clone(&self.sequencer));
        let mut stream = advisor.reply(history);
        let heartbeat = self.settings.heartbeat();
        let upstream_timeout = self.settings.upstream_timeout();
        let mut idle = Duration::ZERO;

        loop {
            match timeout(heartbeat, stream.next()).await {
                Ok(Some(event)) => {
                    idle = Duration::ZERO;
                    if !self.emit(&mut processor, event).await {
                        self.save_partial(&mut processor);
                        return TurnEnd::Disconnected;
                    }
                    if processor.is_finished() {
                        return TurnEnd::Terminal;
                    }
                }
                Ok(None) => {
                    self.save_partial(&mut processor);
                    return TurnEnd::Exhausted;
                }
                Err(_) => {
                    // Heartbeat, used to detect disconnected clients and hung upstreams.
                    if self.tx.is_closed() {
                        self.save_partial(&mut processor);
                        return TurnEnd::Disconnected;
                    }
                    idle += heartbeat;
                    if idle >= upstream_timeout {
                        tracing::warn!(
                            conversation = %self.conversation_id,
                            "No model output for {:?}, failing the turn",
                            upstream_timeout
                        );
                        self.save_partial(&mut processor);
                        self.emit(&mut processor, StreamEvent::error(TIMED_OUT)).await;
                        return TurnEnd::Terminal;
                    }
                }
            }
        }
    }
}

/// Stored history plus the writes still waiting in the queue, by message order
fn with_pending(mut history: Vec<ChatMessage>, pending: Vec<ChatMessage>) -> Vec<ChatMessage> {
    for message in pending {
        if !history.iter().any(|stored| stored.id == message.id) {
            history.push(message);
        }
    }
    history.sort_by_key(|message| message.message_order);
    history
}

fn partial_message(message: &ChatMessage) -> NewMessage {
    NewMessage::from_chat(message).with_metadata("partial", json!(true))
}

/// Run the turn and make sure the stream ends with a terminal frame and the
/// done sentinel, whatever happens inside it.
async fn run_turn(turn: Turn, advisor: Advisor, history: Vec<Message>) {
    let conversation_id = turn.conversation_id.clone();
    let queue = turn.queue.clone();
    let sequencer = Arc::clone(&turn.sequencer);
    let tx = turn.tx.clone();

    let end = match tokio::spawn(turn.drive(advisor, history)).await {
        Ok(end) => end,
        Err(e) => {
            tracing::error!(conversation = %conversation_id, "Chat turn aborted: {}", e);
            TurnEnd::Exhausted
        }
    };

    if end == TurnEnd::Exhausted {
        let bubble = ChatMessage::new(
            conversation_id.as_str(),
            Sender::System,
            INTERRUPTED,
            sequencer.next(&conversation_id),
        );
        queue.enqueue_immediate(NewMessage::from_chat(&bubble)).await;
        let _ = tx.send(codec::encode_event(StreamEvent::error(INTERRUPTED))).await;
    }
    let _ = tx.send(codec::encode_done()).await;
}

async fn handler(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<SseResponse, Response> {
    let user_id = require_user(&headers)?;
    let content = request.message.trim();
    if content.is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "Message is required"));
    }

    state
        .store
        .authorize(&conversation_id, &user_id)
        .await
        .map_err(store_error_response)?;

    // Keep orders monotonic across restarts before anything new is numbered.
    let last_order = state
        .store
        .last_message_order(&conversation_id)
        .await
        .map_err(store_error_response)?;
    state.sequencer.observe(&conversation_id, last_order);
    // Replies of earlier turns may not have reached storage yet
    let pending = state.queue.pending_messages(&conversation_id);
    if let Some(last) = pending.last() {
        state.sequencer.observe(&conversation_id, last.message_order);
    }

    // The user message is the ordering anchor: it is stored before the model
    // is called and never goes through the queue.
    let order = state.sequencer.next(&conversation_id);
    let user_message = state
        .store
        .persist_user_message(&conversation_id, &user_id, content, order)
        .await
        .map_err(|e| {
            tracing::error!(conversation = %conversation_id, "Failed to store user message: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save message")
        })?;

    let stored = match state.store.list_messages(&conversation_id).await {
        Ok(history) => history,
        Err(e) => {
            tracing::warn!("Failed to load history, answering without it: {}", e);
            vec![user_message]
        }
    };
    let history = with_pending(stored, pending);
    let start = history.len().saturating_sub(state.chat.history_limit.max(1));
    let messages = history_to_messages(&history[start..]);

    let advisor = Advisor::new(Arc::clone(&state.provider))
        .with_mode(request.mode)
        .with_max_tool_rounds(state.chat.max_tool_rounds);

    // Create channel for streaming
    let (tx, rx) = mpsc::channel(100);
    let turn = Turn {
        conversation_id,
        queue: state.queue.clone(),
        sequencer: Arc::clone(&state.sequencer),
        settings: state.chat.clone(),
        tx,
    };
    tokio::spawn(run_turn(turn, advisor, messages));

    Ok(SseResponse::new(ReceiverStream::new(rx)))
}

// Configure routes for this module
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/conversations/:id/chat", post(handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::{body_string, test_app, test_app_with, TestApp};
    use advisor::codec::FrameDecoder;
    use advisor::models::tool::Tool;
    use advisor::providers::base::{ModelEvent, ModelStream, Provider};
    use advisor::providers::mock::MockProvider;
    use advisor::store::MessageStore;
    use async_trait::async_trait;
    use axum::http::Request;
    use futures::stream;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    /// Streams a fixed prefix and then never finishes
    struct HangingProvider {
        prefix: Vec<ModelEvent>,
    }

    #[async_trait]
    impl Provider for HangingProvider {
        async fn stream(
            &self,
            _system: &str,
            _messages: &[Message],
            _tools: &[Tool],
        ) -> anyhow::Result<ModelStream> {
            let prefix: Vec<anyhow::Result<ModelEvent>> =
                self.prefix.iter().cloned().map(Ok).collect();
            Ok(Box::pin(stream::iter(prefix).chain(stream::pending())))
        }
    }

    struct PanickingProvider;

    #[async_trait]
    impl Provider for PanickingProvider {
        async fn stream(
            &self,
            _system: &str,
            _messages: &[Message],
            _tools: &[Tool],
        ) -> anyhow::Result<ModelStream> {
            panic!("provider bug");
        }
    }

    fn chat_request(conversation: &str, user: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .uri(format!("/conversations/{}/chat", conversation))
            .method("POST")
            .header("content-type", "application/json");
        if let Some(user) = user {
            builder = builder.header("x-user-id", user);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn decode(body: &str) -> (Vec<StreamEvent>, bool) {
        let mut decoder = FrameDecoder::new();
        let events = decoder
            .push(body.as_bytes())
            .into_iter()
            .map(|frame| frame.event)
            .collect();
        (events, decoder.is_done())
    }

    async fn post_turn(app: &TestApp, conversation: &str, message: &str) -> (StatusCode, String) {
        let response = routes(app.state.clone())
            .oneshot(chat_request(
                conversation,
                Some("user-1"),
                json!({ "message": message }),
            ))
            .await
            .unwrap();
        let status = response.status();
        (status, body_string(response.into_body()).await)
    }

    #[tokio::test]
    async fn test_rejects_invalid_turns() {
        let app = test_app(Arc::new(MockProvider::default()));

        let response = routes(app.state.clone())
            .oneshot(chat_request("conv-1", None, json!({"message": "Hi"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = routes(app.state.clone())
            .oneshot(chat_request("conv-1", Some("user-1"), json!({"message": "   "})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        app.store.authorize("conv-1", "owner").await.unwrap();
        let response = routes(app.state.clone())
            .oneshot(chat_request("conv-1", Some("user-1"), json!({"message": "Hi"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // Nothing was stored for the rejected turns.
        assert!(app.store.list_messages("conv-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_streams_turn_and_persists_in_order() {
        let provider = MockProvider::new(vec![
            MockProvider::tool_round(
                "r1",
                "call_1",
                "show_component",
                r#"{"componentType":"goal_form","title":"Emergency fund","componentId":"c1"}"#,
            ),
            MockProvider::text_round("r2", "Start with three months of expenses."),
        ]);
        let app = test_app(Arc::new(provider));

        let (status, body) = post_turn(&app, "conv-1", "How big should my emergency fund be?").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.ends_with("data: [DONE]\n\n"));

        let (events, done) = decode(&body);
        assert!(done);
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::ShowComponent(c) if c.component_id == "c1")));
        assert_eq!(events.last(), Some(&StreamEvent::Complete));

        app.state.queue.flush().await;
        let stored = app.store.list_messages("conv-1").await.unwrap();
        let view: Vec<(Sender, &str)> = stored
            .iter()
            .map(|m| (m.sender, m.content.as_str()))
            .collect();
        assert_eq!(
            view,
            vec![
                (Sender::User, "How big should my emergency fund be?"),
                (Sender::Ai, "Emergency fund"),
                (Sender::Ai, "Start with three months of expenses."),
            ]
        );
    }

    #[tokio::test]
    async fn test_orders_continue_across_turns() {
        let provider = MockProvider::new(vec![
            MockProvider::text_round("r1", "First answer."),
            MockProvider::text_round("r2", "Second answer."),
        ]);
        let app = test_app(Arc::new(provider));

        post_turn(&app, "conv-1", "First question").await;
        app.state.queue.flush().await;

        // A fresh sequencer, as after a restart, must pick up where storage left off.
        let mut state = app.state.clone();
        state.sequencer = Arc::new(MessageSequencer::new());
        let restarted = TestApp {
            state,
            store: app.store.clone(),
            fallback: app.fallback.clone(),
        };
        post_turn(&restarted, "conv-1", "Second question").await;
        restarted.state.queue.flush().await;

        let stored = app.store.list_messages("conv-1").await.unwrap();
        let contents: Vec<&str> = stored.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["First question", "First answer.", "Second question", "Second answer."]
        );
    }

    #[tokio::test]
    async fn test_history_includes_replies_still_queued() {
        let provider = MockProvider::new(vec![MockProvider::text_round("r2", "Groceries were $420.")]);
        let app = test_app(Arc::new(provider.clone()));
        app.store
            .persist_user_message("conv-1", "user-1", "What did I spend?", 1)
            .await
            .unwrap();
        // The previous answer has not been flushed to storage yet
        app.state.queue.enqueue(NewMessage::from_chat(&ChatMessage::new(
            "conv-1",
            Sender::Ai,
            "You spent $1,240.",
            2,
        )));

        let (status, _) = post_turn(&app, "conv-1", "Break it down").await;
        assert_eq!(status, StatusCode::OK);

        let requests = provider.requests();
        let texts: Vec<String> = requests[0].iter().map(|m| m.text()).collect();
        assert_eq!(
            texts,
            vec!["What did I spend?", "You spent $1,240.", "Break it down"]
        );

        app.state.queue.flush().await;
        let stored = app.store.list_messages("conv-1").await.unwrap();
        let orders: Vec<u64> = stored.iter().map(|m| m.message_order).collect();
        assert_eq!(orders, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_upstream_failure_sends_error_then_done() {
        let app = test_app(Arc::new(MockProvider::unreachable()));

        let (status, body) = post_turn(&app, "conv-1", "Hello").await;
        assert_eq!(status, StatusCode::OK);

        let (events, done) = decode(&body);
        assert!(done);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Error { .. }));

        app.state.queue.wait_for_pending().await;
        let stored = app.store.list_messages("conv-1").await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].sender, Sender::System);
    }

    #[tokio::test]
    async fn test_panicking_turn_still_terminates_stream() {
        let app = test_app(Arc::new(PanickingProvider));

        let (status, body) = post_turn(&app, "conv-1", "Hello").await;
        assert_eq!(status, StatusCode::OK);

        let (events, done) = decode(&body);
        assert!(done);
        assert_eq!(events, vec![StreamEvent::error(INTERRUPTED)]);
    }

    #[tokio::test]
    async fn test_hung_upstream_times_out() {
        let provider = HangingProvider {
            prefix: vec![
                ModelEvent::ResponseCreated {
                    id: "r1".to_string(),
                },
                ModelEvent::TextDelta("Thinking".to_string()),
            ],
        };
        let app = test_app_with(
            Arc::new(provider),
            ChatSettings {
                upstream_timeout_secs: 1,
                heartbeat_ms: 50,
                ..ChatSettings::default()
            },
        );

        let (_, body) = post_turn(&app, "conv-1", "Hello").await;
        let (events, done) = decode(&body);
        assert!(done);
        assert_eq!(events.last(), Some(&StreamEvent::error(TIMED_OUT)));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_keeps_partial_text() {
        let provider = HangingProvider {
            prefix: vec![
                ModelEvent::ResponseCreated {
                    id: "r1".to_string(),
                },
                ModelEvent::TextDelta("Partial answer".to_string()),
            ],
        };
        let app = test_app_with(
            Arc::new(provider),
            ChatSettings {
                heartbeat_ms: 10,
                ..ChatSettings::default()
            },
        );

        let response = routes(app.state.clone())
            .oneshot(chat_request("conv-1", Some("user-1"), json!({"message": "Hello"})))
            .await
            .unwrap();
        let mut body = response.into_body();
        let mut seen = String::new();
        while !seen.contains("Partial answer") {
            let frame = body.frame().await.unwrap().unwrap();
            if let Ok(data) = frame.into_data() {
                seen.push_str(&String::from_utf8_lossy(&data));
            }
        }
        drop(body);

        let mut stored = Vec::new();
        for _ in 0..100 {
            app.state.queue.flush().await;
            stored = app.store.list_messages("conv-1").await.unwrap();
            if stored.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].content, "Partial answer");
        assert_eq!(stored[1].response_id.as_deref(), Some("r1"));
    }

    #[test]
    fn test_partial_message_is_flagged() {
        let message = ChatMessage::new("conv-1", Sender::Ai, "Half", 2).streaming(None);
        let new_message = partial_message(&message);
        assert_eq!(new_message.metadata, Some(json!({"partial": true})));
        assert_eq!(new_message.message_order, 2);
    }
}
