use advisor::advisor::Mode;
use advisor::codec::FrameDecoder;
use advisor::models::chat::ChatMessage;
use advisor::models::event::StreamFrame;
use anyhow::{anyhow, Result};
use async_stream::try_stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Header the server reads the requesting user from
const USER_HEADER: &str = "x-user-id";

pub type FrameStream = BoxStream<'static, Result<StreamFrame>>;

#[derive(Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
    mode: Mode,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
}

/// HTTP client for a running advisord
pub struct AdvisorClient {
    client: Client,
    base_url: String,
    user_id: String,
}

impl AdvisorClient {
    pub fn new(base_url: &str, user_id: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            user_id: user_id.to_string(),
        })
    }

    /// Post one chat turn and decode the event stream that answers it.
    ///
    /// The stream ends after the `[DONE]` sentinel or when the server closes
    /// the connection, whichever comes first.
    pub async fn send(&self, conversation_id: &str, message: &str, mode: Mode) -> Result<FrameStream> {
        let url = format!("{}/conversations/{}/chat", self.base_url, conversation_id);
        let response = self
            .client
            .post(&url)
            .header(USER_HEADER, &self.user_id)
            .json(&ChatRequest { message, mode })
            .send()
            .await?;
        let response = check_status(response).await?;

        let mut bytes = response.bytes_stream();
        let frames: FrameStream = Box::pin(try_stream! {
            let mut decoder = FrameDecoder::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk?;
                for frame in decoder.push(&chunk) {
                    yield frame;
                }
                if decoder.is_done() {
                    break;
                }
            }
            for frame in decoder.finish() {
                yield frame;
            }
        });
        Ok(frames)
    }

    /// The stored history of a conversation, oldest first.
    pub async fn history(&self, conversation_id: &str) -> Result<Vec<ChatMessage>> {
        let url = format!("{}/conversations/{}/messages", self.base_url, conversation_id);
        let response = self
            .client
            .get(&url)
            .header(USER_HEADER, &self.user_id)
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let reason = serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| e.error)
        .unwrap_or(body);
    Err(anyhow!("Server returned {}: {}", status, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use advisor::codec::{encode_done, encode_event};
    use advisor::models::chat::Sender;
    use advisor::models::event::StreamEvent;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_send_decodes_frames_until_done() {
        let server = MockServer::start().await;
        let body = [
            encode_event(StreamEvent::ResponseCreated {
                response_id: "resp_1".to_string(),
            }),
            encode_event(StreamEvent::text_delta("Hi", Some("resp_1".to_string()))),
            encode_event(StreamEvent::Complete),
            encode_done(),
        ]
        .concat();
        Mock::given(method("POST"))
            .and(path("/conversations/conv-1/chat"))
            .and(header("x-user-id", "user-1"))
            .and(body_partial_json(json!({"message": "Hello", "mode": "onboarding"})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let client = AdvisorClient::new(&server.uri(), "user-1").unwrap();
        let frames: Vec<StreamFrame> = client
            .send("conv-1", "Hello", Mode::Onboarding)
            .await
            .unwrap()
            .map(|frame| frame.unwrap())
            .collect()
            .await;

        let kinds: Vec<&str> = frames.iter().map(|f| f.event.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                "response_created",
                "response_output_text_streaming",
                "complete"
            ]
        );
    }

    #[tokio::test]
    async fn test_send_surfaces_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/conversations/conv-1/chat"))
            .respond_with(
                ResponseTemplate::new(403)
                    .set_body_json(json!({"error": "User user-2 does not own conversation conv-1"})),
            )
            .mount(&server)
            .await;

        let client = AdvisorClient::new(&server.uri(), "user-2").unwrap();
        let err = match client.send("conv-1", "Hello", Mode::Advisory).await {
            Ok(_) => panic!("expected the request to be rejected"),
            Err(e) => e,
        };
        let message = err.to_string();
        assert!(message.contains("403"));
        assert!(message.contains("does not own conversation"));
    }

    #[tokio::test]
    async fn test_history() {
        let server = MockServer::start().await;
        let messages = vec![
            ChatMessage::new("conv-1", Sender::User, "What did I spend?", 1),
            ChatMessage::new("conv-1", Sender::Ai, "You spent $1,240.", 2),
        ];
        Mock::given(method("GET"))
            .and(path("/conversations/conv-1/messages"))
            .and(header("x-user-id", "user-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&messages))
            .mount(&server)
            .await;

        let client = AdvisorClient::new(&format!("{}/", server.uri()), "user-1").unwrap();
        let history = client.history("conv-1").await.unwrap();
        assert_eq!(history, messages);
    }
}
