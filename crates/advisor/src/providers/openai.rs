use anyhow::{anyhow, Result};
use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

use super::base::{ModelEvent, ModelStream, Provider, Usage};
use super::configs::OpenAiProviderConfig;
use super::utils::{check_openai_context_length_error, messages_to_openai_spec, tools_to_openai_spec};
use crate::codec::{SseBuffer, DONE_SENTINEL};
use crate::models::message::Message;
use crate::models::tool::Tool;

pub struct OpenAiProvider {
    client: Client,
    config: OpenAiProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn build_payload(&self, system: &str, messages: &[Message], tools: &[Tool]) -> Result<Value> {
        let system_message = json!({
            "role": "system",
            "content": system
        });

        let messages_spec = messages_to_openai_spec(messages);
        let tools_spec = if !tools.is_empty() {
            tools_to_openai_spec(tools)?
        } else {
            vec![]
        };

        let mut messages_array = vec![system_message];
        messages_array.extend(messages_spec);

        let mut payload = json!({
            "model": self.config.model,
            "messages": messages_array,
            "stream": true,
            "stream_options": {"include_usage": true}
        });

        if let Some(object) = payload.as_object_mut() {
            if !tools_spec.is_empty() {
                object.insert("tools".to_string(), json!(tools_spec));
            }
            if let Some(temp) = self.config.temperature {
                object.insert("temperature".to_string(), json!(temp));
            }
            if let Some(tokens) = self.config.max_tokens {
                object.insert("max_tokens".to_string(), json!(tokens));
            }
        }

        Ok(payload)
    }

    async fn post(&self, payload: Value) -> Result<Response> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.host.trim_end_matches('/')
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&payload)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response),
            status if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() >= 500 => {
                Err(anyhow!("Server error: {}", status))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                if let Ok(error) = serde_json::from_str::<Value>(&body) {
                    if let Some(err) = error
                        .get("error")
                        .and_then(check_openai_context_length_error)
                    {
                        return Err(err.into());
                    }
                }
                Err(anyhow!("Request failed: {}\nBody: {}", status, body))
            }
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn stream(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
    ) -> Result<ModelStream> {
        let payload = self.build_payload(system, messages, tools)?;
        let response = self.post(payload).await?;
        Ok(Box::pin(chunk_events(response.bytes_stream())))
    }
}

/// Turn the raw SSE body of a streamed completion into model events.
fn chunk_events<S>(bytes: S) -> impl Stream<Item = Result<ModelEvent>> + Send + 'static
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut sse = SseBuffer::new();
        let mut chunks = ChunkAccumulator::default();

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk?;
            for payload in sse.push(&chunk) {
                for event in chunks.apply(&payload)? {
                    yield event;
                }
            }
            if chunks.done {
                break;
            }
        }
        if let Some(payload) = sse.finish() {
            for event in chunks.apply(&payload)? {
                yield event;
            }
        }
        for event in chunks.finish() {
            yield event;
        }
    }
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Accumulates streamed chat completion chunks.
///
/// Text deltas are forwarded as they come and also collected for the final
/// text. Tool call fragments are collected per index and only released once
/// the response ends.
#[derive(Debug, Default)]
struct ChunkAccumulator {
    started: bool,
    done: bool,
    text: String,
    tool_calls: BTreeMap<usize, PartialToolCall>,
    usage: Option<Usage>,
}

impl ChunkAccumulator {
    fn apply(&mut self, payload: &str) -> Result<Vec<ModelEvent>> {
        if payload.trim() == DONE_SENTINEL {
            self.done = true;
            return Ok(Vec::new());
        }

        let chunk: Value = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!("Skipping malformed completion chunk: {} ({})", payload, e);
                return Ok(Vec::new());
            }
        };

        if let Some(error) = chunk.get("error") {
            if let Some(err) = check_openai_context_length_error(error) {
                return Err(err.into());
            }
            return Err(anyhow!("OpenAI API error: {}", error));
        }

        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            let id = chunk
                .get("id")
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or_else(|| format!("resp_{}", uuid::Uuid::new_v4().simple()));
            events.push(ModelEvent::ResponseCreated { id });
        }

        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            self.usage = Some(get_usage(usage));
        }

        let delta = &chunk["choices"][0]["delta"];
        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            if !text.is_empty() {
                self.text.push_str(text);
                events.push(ModelEvent::TextDelta(text.to_string()));
            }
        }

        if let Some(calls) = delta.get("tool_calls").and_then(|c| c.as_array()) {
            for call in calls {
                let index = call.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;
                let entry = self.tool_calls.entry(index).or_default();
                if let Some(id) = call.get("id").and_then(|i| i.as_str()) {
                    entry.id = Some(id.to_string());
                }
                let function = &call["function"];
                if let Some(name) = function.get("name").and_then(|n| n.as_str()) {
                    entry.name.push_str(name);
                }
                if let Some(arguments) = function.get("arguments").and_then(|a| a.as_str()) {
                    entry.arguments.push_str(arguments);
                }
                events.push(ModelEvent::ToolCallDelta { index });
            }
        }

        Ok(events)
    }

    fn finish(&mut self) -> Vec<ModelEvent> {
        let mut events = Vec::new();
        if !self.text.is_empty() {
            events.push(ModelEvent::TextDone(std::mem::take(&mut self.text)));
        }
        for (index, call) in std::mem::take(&mut self.tool_calls) {
            events.push(ModelEvent::ToolCallDone {
                id: call.id.unwrap_or_else(|| format!("call_{}", index)),
                name: call.name,
                arguments: call.arguments,
            });
        }
        events.push(ModelEvent::Completed {
            usage: self.usage.take(),
        });
        events
    }
}

fn get_usage(usage: &Value) -> Usage {
    let input_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32);

    let output_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32);

    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32)
        .or_else(|| match (input_tokens, output_tokens) {
            (Some(input), Some(output)) => Some(input + output),
            _ => None,
        });

    Usage::new(input_tokens, output_tokens, total_tokens)
}
