use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::models::message::Message;
use crate::models::tool::Tool;
use crate::providers::base::{ModelEvent, ModelStream, Provider};

/// One scripted model response. `Err` entries are yielded as stream errors.
pub type MockRound = Vec<std::result::Result<ModelEvent, String>>;

/// A mock provider that replays pre-configured event rounds for testing
///
/// Each call to `stream` consumes the next round. Once the script is exhausted
/// an empty completed response is returned.
#[derive(Clone, Default)]
pub struct MockProvider {
    rounds: Arc<Mutex<VecDeque<MockRound>>>,
    requests: Arc<Mutex<Vec<Vec<Message>>>>,
    fail_to_connect: bool,
}

impl MockProvider {
    pub fn new(rounds: Vec<MockRound>) -> Self {
        Self {
            rounds: Arc::new(Mutex::new(rounds.into())),
            ..Default::default()
        }
    }

    /// A provider whose every request fails before any event is produced
    pub fn unreachable() -> Self {
        Self {
            fail_to_connect: true,
            ..Default::default()
        }
    }

    /// A round that streams `text` word by word and completes
    pub fn text_round(response_id: &str, text: &str) -> MockRound {
        let mut round = vec![Ok(ModelEvent::ResponseCreated {
            id: response_id.to_string(),
        })];
        for word in text.split_inclusive(' ') {
            round.push(Ok(ModelEvent::TextDelta(word.to_string())));
        }
        round.push(Ok(ModelEvent::TextDone(text.to_string())));
        round.push(Ok(ModelEvent::Completed { usage: None }));
        round
    }

    /// A round that asks for a single tool call
    pub fn tool_round(response_id: &str, call_id: &str, name: &str, arguments: &str) -> MockRound {
        vec![
            Ok(ModelEvent::ResponseCreated {
                id: response_id.to_string(),
            }),
            Ok(ModelEvent::ToolCallDelta { index: 0 }),
            Ok(ModelEvent::ToolCallDone {
                id: call_id.to_string(),
                name: name.to_string(),
                arguments: arguments.to_string(),
            }),
            Ok(ModelEvent::Completed { usage: None }),
        ]
    }

    /// Conversations the provider was asked to complete, in call order
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn stream(
        &self,
        _system: &str,
        messages: &[Message],
        _tools: &[Tool],
    ) -> Result<ModelStream> {
        if self.fail_to_connect {
            return Err(anyhow!("Connection refused"));
        }
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages.to_vec());
        }

        let round = self
            .rounds
            .lock()
            .map_err(|_| anyhow!("Mock provider lock poisoned"))?
            .pop_front()
            .unwrap_or_else(|| vec![Ok(ModelEvent::Completed { usage: None })]);

        let events: Vec<Result<ModelEvent>> = round
            .into_iter()
            .map(|event| event.map_err(|e| anyhow!(e)))
            .collect();
        Ok(Box::pin(stream::iter(events)))
    }
}
