//! Folds the events of one advisor turn into chat messages
//!
//! The processor is a synchronous reducer: it performs no I/O and never
//! suspends, so the order in which events are applied is exactly the order in
//! which they were received. Both the server (to decide what to persist) and
//! chat clients (to render) drive a turn through it.

use std::sync::Arc;

use crate::models::chat::{ChatMessage, Sender};
use crate::models::component::{ComponentAction, ToolAction};
use crate::models::event::StreamEvent;
use crate::sequence::MessageSequencer;

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Complete,
    OnboardingComplete,
    Failed(String),
}

/// What applying a single event changed.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// A new streaming AI message was opened.
    Started(ChatMessage),
    /// Text was appended to the active message.
    TextDelta { message_id: String, delta: String },
    /// The authoritative text replaced the message content.
    TextFinalized(ChatMessage),
    /// Tool call arguments are still arriving.
    ToolCallPending,
    /// A tool call finished; the structured action is informational.
    ToolCallReady(ToolAction),
    /// A component message was added next to the text message.
    ComponentAdded(ChatMessage),
    /// A tool failed on the server. Not shown to the user.
    ToolFailed { tool_name: String, error: String },
    /// The turn ended. `messages` holds every message the terminal event
    /// touched: the finalized active message and, on failure, the error bubble.
    Finished {
        outcome: TurnOutcome,
        messages: Vec<ChatMessage>,
    },
    /// Nothing changed.
    Ignored,
}

impl Effect {
    /// Messages this effect settled that should be written to storage.
    ///
    /// Only finished messages with content qualify; an AI message that never
    /// received text is dropped.
    pub fn persistable(&self) -> Vec<&ChatMessage> {
        let candidates: Vec<&ChatMessage> = match self {
            Effect::TextFinalized(message) | Effect::ComponentAdded(message) => vec![message],
            Effect::Finished { messages, .. } => messages.iter().collect(),
            _ => Vec::new(),
        };
        candidates
            .into_iter()
            .filter(|m| !m.is_streaming && (!m.content.is_empty() || m.component.is_some()))
            .collect()
    }
}

pub struct StreamProcessor {
    conversation_id: String,
    sequencer: Arc<MessageSequencer>,
    messages: Vec<ChatMessage>,
    active: Option<usize>,
    outcome: Option<TurnOutcome>,
    tool_errors: usize,
}

impl StreamProcessor {
    pub fn new<S: Into<String>>(conversation_id: S, sequencer: Arc<MessageSequencer>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            sequencer,
            messages: Vec::new(),
            active: None,
            outcome: None,
            tool_errors: 0,
        }
    }

    /// Apply one event.
    pub fn process(&mut self, event: &StreamEvent) -> Effect {
        if self.outcome.is_some() {
            tracing::debug!("Ignoring {} event after the turn ended", event.kind());
            return Effect::Ignored;
        }

        match event {
            StreamEvent::ResponseCreated { response_id } => {
                self.finalize_active();
                let index = self.open_message(Some(response_id.clone()));
                Effect::Started(self.messages[index].clone())
            }
            StreamEvent::OutputTextStreaming {
                content,
                response_id,
            } => self.append_text(content, response_id.as_deref()),
            StreamEvent::OutputTextDone {
                content,
                response_id,
            } => self.finish_text(content, response_id.as_deref()),
            StreamEvent::FunctionCallArgumentsStreaming {} => Effect::ToolCallPending,
            StreamEvent::FunctionCallArgumentsDone { action } => {
                Effect::ToolCallReady(action.clone())
            }
            StreamEvent::ShowComponent(component) => self.add_component(component),
            StreamEvent::ToolError {
                error, tool_name, ..
            } => {
                self.tool_errors += 1;
                tracing::warn!("Tool {} failed: {}", tool_name, error);
                Effect::ToolFailed {
                    tool_name: tool_name.clone(),
                    error: error.clone(),
                }
            }
            StreamEvent::Complete => self.finish(TurnOutcome::Complete),
            StreamEvent::OnboardingComplete => self.finish(TurnOutcome::OnboardingComplete),
            StreamEvent::Error { error } => {
                let mut touched: Vec<ChatMessage> = self.finalize_active().into_iter().collect();
                let order = self.sequencer.next(&self.conversation_id);
                let bubble = ChatMessage::new(
                    self.conversation_id.as_str(),
                    Sender::System,
                    error.as_str(),
                    order,
                );
                self.messages.push(bubble.clone());
                touched.push(bubble);
                self.outcome = Some(TurnOutcome::Failed(error.clone()));
                Effect::Finished {
                    outcome: TurnOutcome::Failed(error.clone()),
                    messages: touched,
                }
            }
        }
    }

    /// All messages of this turn in emission order.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// The message currently receiving text, if any.
    pub fn active_message(&self) -> Option<&ChatMessage> {
        self.active.map(|index| &self.messages[index])
    }

    pub fn outcome(&self) -> Option<&TurnOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn tool_errors(&self) -> usize {
        self.tool_errors
    }

    /// Stop the active message where it is and return it when it has text.
    ///
    /// Used when a turn is abandoned before its final text arrived.
    pub fn take_partial(&mut self) -> Option<ChatMessage> {
        self.finalize_active()
            .filter(|message| !message.content.is_empty())
    }

    fn open_message(&mut self, response_id: Option<String>) -> usize {
        let order = self.sequencer.next(&self.conversation_id);
        let message = ChatMessage::new(self.conversation_id.as_str(), Sender::Ai, "", order)
            .streaming(response_id);
        self.messages.push(message);
        let index = self.messages.len() - 1;
        self.active = Some(index);
        index
    }

    fn finalize_active(&mut self) -> Option<ChatMessage> {
        let index = self.active.take()?;
        let message = &mut self.messages[index];
        message.is_streaming = false;
        Some(message.clone())
    }

    fn is_finalized_response(&self, response_id: Option<&str>) -> bool {
        match response_id {
            Some(id) => self.messages.iter().any(|m| {
                m.component.is_none() && !m.is_streaming && m.response_id.as_deref() == Some(id)
            }),
            None => false,
        }
    }

    /// Index of the active message, opening a new one when there is none or
    /// when the event belongs to a different response.
    fn active_for(&mut self, response_id: Option<&str>) -> usize {
        if let Some(index) = self.active {
            let current = self.messages[index].response_id.as_deref();
            match (current, response_id) {
                (Some(current), Some(incoming)) if current != incoming => {
                    self.finalize_active();
                }
                _ => return index,
            }
        }
        self.open_message(response_id.map(String::from))
    }

    fn append_text(&mut self, delta: &str, response_id: Option<&str>) -> Effect {
        if self.active.is_none() && self.is_finalized_response(response_id) {
            tracing::debug!("Ignoring text delta for an already finalized response");
            return Effect::Ignored;
        }
        let index = self.active_for(response_id);
        let message = &mut self.messages[index];
        message.content.push_str(delta);
        Effect::TextDelta {
            message_id: message.id.clone(),
            delta: delta.to_string(),
        }
    }

    fn finish_text(&mut self, content: &str, response_id: Option<&str>) -> Effect {
        // A repeated done for a finalized response replaces the text again
        // instead of opening a second message.
        let finalized = match (self.active, response_id) {
            (None, Some(id)) => self.messages.iter().rposition(|m| {
                m.component.is_none() && m.response_id.as_deref() == Some(id)
            }),
            // Without an id the latest text message of the turn is the target
            (None, None) => self
                .messages
                .iter()
                .rposition(|m| m.component.is_none() && m.sender == Sender::Ai),
            _ => None,
        };
        let index = match finalized {
            Some(index) => index,
            None => self.active_for(response_id),
        };

        if self.active == Some(index) {
            self.active = None;
        }
        let message = &mut self.messages[index];
        message.content = content.to_string();
        message.is_streaming = false;
        Effect::TextFinalized(message.clone())
    }

    fn add_component(&mut self, component: &ComponentAction) -> Effect {
        let order = self.sequencer.next(&self.conversation_id);
        let message = ChatMessage::new(
            self.conversation_id.as_str(),
            Sender::Ai,
            component.title.as_str(),
            order,
        )
        .with_component(component.clone());
        self.messages.push(message.clone());
        Effect::ComponentAdded(message)
    }

    fn finish(&mut self, outcome: TurnOutcome) -> Effect {
        let messages = self.finalize_active().into_iter().collect();
        self.outcome = Some(outcome.clone());
        Effect::Finished { outcome, messages }
    }
}
