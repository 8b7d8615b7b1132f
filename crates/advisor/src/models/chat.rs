use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::component::ComponentAction;
use super::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Ai,
    System,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Ai => "ai",
            Sender::System => "system",
        }
    }
}

/// One visible message of a conversation.
///
/// While a turn is streaming the active AI message grows in place; once the
/// final text arrives `is_streaming` drops to false and the message is handed
/// to persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender: Sender,
    pub content: String,
    pub is_streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<ComponentAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    pub message_order: u64,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new<C, S>(conversation_id: C, sender: Sender, content: S, message_order: u64) -> Self
    where
        C: Into<String>,
        S: Into<String>,
    {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            sender,
            content: content.into(),
            is_streaming: false,
            component: None,
            response_id: None,
            message_order,
            created_at: Utc::now(),
        }
    }

    pub fn streaming(mut self, response_id: Option<String>) -> Self {
        self.is_streaming = true;
        self.response_id = response_id;
        self
    }

    pub fn with_component(mut self, component: ComponentAction) -> Self {
        self.component = Some(component);
        self
    }
}

/// Convert stored chat history into the conversation the model sees.
///
/// Component messages become a short assistant note so the model knows what
/// the user already has on screen. System messages (error bubbles) are not
/// shown to the model.
pub fn history_to_messages(history: &[ChatMessage]) -> Vec<Message> {
    history
        .iter()
        .filter_map(|message| match message.sender {
            Sender::User => Some(Message::user().with_text(&message.content)),
            Sender::Ai => match &message.component {
                Some(component) => Some(Message::assistant().with_text(format!(
                    "[Displayed {} component: {}]",
                    component.component_type, component.title
                ))),
                None if message.content.is_empty() => None,
                None => Some(Message::assistant().with_text(&message.content)),
            },
            Sender::System => None,
        })
        .collect()
}
