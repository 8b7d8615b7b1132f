use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::component::{ComponentAction, ToolAction};

/// One event of an advisor turn, as carried on the wire.
///
/// The `type` field selects the variant. Sequence order on the stream is the
/// only ordering authority; see [`StreamFrame::timestamp`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    ResponseCreated {
        response_id: String,
    },
    #[serde(rename = "response_output_text_streaming")]
    OutputTextStreaming {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },
    #[serde(rename = "response_output_text_done")]
    OutputTextDone {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },
    #[serde(rename = "response_function_call_arguments_streaming")]
    FunctionCallArgumentsStreaming {},
    #[serde(rename = "response_function_call_arguments_done")]
    FunctionCallArgumentsDone {
        action: ToolAction,
    },
    ShowComponent(ComponentAction),
    ToolError {
        error: String,
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    OnboardingComplete,
    Error {
        error: String,
    },
    Complete,
}

impl StreamEvent {
    pub fn text_delta<S: Into<String>>(content: S, response_id: Option<String>) -> Self {
        StreamEvent::OutputTextStreaming {
            content: content.into(),
            response_id,
        }
    }

    pub fn text_done<S: Into<String>>(content: S, response_id: Option<String>) -> Self {
        StreamEvent::OutputTextDone {
            content: content.into(),
            response_id,
        }
    }

    pub fn error<S: Into<String>>(error: S) -> Self {
        StreamEvent::Error {
            error: error.into(),
        }
    }

    /// Terminal events end the turn; nothing after them is meaningful.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::Complete | StreamEvent::OnboardingComplete | StreamEvent::Error { .. }
        )
    }

    /// The wire name of this event's `type`.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::ResponseCreated { .. } => "response_created",
            StreamEvent::OutputTextStreaming { .. } => "response_output_text_streaming",
            StreamEvent::OutputTextDone { .. } => "response_output_text_done",
            StreamEvent::FunctionCallArgumentsStreaming {} => {
                "response_function_call_arguments_streaming"
            }
            StreamEvent::FunctionCallArgumentsDone { .. } => "response_function_call_arguments_done",
            StreamEvent::ShowComponent(_) => "show_component",
            StreamEvent::ToolError { .. } => "tool_error",
            StreamEvent::OnboardingComplete => "onboarding_complete",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Complete => "complete",
        }
    }
}

/// A stream event plus its advisory creation time.
///
/// `timestamp` is informational only and must never be used to order events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFrame {
    #[serde(flatten)]
    pub event: StreamEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl StreamFrame {
    pub fn new(event: StreamEvent) -> Self {
        Self {
            event,
            timestamp: Some(Utc::now()),
        }
    }
}

impl From<StreamEvent> for StreamFrame {
    fn from(event: StreamEvent) -> Self {
        StreamFrame::new(event)
    }
}
