use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::errors::{AdvisorError, AdvisorResult};
use crate::models::component::{ComponentAction, ToolAction};
use crate::models::event::StreamEvent;
use crate::models::message::Message;
use crate::models::tool::{Tool, ToolCall};
use crate::prompt_template::load_prompt_file;
use crate::providers::base::{ModelEvent, Provider};

pub const SHOW_COMPONENT: &str = "show_component";
pub const COMPLETE_ONBOARDING: &str = "complete_onboarding";

/// Component types the chat UI knows how to render
pub const COMPONENT_TYPES: &[&str] = &[
    "income_form",
    "expense_form",
    "budget_form",
    "goal_form",
    "account_summary",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Advisory,
    Onboarding,
}

impl Mode {
    fn prompt_file(&self) -> &'static str {
        match self {
            Mode::Advisory => "advisory.md",
            Mode::Onboarding => "onboarding.md",
        }
    }
}

/// What one finished tool call turned into
#[derive(Debug)]
struct ToolOutcome {
    request: ToolCall,
    result: AdvisorResult<String>,
    events: Vec<StreamEvent>,
    completes_onboarding: bool,
}

/// Advisor drives one chat turn against a language model and republishes
/// the model output as wire events
pub struct Advisor {
    provider: Arc<dyn Provider>,
    mode: Mode,
    max_tool_rounds: usize,
}

impl Advisor {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            mode: Mode::default(),
            max_tool_rounds: 2,
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Bound on follow-up model calls made after tool calls within one turn
    pub fn with_max_tool_rounds(mut self, max_tool_rounds: usize) -> Self {
        self.max_tool_rounds = max_tool_rounds;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn tools(&self) -> Vec<Tool> {
        let mut tools = vec![Tool::new(
            SHOW_COMPONENT,
            "Render an interactive finance widget inline in the chat.",
            json!({
                "type": "object",
                "required": ["componentType", "title"],
                "properties": {
                    "componentType": {
                        "type": "string",
                        "enum": COMPONENT_TYPES,
                        "description": "Which widget to render"
                    },
                    "title": {
                        "type": "string",
                        "description": "Heading shown above the widget"
                    },
                    "componentId": {
                        "type": "string",
                        "description": "Stable id of the widget, generated when omitted"
                    },
                    "context": {
                        "type": "object",
                        "description": "Prefilled values for the widget"
                    }
                }
            }),
        )];

        if self.mode == Mode::Onboarding {
            tools.push(Tool::new(
                COMPLETE_ONBOARDING,
                "Mark the onboarding as finished once every step is done.",
                json!({
                    "type": "object",
                    "properties": {
                        "summary": {
                            "type": "string",
                            "description": "One line recap of what was set up"
                        }
                    }
                }),
            ));
        }
        tools
    }

    pub fn system_prompt(&self) -> AdvisorResult<String> {
        let context = json!({
            "date": Utc::now().format("%Y-%m-%d").to_string(),
            "tools": self.tools(),
            "components": COMPONENT_TYPES,
        });
        load_prompt_file(self.mode.prompt_file(), &context)
            .map_err(|e| AdvisorError::Internal(e.to_string()))
    }

    /// Run one turn over `history` and stream its events.
    ///
    /// The stream always ends with exactly one terminal event: `complete`,
    /// `onboarding_complete` or `error`.
    pub fn reply(&self, history: Vec<Message>) -> BoxStream<'static, StreamEvent> {
        let provider = Arc::clone(&self.provider);
        let tools = self.tools();
        let system = self.system_prompt();
        let max_tool_rounds = self.max_tool_rounds;

        Box::pin(async_stream::stream! {
            let system = match system {
                Ok(system) => system,
                Err(e) => {
                    tracing::error!("Failed to render system prompt: {}", e);
                    yield StreamEvent::error(e.to_string());
                    return;
                }
            };

            let mut messages = history;
            let mut onboarding_done = false;
            let mut rounds = 0;

            loop {
                let mut model_stream = match provider.stream(&system, &messages, &tools).await {
                    Ok(model_stream) => model_stream,
                    Err(e) => {
                        tracing::error!("Model call failed: {}", e);
                        yield StreamEvent::error(AdvisorError::Provider(e.to_string()).to_string());
                        return;
                    }
                };

                let mut response_id: Option<String> = None;
                let mut text = String::new();
                let mut outcomes: Vec<(String, ToolOutcome)> = Vec::new();

                while let Some(event) = model_stream.next().await {
                    let event = match event {
                        Ok(event) => event,
                        Err(e) => {
                            tracing::error!("Model stream failed: {}", e);
                            yield StreamEvent::error(AdvisorError::Provider(e.to_string()).to_string());
                            return;
                        }
                    };

                    match event {
                        ModelEvent::ResponseCreated { id } => {
                            response_id = Some(id.clone());
                            yield StreamEvent::ResponseCreated { response_id: id };
                        }
                        ModelEvent::TextDelta(delta) => {
                            yield StreamEvent::text_delta(delta, response_id.clone());
                        }
                        ModelEvent::TextDone(full) => {
                            text = full.clone();
                            yield StreamEvent::text_done(full, response_id.clone());
                        }
                        ModelEvent::ToolCallDelta { .. } => {
                            yield StreamEvent::FunctionCallArgumentsStreaming {};
                        }
                        ModelEvent::ToolCallDone { id, name, arguments } => {
                            let outcome = dispatch_tool_call(&tools, &name, &arguments);
                            onboarding_done |= outcome.completes_onboarding;
                            for event in outcome.events.iter().cloned() {
                                yield event;
                            }
                            outcomes.push((id, outcome));
                        }
                        ModelEvent::Completed { usage } => {
                            tracing::debug!(?usage, "Model response completed");
                        }
                    }
                }

                if outcomes.is_empty() {
                    break;
                }

                let mut request = Message::assistant();
                if !text.is_empty() {
                    request = request.with_text(text);
                }
                let mut response = Message::user();
                for (id, outcome) in outcomes {
                    request = request.with_tool_request(id.clone(), Ok(outcome.request));
                    response = response.with_tool_response(id, outcome.result);
                }
                messages.push(request);
                messages.push(response);

                rounds += 1;
                if rounds > max_tool_rounds {
                    tracing::warn!("Stopping after {} tool rounds", max_tool_rounds);
                    break;
                }
            }

            if onboarding_done {
                yield StreamEvent::OnboardingComplete;
            } else {
                yield StreamEvent::Complete;
            }
        })
    }
}

fn dispatch_tool_call(tools: &[Tool], name: &str, arguments: &str) -> ToolOutcome {
    let parsed = if arguments.trim().is_empty() {
        Ok(json!({}))
    } else {
        serde_json::from_str::<Value>(arguments)
            .map_err(|e| AdvisorError::InvalidParameters(format!("arguments are not JSON: {}", e)))
    };
    let request = ToolCall::new(
        name,
        parsed
            .clone()
            .unwrap_or_else(|_| Value::String(arguments.to_string())),
    );

    let handled = parsed.and_then(|args| {
        if !tools.iter().any(|tool| tool.name == name) {
            return Err(AdvisorError::ToolNotFound(name.to_string()));
        }
        match name {
            SHOW_COMPONENT => show_component(args),
            COMPLETE_ONBOARDING => Ok(complete_onboarding(args)),
            _ => Err(AdvisorError::ToolNotFound(name.to_string())),
        }
    });

    match handled {
        Ok((events, result, completes_onboarding)) => ToolOutcome {
            request,
            result: Ok(result),
            events,
            completes_onboarding,
        },
        Err(e) => {
            tracing::warn!(tool = name, "Tool call failed: {}", e);
            ToolOutcome {
                request,
                events: vec![StreamEvent::ToolError {
                    error: e.to_string(),
                    tool_name: name.to_string(),
                    details: Some(json!({ "arguments": arguments })),
                }],
                result: Err(e),
                completes_onboarding: false,
            }
        }
    }
}

type Handled = (Vec<StreamEvent>, String, bool);

fn required_str(args: &Value, field: &str) -> AdvisorResult<String> {
    args.get(field)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .ok_or_else(|| AdvisorError::InvalidParameters(format!("missing {}", field)))
}

fn show_component(args: Value) -> AdvisorResult<Handled> {
    let component_type = required_str(&args, "componentType")?;
    let title = required_str(&args, "title")?;
    let component_id = args
        .get("componentId")
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| format!("comp_{}", uuid::Uuid::new_v4().simple()));
    let context = match args.get("context") {
        Some(Value::Null) | None => json!({}),
        Some(context) => context.clone(),
    };

    let result = format!("Displayed {} component: {}", component_type, title);
    let events = vec![
        StreamEvent::FunctionCallArgumentsDone {
            action: ToolAction {
                kind: SHOW_COMPONENT.to_string(),
                payload: args,
            },
        },
        StreamEvent::ShowComponent(ComponentAction {
            component_id,
            component_type,
            title,
            context,
        }),
    ];
    Ok((events, result, false))
}

fn complete_onboarding(args: Value) -> Handled {
    let events = vec![StreamEvent::FunctionCallArgumentsDone {
        action: ToolAction {
            kind: COMPLETE_ONBOARDING.to_string(),
            payload: args,
        },
    }];
    (events, "Onboarding marked as complete".to_string(), true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::MessageContent;
    use crate::providers::mock::MockProvider;

    async fn collect(advisor: &Advisor, history: Vec<Message>) -> Vec<StreamEvent> {
        advisor.reply(history).collect().await
    }

    fn history() -> Vec<Message> {
        vec![Message::user().with_text("Help me budget")]
    }

    #[tokio::test]
    async fn test_text_turn_ends_with_complete() {
        let provider = MockProvider::new(vec![MockProvider::text_round("r1", "Save 20% first.")]);
        let advisor = Advisor::new(Arc::new(provider));

        let events = collect(&advisor, history()).await;
        assert_eq!(
            events.first(),
            Some(&StreamEvent::ResponseCreated {
                response_id: "r1".to_string()
            })
        );
        assert!(events.contains(&StreamEvent::text_done(
            "Save 20% first.",
            Some("r1".to_string())
        )));
        assert_eq!(events.last(), Some(&StreamEvent::Complete));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_show_component_and_follow_up() {
        let provider = MockProvider::new(vec![
            MockProvider::tool_round(
                "r1",
                "call_1",
                SHOW_COMPONENT,
                r#"{"componentType":"budget_form","title":"Your budget","context":{"income":4200}}"#,
            ),
            MockProvider::text_round("r2", "Fill in the form above."),
        ]);
        let advisor = Advisor::new(Arc::new(provider.clone()));

        let events = collect(&advisor, history()).await;
        let component = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::ShowComponent(c) => Some(c.clone()),
                _ => None,
            })
            .expect("component event");
        assert_eq!(component.component_type, "budget_form");
        assert_eq!(component.title, "Your budget");
        assert_eq!(component.context, json!({"income": 4200}));
        assert!(component.component_id.starts_with("comp_"));
        assert_eq!(events.last(), Some(&StreamEvent::Complete));

        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        let follow_up = &requests[1];
        assert_eq!(follow_up.len(), 3);
        assert!(follow_up[1].has_tool_request());
        match &follow_up[2].content[0] {
            MessageContent::ToolResponse(response) => {
                assert_eq!(response.id, "call_1");
                assert_eq!(
                    response.tool_result,
                    Ok("Displayed budget_form component: Your budget".to_string())
                );
            }
            other => panic!("Expected tool response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_component_is_a_tool_error_not_a_failure() {
        let provider = MockProvider::new(vec![
            MockProvider::tool_round("r1", "call_1", SHOW_COMPONENT, r#"{"componentType":"#),
            MockProvider::text_round("r2", "Let's do it in text instead."),
        ]);
        let advisor = Advisor::new(Arc::new(provider));

        let events = collect(&advisor, history()).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::ToolError { tool_name, .. } if tool_name == SHOW_COMPONENT)));
        assert!(!events
            .iter()
            .any(|e| matches!(e, StreamEvent::ShowComponent(_))));
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error { .. })));
        assert_eq!(events.last(), Some(&StreamEvent::Complete));
    }

    #[test]
    fn test_missing_title_is_rejected() {
        let outcome = dispatch_tool_call(
            &Advisor::new(Arc::new(MockProvider::default())).tools(),
            SHOW_COMPONENT,
            r#"{"componentType":"goal_form"}"#,
        );
        assert_eq!(
            outcome.result,
            Err(AdvisorError::InvalidParameters("missing title".to_string()))
        );
    }

    #[tokio::test]
    async fn test_complete_onboarding_requires_onboarding_mode() {
        let advisory = Advisor::new(Arc::new(MockProvider::default()));
        let outcome = dispatch_tool_call(&advisory.tools(), COMPLETE_ONBOARDING, "{}");
        assert_eq!(
            outcome.result,
            Err(AdvisorError::ToolNotFound(COMPLETE_ONBOARDING.to_string()))
        );

        let provider = MockProvider::new(vec![
            MockProvider::tool_round("r1", "call_1", COMPLETE_ONBOARDING, "{}"),
            MockProvider::text_round("r2", "You're all set!"),
        ]);
        let onboarding = Advisor::new(Arc::new(provider)).with_mode(Mode::Onboarding);
        let events = collect(&onboarding, history()).await;
        assert_eq!(events.last(), Some(&StreamEvent::OnboardingComplete));
    }

    #[tokio::test]
    async fn test_upstream_failure_ends_with_error() {
        let advisor = Advisor::new(Arc::new(MockProvider::unreachable()));
        let events = collect(&advisor, history()).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Error { error } if error.contains("Connection refused")));

        let provider = MockProvider::new(vec![vec![
            Ok(ModelEvent::ResponseCreated {
                id: "r1".to_string(),
            }),
            Ok(ModelEvent::TextDelta("Half".to_string())),
            Err("stream reset".to_string()),
        ]]);
        let advisor = Advisor::new(Arc::new(provider));
        let events = collect(&advisor, history()).await;
        assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_tool_rounds_are_bounded() {
        let rounds = (0..5)
            .map(|i| {
                MockProvider::tool_round(
                    &format!("r{}", i),
                    &format!("call_{}", i),
                    SHOW_COMPONENT,
                    r#"{"componentType":"budget_form","title":"Again"}"#,
                )
            })
            .collect();
        let provider = MockProvider::new(rounds);
        let advisor = Advisor::new(Arc::new(provider.clone())).with_max_tool_rounds(1);

        let events = collect(&advisor, history()).await;
        assert_eq!(provider.requests().len(), 2);
        assert_eq!(events.last(), Some(&StreamEvent::Complete));
    }

    #[test]
    fn test_system_prompt_per_mode() {
        let advisory = Advisor::new(Arc::new(MockProvider::default()));
        assert!(advisory.system_prompt().unwrap().contains("show_component"));

        let onboarding = Advisor::new(Arc::new(MockProvider::default())).with_mode(Mode::Onboarding);
        assert_eq!(onboarding.tools().len(), 2);
        assert!(onboarding
            .system_prompt()
            .unwrap()
            .contains("complete_onboarding"));
    }
}
