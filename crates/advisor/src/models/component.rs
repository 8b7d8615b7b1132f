use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A UI widget the chat interface should render inline.
///
/// `context` is opaque to the advisor; it is whatever the model supplied for
/// the component (prefilled amounts, a goal name, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentAction {
    pub component_id: String,
    pub component_type: String,
    pub title: String,
    #[serde(default)]
    pub context: Value,
}

/// Raw structured instruction produced by a finished tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolAction {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}
