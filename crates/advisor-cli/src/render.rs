use advisor::models::chat::{ChatMessage, Sender};
use advisor::models::component::ComponentAction;
use console::style;
use serde_json::Value;

pub fn sender_label(sender: Sender) -> String {
    match sender {
        Sender::User => style("You").bold().cyan().to_string(),
        Sender::Ai => style("Advisor").bold().green().to_string(),
        Sender::System => style("System").bold().red().to_string(),
    }
}

/// A component as a terminal card: title, kind and any prefilled fields
pub fn component_card(component: &ComponentAction) -> String {
    let mut card = format!(
        "{} {} {}",
        style("▣").magenta(),
        style(&component.title).bold(),
        style(format!("[{}]", component.component_type)).dim()
    );
    if let Value::Object(fields) = &component.context {
        for (key, value) in fields {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            card.push_str(&format!("\n  {} {}", style(format!("{}:", key)).dim(), value));
        }
    }
    card
}

pub fn error_bubble(error: &str) -> String {
    format!("{} {}", style("✗").red().bold(), style(error).red())
}

pub fn notice(text: &str) -> String {
    style(text).dim().italic().to_string()
}

/// One stored message, as printed by `advisor history`
pub fn history_entry(message: &ChatMessage) -> String {
    let body = match (&message.component, message.sender) {
        (Some(component), _) => component_card(component),
        (None, Sender::System) => error_bubble(&message.content),
        (None, _) => message.content.clone(),
    };
    format!(
        "{} {}\n{}",
        sender_label(message.sender),
        style(format!("#{}", message.message_order)).dim(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plain() {
        console::set_colors_enabled(false);
    }

    #[test]
    fn test_component_card_lists_context() {
        plain();
        let card = component_card(&ComponentAction {
            component_id: "comp_1".to_string(),
            component_type: "goal_form".to_string(),
            title: "Emergency fund".to_string(),
            context: json!({"target": 5000, "name": "Rainy day"}),
        });
        let lines: Vec<&str> = card.lines().collect();
        assert_eq!(lines[0], "▣ Emergency fund [goal_form]");
        assert!(lines.contains(&"  target: 5000"));
        assert!(lines.contains(&"  name: Rainy day"));
    }

    #[test]
    fn test_component_card_without_context() {
        plain();
        let card = component_card(&ComponentAction {
            component_id: "comp_1".to_string(),
            component_type: "income_form".to_string(),
            title: "Your income".to_string(),
            context: json!({}),
        });
        assert_eq!(card, "▣ Your income [income_form]");
    }

    #[test]
    fn test_history_entry() {
        plain();
        let text = ChatMessage::new("conv-1", Sender::Ai, "You spent $1,240.", 2);
        assert_eq!(history_entry(&text), "Advisor #2\nYou spent $1,240.");

        let error = ChatMessage::new("conv-1", Sender::System, "Upstream failed", 3);
        assert_eq!(history_entry(&error), "System #3\n✗ Upstream failed");
    }
}
