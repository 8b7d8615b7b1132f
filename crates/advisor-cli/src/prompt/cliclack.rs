use std::io::{self, Write};

use advisor::models::chat::{ChatMessage, Sender};
use advisor::processor::{Effect, TurnOutcome};
use anyhow::Result;
use cliclack::{input, spinner, ProgressBar};

use super::{Input, InputType, Prompt};
use crate::render;

pub struct CliclackPrompt {
    spinner: Option<ProgressBar>,
    input_mode: InputMode,
    // Whether deltas of the current message already reached the terminal
    streamed: bool,
    mid_line: bool,
}

enum InputMode {
    Singleline,
    Multiline,
}

impl CliclackPrompt {
    pub fn new() -> Self {
        CliclackPrompt {
            spinner: None,
            input_mode: InputMode::Singleline,
            streamed: false,
            mid_line: false,
        }
    }

    fn print_line(&mut self, line: &str) {
        self.hide_busy();
        if self.mid_line {
            println!();
            self.mid_line = false;
        }
        println!("{}", line);
    }
}

fn flush() {
    // Nothing useful can be done when stdout is gone
    let _ = io::stdout().flush();
}

impl Prompt for CliclackPrompt {
    fn render(&mut self, effect: &Effect) {
        match effect {
            Effect::Started(_) => {
                self.hide_busy();
                self.streamed = false;
                print!("{} ", render::sender_label(Sender::Ai));
                self.mid_line = true;
                flush();
            }
            Effect::TextDelta { delta, .. } => {
                self.hide_busy();
                print!("{}", delta);
                self.streamed = true;
                self.mid_line = true;
                flush();
            }
            Effect::TextFinalized(message) => {
                // The final text only needs printing when no delta arrived
                if !self.streamed {
                    println!("{}", message.content);
                } else if self.mid_line {
                    println!();
                }
                self.streamed = false;
                self.mid_line = false;
            }
            Effect::ToolCallPending => {
                if self.spinner.is_none() {
                    self.show_busy();
                }
            }
            Effect::ComponentAdded(message) => {
                if let Some(component) = &message.component {
                    self.print_line(&render::component_card(component));
                }
            }
            Effect::Finished { outcome, .. } => {
                match outcome {
                    TurnOutcome::Complete => self.print_line(""),
                    TurnOutcome::OnboardingComplete => {
                        self.print_line(&render::notice("Onboarding complete. Switching to advisory mode."))
                    }
                    TurnOutcome::Failed(error) => self.print_line(&render::error_bubble(error)),
                }
                flush();
            }
            // Tool failures and raw actions stay out of the conversation view
            Effect::ToolCallReady(_) | Effect::ToolFailed { .. } | Effect::Ignored => {}
        }
    }

    fn render_history(&mut self, messages: &[ChatMessage]) {
        for message in messages {
            println!("{}\n", render::history_entry(message));
        }
    }

    fn render_notice(&mut self, text: &str) {
        self.print_line(&render::notice(text));
    }

    fn show_busy(&mut self) {
        let busy = spinner();
        busy.start("awaiting reply");
        self.spinner = Some(busy);
    }

    fn hide_busy(&mut self) {
        if let Some(busy) = self.spinner.take() {
            busy.stop("");
        }
    }

    fn get_input(&mut self) -> Result<Input> {
        let mut input = input("Advisor chat:        [Help: /?]").placeholder("");
        match self.input_mode {
            InputMode::Multiline => input = input.multiline(),
            InputMode::Singleline => (),
        }
        let message_text: String = input.interact()?;
        let message_text = message_text.trim();

        if message_text.eq_ignore_ascii_case("/exit") || message_text.eq_ignore_ascii_case("/quit")
        {
            Ok(Input {
                input_type: InputType::Exit,
                content: None,
            })
        } else if message_text.eq_ignore_ascii_case("/m") {
            self.input_mode = InputMode::Multiline;
            self.get_input()
        } else if message_text.eq_ignore_ascii_case("/s") {
            self.input_mode = InputMode::Singleline;
            self.get_input()
        } else if message_text.eq_ignore_ascii_case("/?") {
            println!("Commands:");
            println!("/exit - Exit the session");
            println!("/m - Switch to multiline input mode");
            println!("/s - Switch to singleline input mode");
            println!("/? - Display this help message");
            println!("Ctrl+C - Stop waiting for the current reply");
            self.get_input()
        } else if message_text.is_empty() {
            Ok(Input {
                input_type: InputType::AskAgain,
                content: None,
            })
        } else {
            Ok(Input {
                input_type: InputType::Message,
                content: Some(message_text.to_string()),
            })
        }
    }

    fn close(&self) {
        // No cleanup required
    }
}
