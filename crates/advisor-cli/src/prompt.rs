use advisor::models::chat::ChatMessage;
use advisor::processor::Effect;
use anyhow::Result;

pub mod cliclack;

pub trait Prompt {
    /// Show one change of the turn in progress.
    fn render(&mut self, effect: &Effect);
    fn render_history(&mut self, messages: &[ChatMessage]);
    fn render_notice(&mut self, text: &str);
    fn get_input(&mut self) -> Result<Input>;
    fn show_busy(&mut self);
    fn hide_busy(&mut self);
    fn close(&self);
    fn advisor_ready(&self) {
        println!("\n");
        println!("The advisor is ready. Ask about your budget, spending or goals.");
        println!("\n");
    }
}

pub struct Input {
    pub input_type: InputType,
    pub content: Option<String>, // Optional content as sometimes the user may be issuing a command eg. (Exit)
}

pub enum InputType {
    AskAgain, // Ask the user for input again. Control flow command.
    Message,  // User sent a message
    Exit,     // User wants to exit the session
}
