use advisor::advisor::Mode;
use advisor::processor::{StreamProcessor, TurnOutcome};
use advisor::sequence::MessageSequencer;
use anyhow::Result;
use futures::StreamExt;
use std::sync::Arc;

use crate::client::AdvisorClient;
use crate::prompt::{InputType, Prompt};

pub struct Session<'a> {
    client: AdvisorClient,
    prompt: Box<dyn Prompt + 'a>,
    conversation_id: String,
    mode: Mode,
    sequencer: Arc<MessageSequencer>,
}

impl<'a> Session<'a> {
    pub fn new(
        client: AdvisorClient,
        prompt: Box<impl Prompt + 'a>,
        conversation_id: String,
        mode: Mode,
    ) -> Self {
        Session {
            client,
            prompt,
            conversation_id,
            mode,
            sequencer: Arc::new(MessageSequencer::new()),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub async fn start(&mut self) -> Result<()> {
        self.setup_session().await;

        loop {
            let input = self.prompt.get_input()?;
            match input.input_type {
                InputType::Message => {
                    if let Some(content) = &input.content {
                        if let Err(e) = self.run_turn(content).await {
                            self.prompt.hide_busy();
                            self.prompt.render_notice(&format!("Error: {}", e));
                        }
                    }
                }
                InputType::Exit => break,
                InputType::AskAgain => continue,
            }
        }
        self.prompt.close();
        Ok(())
    }

    /// Send one message and render the reply as it streams in.
    ///
    /// Returns how the turn ended, or `None` when the stream stopped before a
    /// terminal event (connection lost or interrupted).
    pub async fn run_turn(&mut self, message: &str) -> Result<Option<TurnOutcome>> {
        // The server stores the user message first; keep local orders in step
        self.sequencer.next(&self.conversation_id);

        self.prompt.show_busy();
        let mut frames = self
            .client
            .send(&self.conversation_id, message, self.mode)
            .await?;
        let mut processor =
            StreamProcessor::new(self.conversation_id.as_str(), Arc::clone(&self.sequencer));

        loop {
            tokio::select! {
                frame = frames.next() => {
                    match frame {
                        Some(Ok(frame)) => {
                            let effect = processor.process(&frame.event);
                            self.prompt.render(&effect);
                            if processor.is_finished() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            self.prompt.render_notice(&format!("Connection lost: {}", e));
                            break;
                        }
                        None => break,
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    drop(frames);
                    self.prompt.render_notice("Interrupted. The server keeps what was already said.");
                    return Ok(None);
                }
            }
        }
        self.prompt.hide_busy();

        let outcome = processor.outcome().cloned();
        match &outcome {
            Some(TurnOutcome::OnboardingComplete) => self.mode = Mode::Advisory,
            Some(_) => {}
            None => {
                let notice = if processor.take_partial().is_some() {
                    "The reply was cut off. The server keeps the partial text."
                } else {
                    "The advisor stopped before replying."
                };
                self.prompt.render_notice(notice);
            }
        }
        Ok(outcome)
    }

    async fn setup_session(&mut self) {
        self.prompt.render_notice(&format!(
            "Conversation {} ({} mode)",
            self.conversation_id,
            match self.mode() {
                Mode::Advisory => "advisory",
                Mode::Onboarding => "onboarding",
            }
        ));

        match self.client.history(&self.conversation_id).await {
            Ok(history) => {
                if let Some(last) = history.last() {
                    self.sequencer
                        .observe(&self.conversation_id, last.message_order);
                }
                self.prompt.render_history(&history);
            }
            Err(e) => self
                .prompt
                .render_notice(&format!("Could not load history: {}", e)),
        }

        self.prompt.advisor_ready();
    }
}
