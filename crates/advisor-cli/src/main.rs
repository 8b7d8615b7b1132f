use advisor::advisor::Mode;
use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;

mod client;
mod prompt;
mod render;
mod session;

use client::AdvisorClient;
use prompt::cliclack::CliclackPrompt;
use session::Session;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Base URL of the advisord server
    #[arg(long, global = true, env = "ADVISOR_SERVER", default_value = "http://127.0.0.1:3000")]
    server: String,

    /// User the requests are made for
    #[arg(long, global = true, env = "ADVISOR_USER", default_value = "local-user")]
    user: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Chat with the advisor
    Chat {
        /// Conversation to continue; a new one is started when omitted
        #[arg(short, long)]
        conversation: Option<String>,

        /// Run the onboarding flow instead of regular advice
        #[arg(long)]
        onboarding: bool,
    },

    /// Print the stored history of a conversation
    History {
        #[arg(short, long)]
        conversation: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = AdvisorClient::new(&cli.server, &cli.user)?;

    match cli.command {
        Command::Chat {
            conversation,
            onboarding,
        } => {
            let conversation =
                conversation.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let mode = if onboarding {
                Mode::Onboarding
            } else {
                Mode::Advisory
            };
            let mut session = Session::new(client, Box::new(CliclackPrompt::new()), conversation, mode);
            session.start().await?;
        }
        Command::History { conversation } => {
            let history = client.history(&conversation).await?;
            if history.is_empty() {
                println!("{}", style("No messages yet").dim());
            }
            for message in &history {
                println!("{}\n", render::history_entry(message));
            }
        }
    }
    Ok(())
}
