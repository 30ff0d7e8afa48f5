//! Command-line surface

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::settings::{
    ExperienceLevel, FeedbackDepth, InterviewMode, InterviewSettings, PracticeMode, Provider,
};

#[derive(Debug, Parser)]
#[command(name = "steadycoach", version, about = "Practise job interviews by text or voice")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start a new interview
    Interview(InterviewArgs),
    /// Continue a saved text interview
    Resume {
        id: String,
        #[arg(long, env = "STEADYCOACH_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
    },
    /// Manage saved sessions
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },
    /// Show or change settings
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Args)]
pub struct InterviewArgs {
    /// Target role, e.g. "Senior Backend Engineer"
    #[arg(long)]
    pub role: String,
    #[arg(long, default_value = "")]
    pub company: String,
    /// Job description or extra context
    #[arg(long, default_value = "")]
    pub description: String,
    #[arg(long, value_enum, default_value_t = ExperienceLevel::MidSenior)]
    pub level: ExperienceLevel,
    #[arg(long, value_enum, default_value_t = InterviewMode::Text)]
    pub mode: InterviewMode,
    #[arg(long, value_enum, default_value_t = PracticeMode::Structured)]
    pub practice: PracticeMode,
    #[arg(long, value_enum, default_value_t = FeedbackDepth::Standard)]
    pub depth: FeedbackDepth,
    /// Overrides the keyring and environment
    #[arg(long, env = "STEADYCOACH_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
}

impl InterviewArgs {
    pub fn settings(&self) -> InterviewSettings {
        InterviewSettings {
            role: self.role.trim().to_string(),
            company: self.company.trim().to_string(),
            description: self.description.trim().to_string(),
            experience_level: self.level,
            mode: self.mode,
            practice_mode: self.practice,
            feedback_depth: self.depth,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum SessionsCommand {
    /// List saved sessions, newest first
    List,
    /// Print a session transcript
    Show { id: String },
    /// Write a session transcript to a text file
    Export {
        id: String,
        /// Defaults to steadycoach-session-<date>.txt
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    Delete { id: String },
    /// Delete every saved session
    Clear {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Show,
    Set(ConfigSetArgs),
}

#[derive(Debug, Args)]
pub struct ConfigSetArgs {
    /// Switching provider resets model and endpoint to its preset
    #[arg(long, value_enum)]
    pub provider: Option<Provider>,
    #[arg(long)]
    pub model: Option<String>,
    #[arg(long)]
    pub base_url: Option<String>,
    /// Allow web search grounding (Gemini)
    #[arg(long)]
    pub grounding: Option<bool>,
    /// Stored in the system keyring; an empty value deletes it
    #[arg(long)]
    pub api_key: Option<String>,
    #[arg(long)]
    pub voice_model: Option<String>,
    #[arg(long)]
    pub voice_name: Option<String>,
}
