use crate::utils::parse_kv;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

/// Command line arguments for the atelier CLI
#[derive(Parser, Debug)]
#[clap(
    name = "atelier",
    about = "Submit atelier feature jobs and chat with the assistant"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (TOML or JSON). Defaults to the platform config dir.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Access token to send as the bearer
    #[arg(long, env = "ATELIER_TOKEN", hide_env_values = true, global = true)]
    pub token: Option<String>,

    /// Refresh token, for identity services that take it in the path
    #[arg(long, env = "ATELIER_REFRESH_TOKEN", hide_env_values = true, global = true)]
    pub refresh_token: Option<String>,

    #[arg(long, env = "ATELIER_USER_ID", global = true)]
    pub user_id: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a feature job and wait for its result
    Job {
        /// Feature path, e.g. `image-generation` or `upscale`
        kind: String,

        /// Job parameter as KEY=VALUE (JSON values are parsed)
        #[arg(short = 'p', long = "param", value_parser = parse_kv, action = clap::ArgAction::Append)]
        params: Vec<(String, Value)>,

        /// Maximum number of status checks
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Time between status checks, e.g. `3s`
        #[arg(long, value_parser = humantime::parse_duration)]
        interval: Option<Duration>,
    },
    /// Open a chat session, send each prompt and print the log
    Chat {
        #[arg(required = true)]
        prompts: Vec<String>,

        /// Image URL to attach to the first prompt
        #[arg(long)]
        image: Option<String>,
    },
}
