use anyhow::{Context, Result};
use atelier::{
    AtelierError, AuthGateway, ClientConfig, CredentialListener, Credentials, HttpChatBackend,
    HttpTokenRefresher, PollOptions, ReqwestTransport, SessionTaskTracker, TaskOrchestrator,
};
use clap::Parser;
use colored::*;
use std::sync::Arc;

mod chat;
mod cli_args;
mod job;
mod utils;

use chat::run_chat;
use cli_args::{CliArgs, Commands};
use job::run_job;

/// Tells the user when the session can no longer be refreshed.
struct LogoutNotice;

impl CredentialListener for LogoutNotice {
    fn logged_out(&self, reason: &AtelierError) {
        log::debug!("logged out: {:#}", reason);
        eprintln!(
            "{} Your session has expired. Please log in again.",
            "!".bright_yellow()
        );
    }
}

fn load_config(args: &CliArgs) -> Result<ClientConfig> {
    let config = match &args.config {
        Some(path) => ClientConfig::from_path(path)?,
        None => ClientConfig::load_default()?,
    };
    Ok(config.with_env_overrides())
}

fn build_gateway(args: &CliArgs, config: &ClientConfig) -> Result<Arc<AuthGateway>> {
    let transport = Arc::new(
        ReqwestTransport::new(config.request_timeout).context("Failed to build HTTP client")?,
    );
    let refresher = Arc::new(HttpTokenRefresher::from_config(transport.clone(), config));
    let mut gateway = AuthGateway::new(transport, refresher).with_listener(Arc::new(LogoutNotice));

    if let Some(token) = &args.token {
        let mut credentials = Credentials::new(token.clone());
        if let Some(refresh) = &args.refresh_token {
            credentials = credentials.with_refresh_token(refresh.clone());
        }
        if let Some(user_id) = &args.user_id {
            credentials = credentials.with_user_id(user_id.clone());
        }
        gateway = gateway.with_credentials(credentials);
    }
    Ok(Arc::new(gateway))
}

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry =
        atelier_utils::setup_telemetry(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))?;
    let args = CliArgs::parse();

    let config = load_config(&args)?;
    let gateway = build_gateway(&args, &config)?;

    let outcome = match &args.command {
        Commands::Job {
            kind,
            params,
            max_attempts,
            interval,
        } => {
            let defaults = PollOptions::from(&config.poll);
            let opts = PollOptions::new(
                max_attempts.unwrap_or(defaults.max_attempts),
                interval.unwrap_or(defaults.interval),
            );
            let orchestrator = TaskOrchestrator::new(gateway, config);
            run_job(&orchestrator, kind, params.clone(), opts).await
        }
        Commands::Chat { prompts, image } => {
            let deadline = config.poll.interval * config.poll.max_attempts;
            let backend = Arc::new(HttpChatBackend::new(gateway.clone(), &config));
            let orchestrator = Arc::new(TaskOrchestrator::new(gateway, config));
            let tracker = SessionTaskTracker::new(backend, orchestrator);
            run_chat(&tracker, prompts.clone(), image.clone(), deadline).await
        }
    };

    if let Err(e) = outcome {
        eprintln!("{} {}", "Error:".bright_red(), e);
        drop(telemetry);
        std::process::exit(1);
    }
    Ok(())
}
