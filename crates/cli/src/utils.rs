use atelier::{AtelierError, ErrorCategory};
use colored::*;
use serde_json::Value;
use spinners::{Spinner, Spinners};

/// Parses `KEY=VALUE`; the value is JSON when it parses as JSON, a string otherwise.
pub fn parse_kv(s: &str) -> Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("param must be KEY=VALUE, got `{}`", s))?;
    match serde_json::from_str::<Value>(raw) {
        Ok(v) => Ok((key.to_string(), v)),
        Err(_) => Ok((key.to_string(), Value::String(raw.to_string()))),
    }
}

pub fn start_spinner(message: impl std::fmt::Display) -> Spinner {
    Spinner::new(Spinners::Dots12, message.to_string().bright_cyan().to_string())
}

pub fn stop_spinner(spinner: &mut Option<Spinner>) {
    if let Some(mut sp) = spinner.take() {
        sp.stop();
        print!("\r\x1B[K");
    }
}

/// Turns an error into its user-facing message; the raw error goes to the debug log.
pub fn friendly_error(err: AtelierError) -> anyhow::Error {
    log::debug!("{:#}", err);
    anyhow::anyhow!(ErrorCategory::of(&err).message())
}
