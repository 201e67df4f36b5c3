use crate::utils::{friendly_error, start_spinner, stop_spinner};
use anyhow::Result;
use atelier::SessionTaskTracker;
use atelier::session::{Entry, EntryRole, EntryStatus};
use colored::*;
use std::time::Duration;
use tokio::time::{Instant, sleep};

const SETTLE_CHECK: Duration = Duration::from_millis(250);

/// Opens a session, sends `prompts` in order and waits for every reply to
/// settle (or `deadline` to pass) before printing the log.
pub async fn run_chat(
    tracker: &SessionTaskTracker,
    prompts: Vec<String>,
    image: Option<String>,
    deadline: Duration,
) -> Result<()> {
    let session_id = tracker.start_session().await.map_err(friendly_error)?;
    log::info!("chat session {}", session_id);

    let mut attachment = image;
    for prompt in prompts {
        if let Err(err) = tracker.send_entry(prompt, attachment.take()).await {
            // The failed reply stays in the log with its message.
            log::debug!("send failed: {:#}", err);
        }
    }

    let mut spinner = Some(start_spinner("Waiting for replies..."));
    let until = Instant::now() + deadline;
    while tracker.pending_count() > 0 && Instant::now() < until {
        sleep(SETTLE_CHECK).await;
    }
    stop_spinner(&mut spinner);

    for entry in tracker.entries() {
        print_entry(&entry);
    }
    if tracker.pending_count() > 0 {
        println!(
            "{} {} replies still running",
            "!".bright_yellow(),
            tracker.pending_count()
        );
    }
    Ok(())
}

fn print_entry(entry: &Entry) {
    match entry.role {
        EntryRole::User => {
            print!("{} {}", "> You:".bright_blue(), entry.content);
            if let Some(image) = &entry.attachment {
                print!(" {}", format!("[{}]", image).bright_black());
            }
            println!();
        }
        EntryRole::Assistant => {
            let content = match entry.status {
                EntryStatus::Failed => entry.content.bright_red(),
                EntryStatus::Created | EntryStatus::Awaiting => "...".bright_black(),
                EntryStatus::Resolved => entry.content.normal(),
            };
            println!("{} {}", "> Assistant:".bright_green(), content);
            if let Some(url) = entry.artifact.as_ref().and_then(|a| a.url()) {
                println!("  {}", url.underline());
            }
        }
    }
}
