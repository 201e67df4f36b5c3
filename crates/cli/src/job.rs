use crate::utils::{friendly_error, start_spinner, stop_spinner};
use anyhow::{Result, anyhow};
use atelier::task::TaskArtifact;
use atelier::{PollOptions, Submission, TaskKind, TaskOrchestrator, TaskStatus};
use colored::*;
use serde_json::{Map, Value};

pub async fn run_job(
    orchestrator: &TaskOrchestrator,
    kind: &str,
    params: Vec<(String, Value)>,
    opts: PollOptions,
) -> Result<()> {
    let kind = TaskKind::from_path(kind);
    let payload: Map<String, Value> = params.into_iter().collect();

    let mut spinner = Some(start_spinner(format!("Submitting {}...", kind)));
    let submitted = orchestrator.submit(&kind, &payload).await;
    stop_spinner(&mut spinner);

    let task = match submitted {
        Ok(Submission::Queued(task)) => task,
        Ok(Submission::Ready(artifact)) => {
            print_artifact(&artifact);
            return Ok(());
        }
        Ok(Submission::Rejected { reason }) => {
            log::debug!("submission rejected: {}", reason);
            return Err(anyhow!(atelier::friendly::user_message(&reason)));
        }
        Err(err) => return Err(friendly_error(err)),
    };
    println!("{} task {}", "Queued".bright_blue(), task.task_id.bold());

    let mut spinner = Some(start_spinner("Waiting for the result..."));
    let tracked = orchestrator
        .track(
            task,
            |update| {
                stop_spinner(&mut spinner);
                println!(
                    "  {} {}",
                    format!("#{}", update.attempt).bright_black(),
                    update.raw_status.as_deref().unwrap_or("?")
                );
                spinner = Some(start_spinner("Waiting for the result..."));
            },
            opts,
        )
        .await;
    stop_spinner(&mut spinner);

    let task = tracked.map_err(friendly_error)?;
    match task.status {
        TaskStatus::Completed => {
            if let Some(artifact) = &task.result {
                print_artifact(artifact);
            }
            Ok(())
        }
        _ => {
            let error = task.error.unwrap_or_default();
            log::debug!("task {} ended as {:?}: {}", task.task_id, task.status, error);
            Err(anyhow!(atelier::friendly::user_message(&error)))
        }
    }
}

fn print_artifact(artifact: &TaskArtifact) {
    match artifact.url() {
        Some(url) => println!("{} {}", "Done:".bright_green(), url),
        None => println!(
            "{} {}",
            "Done:".bright_green(),
            serde_json::to_string_pretty(&artifact.payload).unwrap_or_default()
        ),
    }
}
