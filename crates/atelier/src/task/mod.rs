//! Long-running backend jobs.
//!
//! A feature job is submitted once and then polled until the backend reports
//! a terminal status. [`TaskOrchestrator`] drives that loop; the types here are
//! what it hands back.

mod orchestrator;
pub mod wire;

pub use orchestrator::TaskOrchestrator;

use crate::error::AtelierError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Which feature endpoint a job belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    ImageGeneration,
    RemoveBackground,
    Upscale,
    Reimagine,
    Relight,
    ImageExpand,
    StyleTransfer,
    ImageToVideo,
    PromptToVideo,
    /// Any other feature with the same submit/poll shape, by path segment.
    #[serde(untagged)]
    Custom(String),
}

impl TaskKind {
    /// Path segment under the features prefix.
    pub fn path(&self) -> &str {
        match self {
            TaskKind::ImageGeneration => "image-generation",
            TaskKind::RemoveBackground => "remove-background",
            TaskKind::Upscale => "upscale",
            TaskKind::Reimagine => "reimagine",
            TaskKind::Relight => "relight",
            TaskKind::ImageExpand => "image-expand",
            TaskKind::StyleTransfer => "style-transfer",
            TaskKind::ImageToVideo => "image-to-video",
            TaskKind::PromptToVideo => "prompt-to-video",
            TaskKind::Custom(path) => path.trim_matches('/'),
        }
    }

    pub fn from_path(path: &str) -> Self {
        match path.trim_matches('/') {
            "image-generation" => TaskKind::ImageGeneration,
            "remove-background" => TaskKind::RemoveBackground,
            "upscale" => TaskKind::Upscale,
            "reimagine" => TaskKind::Reimagine,
            "relight" => TaskKind::Relight,
            "image-expand" => TaskKind::ImageExpand,
            "style-transfer" => TaskKind::StyleTransfer,
            "image-to-video" => TaskKind::ImageToVideo,
            "prompt-to-video" => TaskKind::PromptToVideo,
            other => TaskKind::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Lifecycle of a task. `Completed`, `Failed` and `TimedOut` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Submitted,
    Pending,
    Processing,
    Completed,
    Failed,
    TimedOut,
}

impl TaskStatus {
    /// Maps a backend status string. `SUCCEEDED` is an alias of `COMPLETED`;
    /// unknown values yield `None` and are treated as "still running".
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "PENDING" => Some(TaskStatus::Pending),
            "PROCESSING" | "RUNNING" | "IN_PROGRESS" => Some(TaskStatus::Processing),
            "COMPLETED" | "SUCCEEDED" => Some(TaskStatus::Completed),
            "FAILED" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::TimedOut
        )
    }
}

/// The finished product of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskArtifact {
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    /// The full `result` object, for kind-specific fields.
    pub payload: Value,
}

impl TaskArtifact {
    /// Whichever media URL the backend filled in.
    pub fn url(&self) -> Option<&str> {
        self.video_url.as_deref().or(self.image_url.as_deref())
    }
}

/// One backend job, owned by whoever submitted it.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub result: Option<TaskArtifact>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(task_id: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            task_id: task_id.into(),
            kind,
            status: TaskStatus::Submitted,
            attempts: 0,
            created_at: Utc::now(),
            result: None,
            error: None,
        }
    }

    /// Records a polling outcome. Terminal tasks are left untouched.
    pub fn apply(&mut self, outcome: &PollOutcome) {
        if self.status.is_terminal() {
            return;
        }
        self.attempts += outcome.attempts();
        match outcome {
            PollOutcome::Completed { artifact, .. } => {
                self.status = TaskStatus::Completed;
                self.result = Some(artifact.clone());
            }
            PollOutcome::Failed { error, .. } => {
                self.status = TaskStatus::Failed;
                self.error = Some(error.clone());
            }
            PollOutcome::TimedOut { .. } => {
                self.status = TaskStatus::TimedOut;
                self.error = Some("timeout".to_string());
            }
        }
    }

    pub(crate) fn observe(&mut self, update: &StatusUpdate) {
        if let Some(status) = update.status {
            if !status.is_terminal() {
                self.status = status;
            }
        }
    }
}

/// What a progress callback sees after every poll attempt.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    /// 1-based.
    pub attempt: u32,
    pub status: Option<TaskStatus>,
    /// The status string as sent, including values we do not recognise.
    pub raw_status: Option<String>,
    /// The whole response body.
    pub payload: Value,
}

/// Attempt budget and spacing for a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl PollOptions {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// One status check, no sleeping. For callers that own their own loop.
    pub fn single_attempt() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for PollOptions {
    fn default() -> Self {
        Self::new(60, Duration::from_millis(3000))
    }
}

impl From<&crate::config::PollConfig> for PollOptions {
    fn from(cfg: &crate::config::PollConfig) -> Self {
        Self::new(cfg.max_attempts, cfg.interval)
    }
}

/// How a polling loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Completed { artifact: TaskArtifact, attempts: u32 },
    Failed { error: String, attempts: u32 },
    TimedOut { attempts: u32 },
}

impl PollOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PollOutcome::Completed { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Completed { attempts, .. }
            | PollOutcome::Failed { attempts, .. }
            | PollOutcome::TimedOut { attempts } => *attempts,
        }
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            PollOutcome::Completed { .. } => TaskStatus::Completed,
            PollOutcome::Failed { .. } => TaskStatus::Failed,
            PollOutcome::TimedOut { .. } => TaskStatus::TimedOut,
        }
    }

    /// `timeout` for exhausted budgets, the backend's error otherwise.
    pub fn error(&self) -> Option<&str> {
        match self {
            PollOutcome::Completed { .. } => None,
            PollOutcome::Failed { error, .. } => Some(error),
            PollOutcome::TimedOut { .. } => Some("timeout"),
        }
    }

    pub fn into_result(self) -> Result<TaskArtifact, AtelierError> {
        match self {
            PollOutcome::Completed { artifact, .. } => Ok(artifact),
            PollOutcome::Failed { error, .. } => Err(AtelierError::JobFailed(error)),
            PollOutcome::TimedOut { attempts } => Err(AtelierError::PollTimeout { attempts }),
        }
    }
}

/// What a submission produced.
#[derive(Debug, Clone)]
pub enum Submission {
    /// Accepted; poll the task for the result.
    Queued(Task),
    /// Accepted and already finished (synchronous endpoints).
    Ready(TaskArtifact),
    /// No task id and no artifact.
    Rejected { reason: String },
}

impl Submission {
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Submission::Queued(task) => Some(&task.task_id),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<Submission, AtelierError> {
        match self {
            Submission::Rejected { reason } => Err(AtelierError::SubmissionRejected(reason)),
            other => Ok(other),
        }
    }
}
