use super::wire::{StatusResult, SubmitResult};
use super::{PollOptions, PollOutcome, StatusUpdate, Submission, Task, TaskKind, TaskStatus};
use crate::auth::AuthGateway;
use crate::config::ClientConfig;
use crate::envelope;
use crate::error::AtelierError;
use crate::jobs::FeatureJob;
use crate::rate_limit::RateLimiter;
use crate::request::ApiRequest;
use chrono::Utc;
use futures::Stream;
use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::instrument;
use url::Url;

const DEFAULT_FAILURE: &str = "Task failed";

/// One status GET, parsed.
struct Fetched {
    update: StatusUpdate,
    result: StatusResult,
    payload: Value,
}

impl Fetched {
    fn outcome(self, attempts: u32) -> Option<PollOutcome> {
        match self.update.status {
            Some(TaskStatus::Completed) => Some(PollOutcome::Completed {
                artifact: self.result.media.into_artifact(self.payload),
                attempts,
            }),
            Some(TaskStatus::Failed) => Some(PollOutcome::Failed {
                error: self
                    .result
                    .error
                    .unwrap_or_else(|| DEFAULT_FAILURE.to_string()),
                attempts,
            }),
            _ => None,
        }
    }

    fn is_terminal(&self) -> bool {
        self.update.status.is_some_and(TaskStatus::is_terminal)
    }
}

/// Submits feature jobs and polls them to completion.
///
/// Every call goes through the shared [`AuthGateway`], so a token refresh
/// triggered by one poll is picked up by every other in-flight poll. The
/// orchestrator keeps no per-task state; the caller owns the [`Task`].
pub struct TaskOrchestrator {
    gateway: Arc<AuthGateway>,
    config: ClientConfig,
    limiter: RateLimiter,
    client_session_id: String,
}

impl TaskOrchestrator {
    pub fn new(gateway: Arc<AuthGateway>, config: ClientConfig) -> Self {
        let limiter = RateLimiter::from_config(&config.rate_limit);
        Self {
            gateway,
            config,
            limiter,
            client_session_id: new_client_session_id(),
        }
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn gateway(&self) -> &Arc<AuthGateway> {
        &self.gateway
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Polling defaults from the config.
    pub fn poll_options(&self) -> PollOptions {
        PollOptions::from(&self.config.poll)
    }

    /// Generated once per orchestrator, `web_<millis>_<suffix>`.
    pub fn client_session_id(&self) -> &str {
        &self.client_session_id
    }

    /// The logged-in user, or the client session id when nobody is.
    pub fn caller_id(&self) -> String {
        self.gateway
            .user_id()
            .unwrap_or_else(|| self.client_session_id.clone())
    }

    /// Submits a job of `kind` with `payload` as its parameters.
    ///
    /// Waits for a rate-limit slot first. Transport, HTTP and auth errors come
    /// back as `Err`; a request the backend accepted without a task id or a
    /// result is [`Submission::Rejected`].
    #[instrument(name = "task_orchestrator.submit", skip_all, fields(kind = %kind))]
    pub async fn submit<P>(&self, kind: &TaskKind, payload: &P) -> Result<Submission, AtelierError>
    where
        P: Serialize + ?Sized,
    {
        let body = self.submission_body(payload)?;
        let url = self.config.feature_url(&format!("{}/", kind.path()));

        self.limiter.acquire().await;
        let resp = self.gateway.send(ApiRequest::post(url).json(&body)?).await?;

        let payload: Value = serde_json::from_slice(resp.body()).unwrap_or(Value::Null);
        let env = envelope::parse::<SubmitResult>(&resp)?;
        if !env.is_ok() {
            let reason = env
                .message
                .unwrap_or_else(|| format!("backend returned code {:?}", env.code));
            debug!("{} submission rejected: {}", kind, reason);
            return Ok(Submission::Rejected { reason });
        }

        let result = env.result.unwrap_or_default();
        match result.task_id {
            Some(task_id) if !task_id.is_empty() => {
                debug!("{} accepted as task {}", kind, task_id);
                Ok(Submission::Queued(Task::new(task_id, kind.clone())))
            }
            _ if !result.media.is_empty() => {
                let result_payload = payload.get("result").cloned().unwrap_or(Value::Null);
                Ok(Submission::Ready(result.media.into_artifact(result_payload)))
            }
            _ => Ok(Submission::Rejected {
                reason: "No task ID received".to_string(),
            }),
        }
    }

    /// Submits one of the typed jobs from [`crate::jobs`].
    pub async fn submit_job<J: FeatureJob>(&self, job: &J) -> Result<Submission, AtelierError> {
        self.submit(&job.kind(), job).await
    }

    /// One status check, with no interpretation beyond parsing.
    pub async fn check(&self, task_id: &str, kind: &TaskKind) -> Result<StatusUpdate, AtelierError> {
        Ok(self.fetch(task_id, kind, 1).await?.update)
    }

    /// Polls `task_id` until it reaches a terminal status or the attempt
    /// budget runs out.
    ///
    /// `on_update` runs after every successful status response. A failed
    /// attempt (transport error, bad status, unparsable body) is logged and
    /// still counts against the budget. Auth failures end the loop with `Err`.
    #[instrument(
        name = "task_orchestrator.poll",
        skip_all,
        fields(task_id = %task_id, kind = %kind, max_attempts = opts.max_attempts)
    )]
    pub async fn poll<F>(
        &self,
        task_id: &str,
        kind: &TaskKind,
        mut on_update: F,
        opts: PollOptions,
    ) -> Result<PollOutcome, AtelierError>
    where
        F: FnMut(&StatusUpdate),
    {
        for attempt in 1..=opts.max_attempts {
            if attempt > 1 {
                sleep(opts.interval).await;
            }
            match self.fetch(task_id, kind, attempt).await {
                Ok(fetched) => {
                    on_update(&fetched.update);
                    if let Some(outcome) = fetched.outcome(attempt) {
                        return Ok(outcome);
                    }
                }
                Err(err) if err.is_auth() => return Err(err),
                Err(err) => warn!("Polling error (attempt {}): {}", attempt, err),
            }
        }

        debug!("Task {} still running after {} attempts", task_id, opts.max_attempts);
        Ok(PollOutcome::TimedOut {
            attempts: opts.max_attempts,
        })
    }

    /// The same loop as [`poll`](Self::poll), as a stream of updates.
    ///
    /// Ends after the terminal update, when the budget runs out, or on an
    /// auth failure.
    pub fn updates<'a>(
        &'a self,
        task_id: &'a str,
        kind: &'a TaskKind,
        opts: PollOptions,
    ) -> impl Stream<Item = StatusUpdate> + Send + 'a {
        futures::stream::unfold((1u32, false), move |(mut attempt, done)| async move {
            if done {
                return None;
            }
            while attempt <= opts.max_attempts {
                if attempt > 1 {
                    sleep(opts.interval).await;
                }
                let current = attempt;
                attempt += 1;
                match self.fetch(task_id, kind, current).await {
                    Ok(fetched) => {
                        let terminal = fetched.is_terminal();
                        return Some((fetched.update, (attempt, terminal)));
                    }
                    Err(err) if err.is_auth() => return None,
                    Err(err) => warn!("Polling error (attempt {}): {}", current, err),
                }
            }
            None
        })
    }

    /// Polls `task` and hands it back in its terminal state.
    pub async fn track<F>(
        &self,
        mut task: Task,
        mut on_update: F,
        opts: PollOptions,
    ) -> Result<Task, AtelierError>
    where
        F: FnMut(&StatusUpdate),
    {
        if task.status.is_terminal() {
            return Ok(task);
        }
        let task_id = task.task_id.clone();
        let kind = task.kind.clone();
        let outcome = self
            .poll(
                &task_id,
                &kind,
                |update| {
                    task.observe(update);
                    on_update(update);
                },
                opts,
            )
            .await?;
        task.apply(&outcome);
        Ok(task)
    }

    async fn fetch(
        &self,
        task_id: &str,
        kind: &TaskKind,
        attempt: u32,
    ) -> Result<Fetched, AtelierError> {
        let url = self.status_url(task_id, kind)?;
        let resp = self.gateway.send(ApiRequest::get(url)).await?;

        let body: Value = serde_json::from_slice(resp.body()).map_err(|e| {
            AtelierError::ResponseFormatError {
                message: e.to_string(),
                raw_response: String::from_utf8_lossy(resp.body()).into_owned(),
            }
        })?;
        let result: StatusResult = match body.get("result") {
            Some(result) if result.is_object() => serde_json::from_value(result.clone())?,
            _ => StatusResult::default(),
        };
        let payload = body.get("result").cloned().unwrap_or(Value::Null);

        let update = StatusUpdate {
            attempt,
            status: result.status.as_deref().and_then(TaskStatus::from_wire),
            raw_status: result.status.clone(),
            payload: body,
        };
        debug!(
            "Task {} attempt {}: {}",
            task_id,
            attempt,
            update.raw_status.as_deref().unwrap_or("<none>")
        );
        Ok(Fetched {
            update,
            result,
            payload,
        })
    }

    fn status_url(&self, task_id: &str, kind: &TaskKind) -> Result<String, AtelierError> {
        let base = self
            .config
            .feature_url(&format!("{}/status/{}/", kind.path(), task_id));
        let mut url = Url::parse(&base)?;
        url.query_pairs_mut().append_pair("user_id", &self.caller_id());
        Ok(url.into())
    }

    fn submission_body<P>(&self, payload: &P) -> Result<Value, AtelierError>
    where
        P: Serialize + ?Sized,
    {
        let mut body = serde_json::to_value(payload)?;
        let Some(fields) = body.as_object_mut() else {
            return Err(AtelierError::InvalidRequest(
                "job parameters must serialize to a JSON object".into(),
            ));
        };
        fields
            .entry("user_id")
            .or_insert_with(|| Value::String(self.caller_id()));
        fields
            .entry("session_id")
            .or_insert_with(|| Value::String(self.client_session_id.clone()));
        Ok(body)
    }
}

fn new_client_session_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("web_{}_{}", Utc::now().timestamp_millis(), &suffix[..9])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credentials, RefreshedTokens, TokenRefresher};
    use crate::outbound::HttpTransport;
    use async_trait::async_trait;
    use futures::StreamExt;
    use http::{Method, Request, Response};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    type Reply = Result<(u16, Value), AtelierError>;

    /// Plays back replies in order and records what was sent.
    #[derive(Default)]
    struct Script {
        replies: Mutex<VecDeque<Reply>>,
        seen: Mutex<Vec<(Method, String, Value)>>,
    }

    impl Script {
        fn new(replies: impl IntoIterator<Item = Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().collect()),
                seen: Mutex::default(),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HttpTransport for Script {
        async fn send(&self, req: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, AtelierError> {
            let body = serde_json::from_slice(req.body()).unwrap_or(Value::Null);
            self.seen
                .lock()
                .unwrap()
                .push((req.method().clone(), req.uri().to_string(), body));
            let (status, body) = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok((200, state("PENDING"))))?;
            Ok(Response::builder()
                .status(status)
                .body(serde_json::to_vec(&body).unwrap())
                .unwrap())
        }
    }

    struct NoRefresh;

    #[async_trait]
    impl TokenRefresher for NoRefresh {
        async fn refresh(&self, _rt: Option<&str>) -> Result<RefreshedTokens, AtelierError> {
            Err(AtelierError::RefreshFailed("Refresh token expired".into()))
        }
    }

    fn state(s: &str) -> Value {
        json!({"code": 1000, "result": {"status": s}})
    }

    fn ok(body: Value) -> Reply {
        Ok((200, body))
    }

    fn orchestrator(script: &Arc<Script>) -> TaskOrchestrator {
        let gateway = AuthGateway::new(script.clone(), Arc::new(NoRefresh))
            .with_credentials(Credentials::new("tok").with_user_id("u-1"));
        let config = ClientConfig {
            ai_base_url: "http://ai".into(),
            ..ClientConfig::default()
        };
        TaskOrchestrator::new(Arc::new(gateway), config)
    }

    fn opts(max_attempts: u32) -> PollOptions {
        PollOptions::new(max_attempts, Duration::from_secs(3))
    }

    #[tokio::test(start_paused = true)]
    async fn completes_on_the_third_of_five_attempts() {
        let script = Script::new([
            ok(state("PENDING")),
            ok(state("PENDING")),
            ok(json!({"result": {"status": "COMPLETED", "image_url": "https://cdn/x.png"}})),
        ]);
        let orch = orchestrator(&script);
        let start = Instant::now();
        let mut seen = Vec::new();

        let outcome = orch
            .poll("t1", &TaskKind::Upscale, |u| seen.push(u.attempt), opts(5))
            .await
            .unwrap();

        assert_eq!(outcome.attempts(), 3);
        assert_eq!(
            outcome.into_result().unwrap().url(),
            Some("https://cdn/x.png")
        );
        assert_eq!(seen, [1, 2, 3]);
        assert_eq!(script.calls(), 3);
        // sleeps between attempts only
        assert_eq!(start.elapsed(), Duration::from_secs(6));
        assert_eq!(
            script.seen.lock().unwrap()[0].1,
            "http://ai/v1/features/upscale/status/t1/?user_id=u-1"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_after_exactly_max_attempts() {
        let script = Script::new([]);
        let orch = orchestrator(&script);

        let outcome = orch
            .poll("t1", &TaskKind::Relight, |_| {}, opts(3))
            .await
            .unwrap();

        assert_eq!(outcome, PollOutcome::TimedOut { attempts: 3 });
        assert_eq!(outcome.error(), Some("timeout"));
        assert_eq!(script.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_on_one_attempt_is_survived() {
        let script = Script::new([
            ok(state("PENDING")),
            Err(AtelierError::TransportError("connection reset".into())),
            ok(state("PROCESSING")),
            ok(state("PROCESSING")),
            ok(json!({"result": {"status": "SUCCEEDED", "video_url": "https://cdn/v.mp4"}})),
        ]);
        let orch = orchestrator(&script);
        let mut attempts = Vec::new();

        let outcome = orch
            .poll("t1", &TaskKind::ImageToVideo, |u| attempts.push(u.attempt), opts(5))
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts(), 5);
        // no callback for the failed attempt
        assert_eq!(attempts, [1, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_status_uses_backend_error_or_a_default() {
        let script = Script::new([ok(json!({"result": {"status": "FAILED"}}))]);
        let orch = orchestrator(&script);

        let outcome = orch
            .poll("t1", &TaskKind::Upscale, |_| {}, opts(5))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Failed {
                error: "Task failed".into(),
                attempts: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_ends_polling() {
        let script = Script::new([Ok((401, json!({})))]);
        let orch = orchestrator(&script);

        let err = orch
            .poll("t1", &TaskKind::Upscale, |_| {}, opts(5))
            .await
            .unwrap_err();
        assert!(matches!(err, AtelierError::RefreshFailed(_)));
        assert_eq!(script.calls(), 1);
    }

    #[tokio::test]
    async fn submit_reports_task_ready_or_rejected() {
        let script = Script::new([
            ok(json!({"code": 1000, "result": {"task_id": "t-9"}})),
            ok(json!({"code": 1000, "result": {"image_url": "https://cdn/now.png"}})),
            ok(json!({"code": 1000, "result": {}})),
            ok(json!({"code": 4003, "message": "Prompt violates policy"})),
        ]);
        let orch = orchestrator(&script);
        let kind = TaskKind::ImageGeneration;
        let params = json!({"prompt": "a lighthouse"});

        let queued = orch.submit(&kind, &params).await.unwrap();
        assert_eq!(queued.task_id(), Some("t-9"));

        match orch.submit(&kind, &params).await.unwrap() {
            Submission::Ready(artifact) => assert_eq!(artifact.url(), Some("https://cdn/now.png")),
            other => panic!("unexpected submission: {other:?}"),
        }
        assert!(matches!(
            orch.submit(&kind, &params).await.unwrap(),
            Submission::Rejected { ref reason } if reason == "No task ID received"
        ));
        let err = orch.submit(&kind, &params).await.unwrap().into_result().unwrap_err();
        assert!(matches!(err, AtelierError::SubmissionRejected(ref m) if m == "Prompt violates policy"));

        let seen = script.seen.lock().unwrap();
        let (method, url, body) = &seen[0];
        assert_eq!(*method, Method::POST);
        assert_eq!(url, "http://ai/v1/features/image-generation/");
        assert_eq!(body["prompt"], "a lighthouse");
        assert_eq!(body["user_id"], "u-1");
        assert!(body["session_id"].as_str().unwrap().starts_with("web_"));
    }

    #[tokio::test(start_paused = true)]
    async fn submissions_respect_the_rate_limit() {
        let replies = (0..6).map(|i| ok(json!({"result": {"task_id": format!("t{i}")}})));
        let script = Script::new(replies);
        let orch = orchestrator(&script);
        let start = Instant::now();

        for _ in 0..6 {
            orch.submit(&TaskKind::Upscale, &json!({})).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn update_stream_ends_after_terminal_status() {
        let script = Script::new([
            ok(state("PENDING")),
            ok(state("PROCESSING")),
            ok(json!({"result": {"status": "COMPLETED", "output_url": "https://cdn/o.png"}})),
            ok(state("PENDING")),
        ]);
        let orch = orchestrator(&script);
        let kind = TaskKind::Reimagine;

        let raw: Vec<_> = orch
            .updates("t1", &kind, opts(10))
            .map(|u| u.raw_status.unwrap_or_default())
            .collect()
            .await;

        assert_eq!(raw, ["PENDING", "PROCESSING", "COMPLETED"]);
        assert_eq!(script.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn track_returns_the_terminal_task() {
        let script = Script::new([
            ok(state("PROCESSING")),
            ok(json!({"result": {"status": "COMPLETED", "image_url": "https://cdn/x.png"}})),
        ]);
        let orch = orchestrator(&script);

        let task = Task::new("t1", TaskKind::RemoveBackground);
        let task = orch.track(task, |_| {}, opts(5)).await.unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempts, 2);
        assert_eq!(
            task.result.and_then(|a| a.image_url).as_deref(),
            Some("https://cdn/x.png")
        );
    }
}
