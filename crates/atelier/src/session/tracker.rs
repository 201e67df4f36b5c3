use super::backend::{ChatReply, OutgoingMessage, SessionBackend};
use super::{Entry, EntryRole, EntryStatus, Session};
use crate::error::AtelierError;
use crate::friendly::{self, ErrorCategory};
use crate::task::{PollOptions, PollOutcome, TaskKind, TaskOrchestrator};
use log::{debug, info};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::instrument;

const DEFAULT_REPLY: &str = "Done!";

/// A job still running, with every reply linked to it.
#[derive(Debug, Clone)]
struct PendingTask {
    task_id: String,
    kind: TaskKind,
    entry_ids: Vec<String>,
}

#[derive(Default)]
struct TrackerState {
    session: Option<Session>,
    /// In registration order; each task id appears at most once.
    pending: Vec<PendingTask>,
    /// Bumped on every reset. Work started under an older epoch is discarded.
    epoch: u64,
    ticker: Option<JoinHandle<()>>,
    next_entry: u64,
}

impl TrackerState {
    fn next_id(&mut self) -> String {
        self.next_entry += 1;
        format!("entry-{}", self.next_entry)
    }

    fn take_pending(&mut self, task_id: &str) -> Option<PendingTask> {
        let idx = self.pending.iter().position(|p| p.task_id == task_id)?;
        Some(self.pending.remove(idx))
    }

    fn entry_mut(&mut self, id: &str) -> Option<&mut Entry> {
        self.session.as_mut().and_then(|s| s.entry_mut(id))
    }
}

struct Inner {
    backend: Arc<dyn SessionBackend>,
    orchestrator: Arc<TaskOrchestrator>,
    tick: Duration,
    state: Mutex<TrackerState>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Ordered entry log for one conversation at a time.
///
/// Replies backed by a job are polled from a single shared tick: every tick
/// checks each pending task once, in registration order. The tick stops when
/// nothing is pending and starts again on the next registration.
pub struct SessionTaskTracker {
    inner: Arc<Inner>,
}

impl SessionTaskTracker {
    pub fn new(backend: Arc<dyn SessionBackend>, orchestrator: Arc<TaskOrchestrator>) -> Self {
        let tick = orchestrator.config().tracker.tick;
        Self {
            inner: Arc::new(Inner {
                backend,
                orchestrator,
                tick,
                state: Mutex::new(TrackerState::default()),
            }),
        }
    }

    /// Overrides the configured tick. Has no effect once a tick is running.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.tick = tick;
        }
        self
    }

    /// Opens a new session and makes it the active one.
    ///
    /// The previous session is dropped immediately: its pending tasks are
    /// abandoned (not cancelled) and any result that arrives for them later is
    /// discarded.
    #[instrument(name = "session_tracker.start_session", skip_all)]
    pub async fn start_session(&self) -> Result<String, AtelierError> {
        let epoch = {
            let mut state = self.inner.state();
            state.epoch += 1;
            state.session = None;
            if !state.pending.is_empty() {
                debug!("Abandoning {} pending task(s)", state.pending.len());
            }
            state.pending.clear();
            if let Some(ticker) = state.ticker.take() {
                ticker.abort();
            }
            state.epoch
        };

        let session_id = self.inner.backend.create_session().await?;

        let mut state = self.inner.state();
        if state.epoch == epoch {
            info!("Session {} started", session_id);
            state.session = Some(Session::new(session_id.clone()));
        }
        Ok(session_id)
    }

    /// Appends a user entry and a reply placeholder, then sends the message.
    ///
    /// Returns the id of the reply entry, which is updated in place as the
    /// reply resolves. If the backend call fails the reply entry is marked
    /// failed and the error is returned.
    #[instrument(name = "session_tracker.send_entry", skip_all)]
    pub async fn send_entry(
        &self,
        content: impl Into<String>,
        attachment: Option<String>,
    ) -> Result<String, AtelierError> {
        let content = content.into();
        let (epoch, session_id, reply_id) = {
            let mut state = self.inner.state();
            let epoch = state.epoch;
            let user_id = state.next_id();
            let reply_id = state.next_id();
            let Some(session) = state.session.as_mut() else {
                return Err(AtelierError::InvalidRequest("no active session".into()));
            };

            let mut user = Entry::new(user_id, EntryRole::User, content.clone());
            user.attachment = attachment.clone();
            user.status = EntryStatus::Resolved;
            session.entries.push(user);
            session
                .entries
                .push(Entry::new(reply_id.clone(), EntryRole::Assistant, ""));

            (epoch, session.session_id.clone(), reply_id)
        };

        let message = OutgoingMessage {
            prompt: content,
            attachment,
            reply_to: Vec::new(),
        };
        let sent = self.inner.backend.post_message(&session_id, &message).await;

        let mut state = self.inner.state();
        if state.epoch != epoch {
            debug!("Discarding reply for a previous session");
            return sent.map(|_| reply_id);
        }
        match sent {
            Ok(reply) => {
                let registered = apply_reply(&mut state, &reply_id, reply);
                if registered {
                    ensure_ticker(&self.inner, &mut state);
                }
                Ok(reply_id)
            }
            Err(err) => {
                if let Some(entry) = state.entry_mut(&reply_id) {
                    entry.status = EntryStatus::Failed;
                    entry.content = ErrorCategory::of(&err).message().to_string();
                }
                Err(err)
            }
        }
    }

    /// Snapshot of the active session's log, in order.
    pub fn entries(&self) -> Vec<Entry> {
        self.inner
            .state()
            .session
            .as_ref()
            .map(|s| s.entries.clone())
            .unwrap_or_default()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner
            .state()
            .session
            .as_ref()
            .map(|s| s.session_id.clone())
    }

    /// Number of replies still waiting on a task.
    pub fn pending_count(&self) -> usize {
        self.inner.state().pending.len()
    }

    pub fn is_ticking(&self) -> bool {
        self.inner.state().ticker.is_some()
    }
}

impl Drop for SessionTaskTracker {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.state.lock()
            && let Some(ticker) = state.ticker.take()
        {
            ticker.abort();
        }
    }
}

/// Fills in the reply entry. Returns true when a task was registered.
fn apply_reply(state: &mut TrackerState, reply_id: &str, reply: ChatReply) -> bool {
    let Some(entry) = state.entry_mut(reply_id) else {
        return false;
    };
    entry.message_id = reply.message_id;
    if let Some(content) = reply.content {
        entry.content = content;
    }

    let Some(task) = reply.task else {
        if entry.content.is_empty() {
            entry.content = DEFAULT_REPLY.to_string();
        }
        entry.status = EntryStatus::Resolved;
        return false;
    };

    entry.linked_task_id = Some(task.task_id.clone());
    entry.status = EntryStatus::Awaiting;
    if let Some(tracked) = state.pending.iter_mut().find(|p| p.task_id == task.task_id) {
        debug!("Task {} is already tracked, also resolving {}", task.task_id, reply_id);
        tracked.entry_ids.push(reply_id.to_string());
        return false;
    }
    debug!("Tracking task {} for {}", task.task_id, reply_id);
    state.pending.push(PendingTask {
        task_id: task.task_id,
        kind: task.kind,
        entry_ids: vec![reply_id.to_string()],
    });
    true
}

fn ensure_ticker(inner: &Arc<Inner>, state: &mut TrackerState) {
    if state.ticker.is_some() {
        return;
    }
    let epoch = state.epoch;
    state.ticker = Some(tokio::spawn(run_ticker(inner.clone(), epoch)));
}

async fn run_ticker(inner: Arc<Inner>, epoch: u64) {
    loop {
        tokio::time::sleep(inner.tick).await;

        let batch = {
            let mut state = inner.state();
            if state.epoch != epoch {
                return;
            }
            if state.pending.is_empty() {
                state.ticker = None;
                return;
            }
            state.pending.clone()
        };

        for task in batch {
            let outcome = inner
                .orchestrator
                .poll(&task.task_id, &task.kind, |_| {}, PollOptions::single_attempt())
                .await;
            resolve(&inner, epoch, &task, outcome);
        }

        {
            let mut state = inner.state();
            if state.epoch == epoch && state.pending.is_empty() {
                debug!("Nothing pending, stopping poll tick");
                state.ticker = None;
                return;
            }
        }
    }
}

fn resolve(
    inner: &Inner,
    epoch: u64,
    task: &PendingTask,
    outcome: Result<PollOutcome, AtelierError>,
) {
    let mut state = inner.state();
    if state.epoch != epoch {
        return;
    }
    let failure = match outcome {
        Ok(PollOutcome::TimedOut { .. }) => return,
        Ok(PollOutcome::Completed { artifact, .. }) => {
            let Some(done) = state.take_pending(&task.task_id) else {
                return;
            };
            for id in &done.entry_ids {
                if let Some(entry) = state.entry_mut(id) {
                    entry.status = EntryStatus::Resolved;
                    if entry.content.is_empty() {
                        entry.content = DEFAULT_REPLY.to_string();
                    }
                    entry.artifact = Some(artifact.clone());
                }
            }
            return;
        }
        Ok(PollOutcome::Failed { error, .. }) => friendly::user_message(&error),
        Err(err) => ErrorCategory::of(&err).message(),
    };

    let Some(done) = state.take_pending(&task.task_id) else {
        return;
    };
    for id in &done.entry_ids {
        if let Some(entry) = state.entry_mut(id) {
            entry.status = EntryStatus::Failed;
            entry.content = failure.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthGateway, Credentials, RefreshedTokens, TokenRefresher};
    use crate::config::ClientConfig;
    use crate::outbound::HttpTransport;
    use crate::request::ApiRequest;
    use crate::session::LinkedTask;
    use async_trait::async_trait;
    use http::{Request, Response};
    use std::collections::{HashMap, VecDeque};

    /// Status endpoint: each task id has a script of statuses; the last one repeats.
    struct Statuses {
        scripts: Mutex<HashMap<String, VecDeque<&'static str>>>,
        delay: Duration,
    }

    impl Statuses {
        fn new(scripts: &[(&str, &[&'static str])]) -> Arc<Self> {
            let scripts = scripts
                .iter()
                .map(|(id, s)| (id.to_string(), s.iter().copied().collect()))
                .collect();
            Arc::new(Self {
                scripts: Mutex::new(scripts),
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl HttpTransport for Statuses {
        async fn send(&self, req: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, AtelierError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let path = req.uri().path().to_string();
            let task_id = path
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap()
                .to_string();
            let status = {
                let mut scripts = self.scripts.lock().unwrap();
                let script = scripts.get_mut(&task_id).unwrap();
                if script.len() > 1 {
                    script.pop_front().unwrap()
                } else {
                    script[0]
                }
            };
            let body = serde_json::json!({
                "result": {"status": status, "image_url": format!("https://cdn/{task_id}.png")}
            });
            Ok(Response::new(serde_json::to_vec(&body).unwrap()))
        }
    }

    struct NoRefresh;

    #[async_trait]
    impl TokenRefresher for NoRefresh {
        async fn refresh(&self, _rt: Option<&str>) -> Result<RefreshedTokens, AtelierError> {
            Err(AtelierError::RefreshFailed("no".into()))
        }
    }

    /// Prompts starting with `job:` get a task with the rest as its id.
    #[derive(Default)]
    struct FakeChat {
        sessions: Mutex<u32>,
        slow_prompt: Option<&'static str>,
    }

    #[async_trait]
    impl SessionBackend for FakeChat {
        async fn create_session(&self) -> Result<String, AtelierError> {
            let mut n = self.sessions.lock().unwrap();
            *n += 1;
            Ok(format!("s{}", *n))
        }

        async fn post_message(
            &self,
            _session_id: &str,
            message: &OutgoingMessage,
        ) -> Result<ChatReply, AtelierError> {
            if self.slow_prompt == Some(message.prompt.as_str()) {
                tokio::time::sleep(Duration::from_secs(8)).await;
            }
            if message.prompt == "boom" {
                return Err(AtelierError::HttpStatus {
                    status: 503,
                    body: "upstream unavailable".into(),
                });
            }
            let task = message.prompt.strip_prefix("job:").map(|id| LinkedTask {
                task_id: id.to_string(),
                kind: TaskKind::ImageGeneration,
            });
            Ok(ChatReply {
                message_id: Some(format!("m-{}", message.prompt)),
                content: task.is_none().then(|| format!("re: {}", message.prompt)),
                task,
            })
        }
    }

    const TICK: Duration = Duration::from_secs(2);

    fn tracker(statuses: Arc<Statuses>, chat: FakeChat) -> SessionTaskTracker {
        let gateway = Arc::new(AuthGateway::new(statuses, Arc::new(NoRefresh)));
        let orchestrator = Arc::new(TaskOrchestrator::new(gateway, ClientConfig::default()));
        SessionTaskTracker::new(Arc::new(chat), orchestrator).with_tick(TICK)
    }

    fn summary(entries: &[Entry]) -> Vec<(EntryRole, String, EntryStatus)> {
        entries
            .iter()
            .map(|e| (e.role, e.content.clone(), e.status))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn entries_keep_send_order_whatever_order_jobs_finish() {
        let statuses = Statuses::new(&[
            ("a", &["PENDING", "PROCESSING", "COMPLETED"]),
            ("b", &["COMPLETED"]),
        ]);
        let tracker = tracker(statuses, FakeChat::default());
        tracker.start_session().await.unwrap();

        let a = tracker.send_entry("job:a", None).await.unwrap();
        let b = tracker.send_entry("job:b", None).await.unwrap();
        tracker.send_entry("plain", None).await.unwrap();
        assert_eq!(tracker.pending_count(), 2);
        assert!(tracker.is_ticking());

        // after one tick B is done, A is not
        tokio::time::sleep(TICK + Duration::from_millis(100)).await;
        let entries = tracker.entries();
        let status_of = |id: &str| entries.iter().find(|e| e.id == id).unwrap().status;
        assert_eq!(status_of(b.as_str()), EntryStatus::Resolved);
        assert_eq!(status_of(a.as_str()), EntryStatus::Awaiting);

        tokio::time::sleep(TICK * 2).await;
        assert_eq!(tracker.pending_count(), 0);
        assert!(!tracker.is_ticking());

        let entries = tracker.entries();
        assert_eq!(
            summary(&entries),
            [
                (EntryRole::User, "job:a".to_string(), EntryStatus::Resolved),
                (EntryRole::Assistant, "Done!".to_string(), EntryStatus::Resolved),
                (EntryRole::User, "job:b".to_string(), EntryStatus::Resolved),
                (EntryRole::Assistant, "Done!".to_string(), EntryStatus::Resolved),
                (EntryRole::User, "plain".to_string(), EntryStatus::Resolved),
                (EntryRole::Assistant, "re: plain".to_string(), EntryStatus::Resolved),
            ]
        );
        assert_eq!(entries[1].linked_task_id.as_deref(), Some("a"));
        assert_eq!(
            entries[1].artifact.as_ref().and_then(|a| a.url()),
            Some("https://cdn/a.png")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn tick_restarts_after_going_idle() {
        let statuses = Statuses::new(&[("a", &["COMPLETED"]), ("b", &["COMPLETED"])]);
        let tracker = tracker(statuses, FakeChat::default());
        tracker.start_session().await.unwrap();

        tracker.send_entry("job:a", None).await.unwrap();
        tokio::time::sleep(TICK * 2).await;
        assert!(!tracker.is_ticking());

        tracker.send_entry("job:b", None).await.unwrap();
        assert!(tracker.is_ticking());
        tokio::time::sleep(TICK * 2).await;
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_jobs_and_sends_get_friendly_messages() {
        let statuses = Statuses::new(&[("a", &["FAILED"])]);
        let tracker = tracker(statuses, FakeChat::default());
        tracker.start_session().await.unwrap();

        tracker.send_entry("job:a", None).await.unwrap();
        let err = tracker.send_entry("boom", None).await.unwrap_err();
        assert!(matches!(err, AtelierError::HttpStatus { status: 503, .. }));
        tokio::time::sleep(TICK * 2).await;

        let entries = tracker.entries();
        assert_eq!(entries[1].status, EntryStatus::Failed);
        assert_eq!(entries[3].status, EntryStatus::Failed);
        assert_eq!(entries[3].content, ErrorCategory::Server.message());
        assert!(!entries[3].content.contains("upstream"));
    }

    #[tokio::test(start_paused = true)]
    async fn late_results_never_reach_a_new_session() {
        let mut statuses = Statuses::new(&[("old", &["PENDING", "COMPLETED"])]);
        Arc::get_mut(&mut statuses).unwrap().delay = Duration::from_secs(1);
        let chat = FakeChat {
            slow_prompt: Some("slow"),
            ..Default::default()
        };
        let tracker = Arc::new(tracker(statuses, chat));
        assert_eq!(tracker.start_session().await.unwrap(), "s1");

        tracker.send_entry("job:old", None).await.unwrap();
        let slow = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.send_entry("slow", None).await })
        };
        // second tick's status call is in flight
        tokio::time::sleep(TICK * 2 + Duration::from_millis(1500)).await;

        assert_eq!(tracker.start_session().await.unwrap(), "s2");
        assert_eq!(tracker.pending_count(), 0);
        tracker.send_entry("hello", None).await.unwrap();

        slow.await.unwrap().unwrap();
        tokio::time::sleep(TICK * 3).await;

        assert_eq!(tracker.session_id().as_deref(), Some("s2"));
        assert_eq!(
            summary(&tracker.entries()),
            [
                (EntryRole::User, "hello".to_string(), EntryStatus::Resolved),
                (EntryRole::Assistant, "re: hello".to_string(), EntryStatus::Resolved),
            ]
        );
    }

    #[tokio::test]
    async fn sending_without_a_session_is_an_error() {
        let tracker = tracker(Statuses::new(&[]), FakeChat::default());
        assert!(matches!(
            tracker.send_entry("hi", None).await,
            Err(AtelierError::InvalidRequest(_))
        ));
        assert!(tracker.entries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn replies_sharing_a_task_all_resolve() {
        let statuses = Statuses::new(&[("same", &["PENDING", "COMPLETED"])]);
        let tracker = tracker(statuses, FakeChat::default());
        tracker.start_session().await.unwrap();

        let first = tracker.send_entry("job:same", None).await.unwrap();
        let second = tracker.send_entry("job:same", None).await.unwrap();
        assert_eq!(tracker.pending_count(), 1);

        tokio::time::sleep(TICK * 3).await;
        assert_eq!(tracker.pending_count(), 0);
        assert!(!tracker.is_ticking());

        let entries = tracker.entries();
        for id in [first, second] {
            let entry = entries.iter().find(|e| e.id == id).unwrap();
            assert_eq!(entry.status, EntryStatus::Resolved);
            assert_eq!(entry.linked_task_id.as_deref(), Some("same"));
            assert_eq!(
                entry.artifact.as_ref().and_then(|a| a.url()),
                Some("https://cdn/same.png")
            );
        }
    }

    /// Only `Bearer fresh` is accepted.
    struct FreshTokenOnly;

    #[async_trait]
    impl HttpTransport for FreshTokenOnly {
        async fn send(&self, req: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, AtelierError> {
            let fresh = req
                .headers()
                .get(http::header::AUTHORIZATION)
                .is_some_and(|v| v == "Bearer fresh");
            if !fresh {
                return Ok(Response::builder().status(401).body(Vec::new()).unwrap());
            }
            let body = serde_json::json!({"result": {"status": "COMPLETED"}});
            Ok(Response::new(serde_json::to_vec(&body).unwrap()))
        }
    }

    struct SlowRefresh;

    #[async_trait]
    impl TokenRefresher for SlowRefresh {
        async fn refresh(&self, _rt: Option<&str>) -> Result<RefreshedTokens, AtelierError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(RefreshedTokens {
                access_token: "fresh".into(),
                refresh_token: None,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reset_during_a_tick_refresh_leaves_other_callers_alone() {
        let gateway = Arc::new(
            AuthGateway::new(Arc::new(FreshTokenOnly), Arc::new(SlowRefresh))
                .with_credentials(Credentials::new("stale")),
        );
        let orchestrator = Arc::new(TaskOrchestrator::new(
            gateway.clone(),
            ClientConfig::default(),
        ));
        let tracker =
            SessionTaskTracker::new(Arc::new(FakeChat::default()), orchestrator).with_tick(TICK);
        tracker.start_session().await.unwrap();
        tracker.send_entry("job:a", None).await.unwrap();

        // the tick's status call got a 401 and started the refresh
        tokio::time::sleep(TICK + Duration::from_secs(1)).await;
        assert!(gateway.is_refreshing());

        let other = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.send(ApiRequest::get("http://api/me")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(gateway.queued(), 2);

        tracker.start_session().await.unwrap();
        assert!(!tracker.is_ticking());

        let resp = other.await.unwrap().unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(gateway.credentials().unwrap().access_token, "fresh");
        assert!(!gateway.is_refreshing());
    }
}
