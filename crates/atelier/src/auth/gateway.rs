//! Authenticated request dispatch with single-flight token refresh.
//!
//! When a request comes back `401` it parks in a FIFO queue behind a token
//! refresh, starting one if none is running. The refresh runs as its own task,
//! so a caller that gives up waiting never cancels it for the others. Once it
//! settles every parked caller is woken in arrival order with the new token
//! (or the refresh error). The `refreshing` flag and the queue share one lock
//! and the check-and-set happens under it, so two refreshes never overlap.

use super::{Credentials, RefreshedTokens, TokenRefresher};
use crate::error::AtelierError;
use crate::outbound::HttpTransport;
use crate::request::ApiRequest;
use http::{Method, Response, StatusCode};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::oneshot;
use tracing::{Instrument, instrument};

/// Hooks for the credential store / UI.
pub trait CredentialListener: Send + Sync {
    /// Tokens were rotated by a refresh.
    fn refreshed(&self, _credentials: &Credentials) {}

    /// Credentials were cleared; the user has to log in again.
    fn logged_out(&self, reason: &AtelierError);
}

/// A caller parked behind an in-flight refresh.
struct PendingRequest {
    waker: oneshot::Sender<Result<String, String>>,
    method: Method,
    url: String,
}

#[derive(Default)]
struct RefreshState {
    refreshing: bool,
    queue: VecDeque<PendingRequest>,
}

#[derive(Default)]
struct TokenSlot {
    credentials: Option<Credentials>,
    /// Bumped every time `credentials` changes.
    generation: u64,
}

/// State the spawned refresh task shares with the gateway.
struct Shared {
    refresher: Arc<dyn TokenRefresher>,
    listener: RwLock<Option<Arc<dyn CredentialListener>>>,
    tokens: RwLock<TokenSlot>,
    refresh: Mutex<RefreshState>,
}

pub struct AuthGateway {
    transport: Arc<dyn HttpTransport>,
    shared: Arc<Shared>,
}

impl AuthGateway {
    pub fn new(transport: Arc<dyn HttpTransport>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            transport,
            shared: Arc::new(Shared {
                refresher,
                listener: RwLock::new(None),
                tokens: RwLock::new(TokenSlot::default()),
                refresh: Mutex::new(RefreshState::default()),
            }),
        }
    }

    pub fn with_listener(self, listener: Arc<dyn CredentialListener>) -> Self {
        *self
            .shared
            .listener
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(listener);
        self
    }

    pub fn with_credentials(self, credentials: Credentials) -> Self {
        self.login(credentials);
        self
    }

    pub fn login(&self, credentials: Credentials) {
        let mut slot = self.shared.token_slot_mut();
        slot.credentials = Some(credentials);
        slot.generation += 1;
    }

    /// Drops the credentials without notifying the listener.
    pub fn logout(&self) {
        self.shared.clear_credentials();
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.shared.credentials()
    }

    pub fn user_id(&self) -> Option<String> {
        self.shared
            .token_slot()
            .credentials
            .as_ref()
            .and_then(|c| c.user_id.clone())
    }

    pub fn is_refreshing(&self) -> bool {
        self.shared.refresh_state().refreshing
    }

    /// Number of callers waiting on the current refresh, the one that
    /// started it included.
    pub fn queued(&self) -> usize {
        self.shared.refresh_state().queue.len()
    }

    /// Sends `request` with the current bearer token.
    ///
    /// A `401` on a fresh request triggers (or joins) a token refresh and the
    /// request is replayed once with the new token. A `401` on a replayed
    /// request is final: it comes back as [`AtelierError::AuthExpired`] with
    /// the response body, and the credentials are left alone. Other non-2xx
    /// statuses come back as [`AtelierError::HttpStatus`].
    #[instrument(
        name = "auth_gateway.send",
        skip_all,
        fields(method = %request.method, url = %request.url)
    )]
    pub async fn send(&self, request: ApiRequest) -> Result<Response<Vec<u8>>, AtelierError> {
        let (token, seen) = self.shared.token_snapshot();
        let resp = self.dispatch(&request, token.as_deref()).await?;

        if resp.status() != StatusCode::UNAUTHORIZED {
            return ensure_success(resp);
        }
        if request.retried {
            return Err(still_unauthorized(&request, resp));
        }

        debug!("{} {} got 401, waiting for a fresh token", request.method, request.url);
        let token = self.fresh_token(seen, &request).await?;

        let replay = request.replayed();
        let resp = self.dispatch(&replay, Some(&token)).await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(still_unauthorized(&replay, resp));
        }
        ensure_success(resp)
    }

    async fn dispatch(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
    ) -> Result<Response<Vec<u8>>, AtelierError> {
        let req = request.to_http(token)?;
        self.transport.send(req).await
    }

    /// Returns a token newer than generation `seen`, refreshing if needed.
    async fn fresh_token(&self, seen: u64, request: &ApiRequest) -> Result<String, AtelierError> {
        let (parked, leader) = {
            let mut state = self.shared.refresh_state();

            // A refresh settled after this request left; just use its token.
            if let Some(token) = self.shared.token_newer_than(seen) {
                return Ok(token);
            }

            let (waker, parked) = oneshot::channel();
            state.queue.push_back(PendingRequest {
                waker,
                method: request.method.clone(),
                url: request.url.clone(),
            });
            let leader = !state.refreshing;
            state.refreshing = true;
            (parked, leader)
        };

        if leader {
            spawn_refresh(self.shared.clone());
        }
        match parked.await {
            Ok(Ok(token)) => Ok(token),
            Ok(Err(reason)) => Err(AtelierError::RefreshFailed(reason)),
            Err(_) => Err(AtelierError::RefreshFailed("token refresh was abandoned".into())),
        }
    }
}

fn spawn_refresh(shared: Arc<Shared>) {
    let refresh_token = shared.credentials().and_then(|c| c.refresh_token);
    let span = tracing::info_span!("auth_gateway.refresh");
    tokio::spawn(
        async move {
            let guard = RefreshGuard {
                shared: shared.clone(),
                armed: true,
            };
            info!("Refreshing access token");
            let outcome = shared.refresher.refresh(refresh_token.as_deref()).await;
            guard.settle(outcome);
        }
        .instrument(span),
    );
}

impl Shared {
    fn complete_refresh(&self, tokens: RefreshedTokens) {
        let access_token = tokens.access_token;
        let updated = {
            let mut slot = self.token_slot_mut();
            let previous = slot.credentials.take().unwrap_or_default();
            let updated = Credentials {
                access_token: access_token.clone(),
                refresh_token: tokens.refresh_token.or(previous.refresh_token),
                user_id: previous.user_id,
            };
            slot.credentials = Some(updated.clone());
            slot.generation += 1;
            updated
        };

        let pending = self.release_queue();
        debug!("Token refreshed, resuming {} request(s)", pending.len());
        for parked in pending {
            debug!("Resuming {} {}", parked.method, parked.url);
            // The waiter may have been dropped; nothing to resume then.
            let _ = parked.waker.send(Ok(access_token.clone()));
        }

        if let Some(listener) = self.listener() {
            listener.refreshed(&updated);
        }
    }

    fn fail_refresh(&self, err: AtelierError) {
        let reason = match err {
            AtelierError::RefreshFailed(reason) => reason,
            other => format!("{:#}", other),
        };
        warn!("Token refresh failed: {}", reason);

        self.clear_credentials();
        let pending = self.release_queue();
        for parked in pending {
            debug!("Rejecting {} {}", parked.method, parked.url);
            let _ = parked.waker.send(Err(reason.clone()));
        }

        if let Some(listener) = self.listener() {
            listener.logged_out(&AtelierError::RefreshFailed(reason));
        }
    }

    /// Clears the refreshing flag and hands back the parked callers, in order.
    fn release_queue(&self) -> VecDeque<PendingRequest> {
        let mut state = self.refresh_state();
        state.refreshing = false;
        std::mem::take(&mut state.queue)
    }

    fn clear_credentials(&self) {
        let mut slot = self.token_slot_mut();
        slot.credentials = None;
        slot.generation += 1;
    }

    fn credentials(&self) -> Option<Credentials> {
        self.token_slot().credentials.clone()
    }

    fn listener(&self) -> Option<Arc<dyn CredentialListener>> {
        self.listener
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn token_snapshot(&self) -> (Option<String>, u64) {
        let slot = self.token_slot();
        (
            slot.credentials.as_ref().map(|c| c.access_token.clone()),
            slot.generation,
        )
    }

    fn token_newer_than(&self, seen: u64) -> Option<String> {
        let slot = self.token_slot();
        if slot.generation > seen {
            slot.credentials.as_ref().map(|c| c.access_token.clone())
        } else {
            None
        }
    }

    fn refresh_state(&self) -> MutexGuard<'_, RefreshState> {
        self.refresh.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn token_slot(&self) -> std::sync::RwLockReadGuard<'_, TokenSlot> {
        self.tokens.read().unwrap_or_else(|e| e.into_inner())
    }

    fn token_slot_mut(&self) -> std::sync::RwLockWriteGuard<'_, TokenSlot> {
        self.tokens.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Releases the refresh slot if the refresh task dies before it settles
/// (runtime shutdown, a panicking refresher), so parked callers are not left
/// waiting forever.
struct RefreshGuard {
    shared: Arc<Shared>,
    armed: bool,
}

impl RefreshGuard {
    fn settle(mut self, outcome: Result<RefreshedTokens, AtelierError>) {
        self.armed = false;
        match outcome {
            Ok(tokens) => self.shared.complete_refresh(tokens),
            Err(err) => self.shared.fail_refresh(err),
        }
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!("Token refresh abandoned before it settled");
            // Dropping the wakers rejects the parked callers.
            drop(self.shared.release_queue());
        }
    }
}

/// The replayed request was refused as well. The session itself is left to
/// the refresh outcome; this one call fails.
fn still_unauthorized(request: &ApiRequest, resp: Response<Vec<u8>>) -> AtelierError {
    let err = AtelierError::AuthExpired(format!(
        "{} {} rejected after token refresh: {}",
        request.method,
        request.url,
        String::from_utf8_lossy(resp.body())
    ));
    warn!("{}", err);
    err
}

fn ensure_success(resp: Response<Vec<u8>>) -> Result<Response<Vec<u8>>, AtelierError> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        Err(AtelierError::HttpStatus {
            status: resp.status().as_u16(),
            body: String::from_utf8_lossy(resp.body()).into_owned(),
        })
    }
}
