//! Client-side sliding-window limiter for feature submissions.

use crate::config::RateLimitConfig;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// At most `max_calls` calls in any `window`.
#[derive(Debug)]
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1),
            window,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_calls, config.window)
    }

    /// How long until a call would be admitted; zero if one is admitted now.
    pub fn wait_time(&self) -> Duration {
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        self.next_free(&mut calls, Instant::now())
    }

    /// Waits for a free slot, then records the call.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();
                let wait = self.next_free(&mut calls, now);
                if wait.is_zero() {
                    calls.push_back(now);
                    return;
                }
                wait
            };
            log::debug!("Rate limit reached, waiting {:?}", wait);
            sleep(wait).await;
        }
    }

    fn next_free(&self, calls: &mut VecDeque<Instant>, now: Instant) -> Duration {
        while calls
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            calls.pop_front();
        }
        if calls.len() < self.max_calls {
            return Duration::ZERO;
        }
        calls
            .front()
            .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or_default()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}
