use std::collections::VecDeque;

use tokio::time::{Duration, Instant};

/// Request quota for one API credential.
///
/// Tracked as a sliding window: the dispatch instants of the last
/// `window_duration` are kept, so no interval of that length ever sees more
/// than `window_limit` dispatches, including across window boundaries.
/// A 429 from the remote blocks the budget until the server's retry hint.
#[derive(Debug, Clone)]
pub struct RateBudget {
    window_limit: u32,
    window_duration: Duration,
    dispatched: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

impl RateBudget {
    /// # Panics
    ///
    /// Panics if `window_limit` is 0.
    pub fn new(window_limit: u32, window_duration: Duration) -> Self {
        assert!(window_limit > 0, "window_limit must be > 0");
        Self {
            window_limit,
            window_duration,
            dispatched: VecDeque::with_capacity(window_limit as usize),
            blocked_until: None,
        }
    }

    pub fn window_limit(&self) -> u32 {
        self.window_limit
    }

    pub fn window_duration(&self) -> Duration {
        self.window_duration
    }

    /// Start of the current window: the oldest dispatch still counted.
    pub fn window_start(&self) -> Option<Instant> {
        self.dispatched.front().copied()
    }

    pub fn requests_used(&self) -> u32 {
        self.dispatched.len() as u32
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&oldest) = self.dispatched.front() {
            if now.saturating_duration_since(oldest) >= self.window_duration {
                self.dispatched.pop_front();
            } else {
                break;
            }
        }
        if self.blocked_until.is_some_and(|until| now >= until) {
            self.blocked_until = None;
        }
    }

    /// When the next dispatch may happen, or `None` if it may happen now.
    pub fn available_at(&mut self, now: Instant) -> Option<Instant> {
        self.expire(now);
        if let Some(until) = self.blocked_until {
            return Some(until);
        }
        if self.requests_used() < self.window_limit {
            return None;
        }
        self.dispatched.front().map(|&oldest| oldest + self.window_duration)
    }

    /// Consume one request, or report when one will be available.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Instant> {
        match self.available_at(now) {
            Some(at) => Err(at),
            None => {
                self.dispatched.push_back(now);
                Ok(())
            }
        }
    }

    /// Server said 429: nothing goes out until `retry_after` has passed.
    pub fn block_for(&mut self, now: Instant, retry_after: Duration) {
        let until = now + retry_after;
        if self.blocked_until.is_none_or(|current| current < until) {
            self.blocked_until = Some(until);
        }
    }
}
