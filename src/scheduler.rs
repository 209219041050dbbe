use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use reqwest::header::RETRY_AFTER;
use serde_json::Value;
use tokio::sync::{Notify, oneshot};
use tokio::time::{Duration, Instant, sleep_until};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::budget::RateBudget;
use crate::error::{AuthError, NetworkError, RateLimitError, ValidationError};
use crate::logger::MessageLogger;
use crate::protocol::{self, Operation};
use crate::token::TokenManager;
use crate::types::ParameterKey;
use crate::{Error, Result};

/// Dispatch urgency. Writes the user is waiting on go first; background
/// polling yields to them but is promoted once it has waited too long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Background,
    Normal,
    Interactive,
}

/// Runtime scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Requests allowed per `window_duration`.
    ///
    /// Default: 15
    pub window_limit: u32,

    /// Default: 60 seconds
    pub window_duration: Duration,

    /// Attempts per operation before a retryable failure is surfaced.
    ///
    /// Default: 5
    pub max_attempts: u32,

    /// Default: 1 second
    pub backoff_base: Duration,

    /// Default: 2
    pub backoff_factor: u32,

    /// Default: 60 seconds
    pub backoff_cap: Duration,

    /// Deadline of a single HTTP attempt. Exceeding it is a retryable timeout.
    ///
    /// Default: 30 seconds
    pub request_timeout: Duration,

    /// Background jobs waiting longer than this compete with interactive ones.
    ///
    /// Default: 120 seconds
    pub promote_after: Duration,

    /// Budget block applied on a 429 without a usable Retry-After header.
    ///
    /// Default: 60 seconds
    pub default_retry_after: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            window_limit: 15,
            window_duration: Duration::from_secs(60),
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_factor: 2,
            backoff_cap: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            promote_after: Duration::from_secs(120),
            default_retry_after: Duration::from_secs(60),
        }
    }
}

impl SchedulerConfig {
    pub fn with_rate_limit(mut self, window_limit: u32, window_duration: Duration) -> Self {
        self.window_limit = window_limit;
        self.window_duration = window_duration;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, base: Duration, factor: u32, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_factor = factor;
        self.backoff_cap = cap;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_promote_after(mut self, promote_after: Duration) -> Self {
        self.promote_after = promote_after;
        self
    }

    pub fn with_default_retry_after(mut self, retry_after: Duration) -> Self {
        self.default_retry_after = retry_after;
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = self.backoff_factor.max(1).saturating_pow(exponent);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }
}

struct Job {
    id: u64,
    op_id: Uuid,
    operation: Operation,
    priority: Priority,
    enqueued_at: Instant,
    not_before: Instant,
    attempts: u32,
    reply: oneshot::Sender<Result<Value>>,
}

impl Job {
    fn effective_priority(&self, now: Instant, promote_after: Duration) -> Priority {
        if self.priority < Priority::Interactive
            && now.saturating_duration_since(self.enqueued_at) >= promote_after
        {
            Priority::Interactive
        } else {
            self.priority
        }
    }

    fn resolve(self, result: Result<Value>) {
        // The caller may have dropped its ticket; nothing left to tell.
        let _ = self.reply.send(result);
    }
}

#[derive(Default)]
struct Queue {
    jobs: Vec<Job>,
    in_flight_writes: HashSet<ParameterKey>,
}

impl Queue {
    /// Drop jobs whose tickets were dropped before dispatch.
    fn prune(&mut self) {
        self.jobs.retain(|job| {
            let keep = !job.reply.is_closed();
            if !keep {
                debug!(job = job.id, "ticket dropped before dispatch, job withdrawn");
            }
            keep
        });
    }

    /// Writes to one parameter go out one at a time, in submission order.
    fn is_write_blocked(&self, job: &Job) -> bool {
        let Some(key) = job.operation.write_key() else {
            return false;
        };
        self.in_flight_writes.contains(&key)
            || self
                .jobs
                .iter()
                .any(|other| other.id < job.id && other.operation.write_key() == Some(key))
    }

    fn next_ready_at(&self) -> Option<Instant> {
        self.jobs
            .iter()
            .filter(|job| !self.is_write_blocked(job))
            .map(|job| job.not_before)
            .min()
    }

    fn take_best(&mut self, now: Instant, promote_after: Duration) -> Option<Job> {
        let index = self
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.not_before <= now && !self.is_write_blocked(job))
            .max_by(|(_, a), (_, b)| {
                a.effective_priority(now, promote_after)
                    .cmp(&b.effective_priority(now, promote_after))
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|(index, _)| index)?;
        let job = self.jobs.swap_remove(index);
        if let Some(key) = job.operation.write_key() {
            self.in_flight_writes.insert(key);
        }
        Some(job)
    }

    fn remove(&mut self, id: u64) -> Option<Job> {
        let index = self.jobs.iter().position(|job| job.id == id)?;
        Some(self.jobs.swap_remove(index))
    }
}

struct Shared {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenManager>,
    config: SchedulerConfig,
    queue: Mutex<Queue>,
    budget: Mutex<RateBudget>,
    wake: Notify,
    closed: AtomicBool,
    next_id: AtomicU64,
    dispatched: AtomicU64,
    logger: Option<Mutex<MessageLogger>>,
}

/// Future of a submitted operation, resolving to the decoded response body.
///
/// Dropping the ticket before dispatch withdraws the job; after dispatch the
/// request still completes on the remote side.
pub struct Ticket {
    id: u64,
    rx: oneshot::Receiver<Result<Value>>,
    shared: Arc<Shared>,
}

impl Ticket {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Withdraw the job if it has not been dispatched yet. Returns false once
    /// the request is on the wire; the ticket then still resolves normally.
    pub fn cancel(&mut self) -> bool {
        let removed = self.shared.lock_queue().remove(self.id);
        match removed {
            Some(job) => {
                debug!(job = job.id, kind = ?job.operation.kind(), "job cancelled before dispatch");
                job.resolve(Err(Error::Cancelled));
                self.shared.wake.notify_one();
                true
            }
            None => false,
        }
    }
}

impl Future for Ticket {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::SchedulerClosed)))
    }
}

/// Handle to the dispatcher. Cheap to clone; all clones share one queue and
/// one rate budget. Dropping the last clone shuts the dispatcher down.
#[derive(Clone)]
pub struct RateLimitedScheduler {
    shared: Arc<Shared>,
    _owner: Arc<Owner>,
}

struct Owner {
    shared: Arc<Shared>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl RateLimitedScheduler {
    /// Starts the dispatcher task. Must be called inside a Tokio runtime.
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        tokens: Arc<TokenManager>,
        config: SchedulerConfig,
    ) -> Self {
        Self::start(http, base_url.into(), tokens, config, None)
    }

    pub(crate) fn start(
        http: reqwest::Client,
        base_url: String,
        tokens: Arc<TokenManager>,
        config: SchedulerConfig,
        logger: Option<MessageLogger>,
    ) -> Self {
        let budget = RateBudget::new(config.window_limit, config.window_duration);
        let shared = Arc::new(Shared {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            config,
            queue: Mutex::new(Queue::default()),
            budget: Mutex::new(budget),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            dispatched: AtomicU64::new(0),
            logger: logger.map(Mutex::new),
        });
        tokio::spawn(shared.clone().run());
        Self {
            _owner: Arc::new(Owner { shared: shared.clone() }),
            shared,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.shared.tokens
    }

    /// Queue an operation. Never waits; the returned ticket resolves when
    /// the operation succeeds or fails for good.
    pub fn submit(&self, operation: Operation, priority: Priority) -> Ticket {
        let (reply, rx) = oneshot::channel();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let ticket = Ticket {
            id,
            rx,
            shared: self.shared.clone(),
        };

        if self.shared.closed.load(Ordering::Acquire) {
            let _ = reply.send(Err(Error::SchedulerClosed));
            return ticket;
        }

        let now = Instant::now();
        let job = Job {
            id,
            op_id: Uuid::new_v4(),
            operation,
            priority,
            enqueued_at: now,
            not_before: now,
            attempts: 0,
            reply,
        };
        trace!(job = id, kind = ?job.operation.kind(), ?priority, "operation queued");
        self.shared.lock_queue().jobs.push(job);
        self.shared.wake.notify_one();
        ticket
    }

    /// Jobs waiting for dispatch, including ones backing off.
    pub fn pending(&self) -> usize {
        self.shared.lock_queue().jobs.len()
    }

    /// HTTP attempts sent so far.
    pub fn dispatched(&self) -> u64 {
        self.shared.dispatched.load(Ordering::Relaxed)
    }

    /// Fail everything queued with `SchedulerClosed` and stop the dispatcher.
    pub fn shutdown(&self) {
        self.shared.close();
    }
}

impl Shared {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_budget(&self) -> MutexGuard<'_, RateBudget> {
        self.budget.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run(self: Arc<Self>) {
        debug!("scheduler dispatcher started");
        loop {
            if self.closed.load(Ordering::Acquire) {
                self.fail_queued(Error::SchedulerClosed);
                debug!("scheduler dispatcher stopped");
                return;
            }

            let ready_at = {
                let mut queue = self.lock_queue();
                queue.prune();
                queue.next_ready_at()
            };
            let Some(ready_at) = ready_at else {
                self.wake.notified().await;
                continue;
            };

            let now = Instant::now();
            if ready_at > now {
                self.sleep_until_or_woken(ready_at).await;
                continue;
            }

            let available_at = self.lock_budget().available_at(now);
            if let Some(available_at) = available_at {
                trace!(
                    wait_ms = available_at.saturating_duration_since(now).as_millis() as u64,
                    "rate budget exhausted"
                );
                self.sleep_until_or_woken(available_at).await;
                continue;
            }

            let Some(job) = self.lock_queue().take_best(now, self.config.promote_after) else {
                continue;
            };
            let acquired = self.lock_budget().try_acquire(now);
            if let Err(available_at) = acquired {
                self.requeue(job);
                self.sleep_until_or_woken(available_at).await;
                continue;
            }
            self.dispatched.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(self.clone().dispatch(job));
        }
    }

    async fn sleep_until_or_woken(&self, deadline: Instant) {
        tokio::select! {
            _ = sleep_until(deadline) => {}
            _ = self.wake.notified() => {}
        }
    }

    async fn dispatch(self: Arc<Self>, mut job: Job) {
        let result = self.execute(&job).await;
        let now = Instant::now();

        match result {
            Ok(body) => {
                trace!(job = job.id, kind = ?job.operation.kind(), "operation completed");
                self.finish(job, Ok(body));
            }
            Err(Error::RateLimit(RateLimitError::Exhausted { retry_after })) => {
                warn!(
                    job = job.id,
                    retry_after_secs = retry_after.as_secs_f64(),
                    "rate limited by remote, re-queueing"
                );
                self.lock_budget().block_for(now, retry_after);
                job.not_before = now + retry_after;
                self.requeue(job);
            }
            Err(err) if err.is_revoked() => {
                error!(job = job.id, error = %err, "authorization revoked, failing queued operations");
                self.finish(job, Err(Error::Auth(AuthError::Revoked)));
                self.fail_queued(Error::Auth(AuthError::Revoked));
            }
            Err(err) if err.is_retryable() => {
                job.attempts += 1;
                if job.attempts >= self.config.max_attempts {
                    warn!(job = job.id, attempts = job.attempts, error = %err, "giving up after retries");
                    self.finish(job, Err(err));
                } else {
                    let delay = self.config.backoff_delay(job.attempts);
                    debug!(
                        job = job.id,
                        attempt = job.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after backoff"
                    );
                    job.not_before = now + delay;
                    self.requeue(job);
                }
            }
            Err(err) => {
                debug!(job = job.id, error = %err, "operation failed permanently");
                self.finish(job, Err(err));
            }
        }
    }

    fn release_write(&self, queue: &mut Queue, job: &Job) {
        if let Some(key) = job.operation.write_key() {
            queue.in_flight_writes.remove(&key);
        }
    }

    fn finish(&self, job: Job, result: Result<Value>) {
        {
            let mut queue = self.lock_queue();
            self.release_write(&mut queue, &job);
        }
        job.resolve(result);
        self.wake.notify_one();
    }

    fn requeue(&self, job: Job) {
        if self.closed.load(Ordering::Acquire) {
            self.finish(job, Err(Error::SchedulerClosed));
            return;
        }
        if job.reply.is_closed() {
            let mut queue = self.lock_queue();
            self.release_write(&mut queue, &job);
            return;
        }
        {
            let mut queue = self.lock_queue();
            self.release_write(&mut queue, &job);
            queue.jobs.push(job);
        }
        self.wake.notify_one();
    }

    fn fail_queued(&self, error: Error) {
        let jobs = std::mem::take(&mut self.lock_queue().jobs);
        if !jobs.is_empty() {
            debug!(count = jobs.len(), error = %error, "failing queued operations");
        }
        for job in jobs {
            job.resolve(Err(error.clone()));
        }
    }

    async fn execute(&self, job: &Job) -> Result<Value> {
        let token = self.tokens.get_valid_token().await?;
        let operation = &job.operation;
        let path = operation.path();
        let url = format!("{}{}", self.base_url, path);
        let body = operation.body();

        self.with_logger(|logger| {
            logger.log_request(job.op_id, job.attempts + 1, operation.method().as_str(), &path, body.as_ref())
        });

        let mut request = self
            .http
            .request(operation.method(), &url)
            .bearer_auth(&token.access_token)
            .timeout(self.config.request_timeout)
            .query(&operation.query());
        if let Some(body) = &body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let err = Error::Network(NetworkError::from(e));
                self.log_failure(job, &err);
                return Err(err);
            }
        };
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                let err = Error::Network(NetworkError::from(e));
                self.log_failure(job, &err);
                return Err(err);
            }
        };
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        self.with_logger(|logger| logger.log_response(job.op_id, status, &body));

        if status == 401 {
            self.tokens.invalidate_access().await;
        }
        classify(status, retry_after, self.config.default_retry_after, body)
    }

    fn log_failure(&self, job: &Job, err: &Error) {
        self.with_logger(|logger| logger.log_failure(job.op_id, &err.to_string()));
    }

    fn with_logger(&self, f: impl FnOnce(&mut MessageLogger)) {
        if let Some(logger) = &self.logger
            && let Ok(mut logger) = logger.lock()
        {
            f(&mut logger);
        }
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

/// Map an HTTP status onto the error taxonomy.
fn classify(status: u16, retry_after: Option<Duration>, default_retry_after: Duration, body: Value) -> Result<Value> {
    match status {
        200..=299 => Ok(body),
        401 => Err(AuthError::TransientNetwork("access token rejected".into()).into()),
        429 => Err(RateLimitError::Exhausted {
            retry_after: retry_after.unwrap_or(default_retry_after),
        }
        .into()),
        403 => Err(ValidationError::PermissionDenied(protocol::error_message(&body)).into()),
        404 => Err(ValidationError::UnknownParameter(protocol::error_message(&body)).into()),
        400..=499 => Err(ValidationError::InvalidValue(format!(
            "http {status}: {}",
            protocol::error_message(&body)
        ))
        .into()),
        _ => Err(NetworkError::Server {
            status,
            message: protocol::error_message(&body),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ParameterId, SystemId};
    use serde_json::json;

    fn job(id: u64, operation: Operation, priority: Priority, enqueued_at: Instant) -> (Job, oneshot::Receiver<Result<Value>>) {
        let (reply, rx) = oneshot::channel();
        let job = Job {
            id,
            op_id: Uuid::new_v4(),
            operation,
            priority,
            enqueued_at,
            not_before: enqueued_at,
            attempts: 0,
            reply,
        };
        (job, rx)
    }

    fn read(system: u32) -> Operation {
        Operation::ReadParameters {
            system_id: SystemId(system),
            parameter_ids: vec![ParameterId(40004)],
        }
    }

    fn write(parameter: u32, value: &str) -> Operation {
        Operation::WriteParameter {
            system_id: SystemId(1),
            menu_id: None,
            parameter_id: ParameterId(parameter),
            value: value.into(),
        }
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let config = SchedulerConfig::default();
        assert_eq!(config.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(config.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(4), Duration::from_secs(8));
        assert_eq!(config.backoff_delay(7), Duration::from_secs(60));
        assert_eq!(config.backoff_delay(40), Duration::from_secs(60));
    }

    #[test]
    fn interactive_beats_background_and_ties_go_fifo() {
        let now = Instant::now();
        let mut queue = Queue::default();
        let mut receivers = Vec::new();
        for (id, op, priority) in [
            (1, read(1), Priority::Background),
            (2, read(2), Priority::Background),
            (3, write(47011, "1"), Priority::Interactive),
            (4, write(47012, "0"), Priority::Interactive),
        ] {
            let (job, rx) = job(id, op, priority, now);
            queue.jobs.push(job);
            receivers.push(rx);
        }
        let order: Vec<u64> = std::iter::from_fn(|| queue.take_best(now, Duration::from_secs(60)).map(|j| j.id)).collect();
        assert_eq!(order, vec![3, 4, 1, 2]);
    }

    #[test]
    fn aged_background_job_is_promoted() {
        let now = Instant::now();
        let mut queue = Queue::default();
        let (old_read, _rx1) = job(1, read(1), Priority::Background, now);
        let (fresh_write, _rx2) = job(2, write(47011, "1"), Priority::Interactive, now + Duration::from_secs(100));
        queue.jobs.push(old_read);
        queue.jobs.push(fresh_write);
        let later = now + Duration::from_secs(100);
        assert_eq!(queue.take_best(later, Duration::from_secs(90)).unwrap().id, 1);
    }

    #[test]
    fn second_write_to_same_parameter_waits_for_first() {
        let now = Instant::now();
        let mut queue = Queue::default();
        let (first, _rx1) = job(1, write(47011, "1"), Priority::Interactive, now);
        let (second, _rx2) = job(2, write(47011, "2"), Priority::Interactive, now);
        queue.jobs.push(first);
        queue.jobs.push(second);

        let taken = queue.take_best(now, Duration::from_secs(60)).unwrap();
        assert_eq!(taken.id, 1);
        assert!(queue.take_best(now, Duration::from_secs(60)).is_none());
        assert_eq!(queue.next_ready_at(), None);

        queue.in_flight_writes.clear();
        assert_eq!(queue.take_best(now, Duration::from_secs(60)).unwrap().id, 2);
    }

    #[test]
    fn prune_drops_abandoned_jobs() {
        let now = Instant::now();
        let mut queue = Queue::default();
        let (kept, _rx) = job(1, read(1), Priority::Background, now);
        let (dropped, rx) = job(2, read(2), Priority::Background, now);
        drop(rx);
        queue.jobs.push(kept);
        queue.jobs.push(dropped);
        queue.prune();
        assert_eq!(queue.jobs.len(), 1);
        assert_eq!(queue.jobs[0].id, 1);
    }

    #[test]
    fn classify_statuses() {
        let d = Duration::from_secs(60);
        assert!(classify(200, None, d, json!([])).is_ok());
        assert!(matches!(
            classify(403, None, d, json!({"message": "read only"})),
            Err(Error::Validation(ValidationError::PermissionDenied(m))) if m == "read only"
        ));
        assert!(matches!(
            classify(404, None, d, Value::Null),
            Err(Error::Validation(ValidationError::UnknownParameter(_)))
        ));
        assert!(matches!(
            classify(422, None, d, Value::Null),
            Err(Error::Validation(ValidationError::InvalidValue(_)))
        ));
        assert!(matches!(
            classify(429, Some(Duration::from_secs(5)), d, Value::Null),
            Err(Error::RateLimit(RateLimitError::Exhausted { retry_after })) if retry_after == Duration::from_secs(5)
        ));
        assert!(matches!(
            classify(429, None, d, Value::Null),
            Err(Error::RateLimit(RateLimitError::Exhausted { retry_after })) if retry_after == d
        ));
        assert!(matches!(
            classify(502, None, d, Value::Null),
            Err(Error::Network(NetworkError::Server { status: 502, .. }))
        ));
        assert!(classify(401, None, d, Value::Null).unwrap_err().is_retryable());
    }

    #[test]
    fn retry_after_header_parsing() {
        assert_eq!(parse_retry_after("5"), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after(" 1.5 "), Some(Duration::from_millis(1500)));
        assert_eq!(parse_retry_after("-1"), None);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }
}
