use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};
use std::task::{Context, Poll};

use chrono::Utc;
use tokio::sync::{Notify, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::client::UplinkClient;
use crate::error::ValidationError;
use crate::protocol::{self, Operation};
use crate::scheduler::Priority;
use crate::types::*;
use crate::{Error, Result};

/// Resolves with the outcome of the latest value written to the parameter.
///
/// Dropping every ticket of a write that has not been dispatched yet
/// withdraws it and restores the last confirmed value.
pub struct WriteTicket {
    rx: oneshot::Receiver<WriteOutcome>,
    changed: Option<Arc<Notify>>,
}

impl Future for WriteTicket {
    type Output = WriteOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::Cancelled)))
    }
}

impl Drop for WriteTicket {
    fn drop(&mut self) {
        if let Some(changed) = &self.changed {
            changed.notify_one();
        }
    }
}

struct PendingSlot {
    menu_id: Option<String>,
    target: String,
    waiters: Vec<oneshot::Sender<WriteOutcome>>,
    changed: Arc<Notify>,
    /// Raw value the remote is known to hold, restored if the write fails.
    confirmed: Option<String>,
}

impl PendingSlot {
    fn prune_waiters(&mut self) {
        self.waiters.retain(|w| !w.is_closed());
    }
}

#[derive(Default)]
struct Entry {
    parameter: Option<Parameter>,
    last_error: Option<Error>,
    pending: Option<PendingSlot>,
}

struct CacheInner {
    system_id: SystemId,
    write_access: bool,
    client: UplinkClient,
    entries: RwLock<HashMap<ParameterId, Entry>>,
    watchers: Mutex<HashMap<ParameterId, watch::Sender<Option<Parameter>>>>,
}

enum Attempt {
    Submit {
        target: String,
        menu_id: Option<String>,
        changed: Arc<Notify>,
    },
    Finished,
}

/// Parameter state of one system. Clones share the same entries.
#[derive(Clone)]
pub struct ParameterCache {
    inner: Arc<CacheInner>,
}

impl ParameterCache {
    pub fn new(client: UplinkClient, system: &System) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                system_id: system.system_id,
                write_access: system.capabilities.write_access,
                client,
                entries: RwLock::new(HashMap::new()),
                watchers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn system_id(&self) -> SystemId {
        self.inner.system_id
    }

    /// Last known state, including any optimistic value of a pending write.
    pub fn read(&self, parameter_id: ParameterId) -> Option<Parameter> {
        self.inner
            .entries
            .read()
            .ok()?
            .get(&parameter_id)?
            .parameter
            .clone()
    }

    /// Why the last refresh or write of this parameter failed, if it did.
    pub fn last_error(&self, parameter_id: ParameterId) -> Option<Error> {
        self.inner
            .entries
            .read()
            .ok()?
            .get(&parameter_id)?
            .last_error
            .clone()
    }

    /// All known parameters, ordered by id.
    pub fn snapshot(&self) -> Vec<Parameter> {
        let Ok(entries) = self.inner.entries.read() else {
            return Vec::new();
        };
        let mut parameters: Vec<Parameter> = entries.values().filter_map(|e| e.parameter.clone()).collect();
        parameters.sort_by_key(|p| p.parameter_id);
        parameters
    }

    /// Receiver updated whenever the parameter's value changes.
    pub fn subscribe(&self, parameter_id: ParameterId) -> watch::Receiver<Option<Parameter>> {
        let current = self.read(parameter_id);
        let mut watchers = self.inner.lock_watchers();
        watchers
            .entry(parameter_id)
            .or_insert_with(|| watch::channel(current).0)
            .subscribe()
    }

    /// Fetch the given parameters at background priority. Ids in a failed
    /// batch keep their cached values and get the error recorded; the first
    /// such error is returned once every successful batch has been applied.
    pub async fn refresh(&self, parameter_ids: &[ParameterId]) -> Result<()> {
        if parameter_ids.is_empty() {
            return Ok(());
        }
        let batches = match self
            .inner
            .client
            .read_parameters(self.inner.system_id, parameter_ids, Priority::Background)
            .await
        {
            Ok(batches) => batches,
            Err(e) => {
                self.record_failure(parameter_ids, &e);
                return Err(e);
            }
        };

        let mut failure = None;
        for batch in batches {
            match batch.result {
                Ok(parameters) => {
                    trace!(system = %self.inner.system_id, count = parameters.len(), "parameters refreshed");
                    self.ingest(parameters);
                }
                Err(e) => {
                    self.record_failure(&batch.parameter_ids, &e);
                    failure = failure.or(Some(e));
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    fn record_failure(&self, parameter_ids: &[ParameterId], error: &Error) {
        warn!(
            system = %self.inner.system_id,
            count = parameter_ids.len(),
            error = %error,
            "parameter refresh failed, keeping cached values"
        );
        let mut entries = self.inner.write_entries();
        for id in parameter_ids {
            entries.entry(*id).or_default().last_error = Some(error.clone());
        }
    }

    /// Merge authoritative values, e.g. parameters carried by status icons.
    /// A parameter with a write in progress keeps its optimistic value; the
    /// fetched one becomes the rollback target.
    pub fn ingest(&self, parameters: impl IntoIterator<Item = Parameter>) {
        let mut changed = Vec::new();
        {
            let mut entries = self.inner.write_entries();
            for mut fetched in parameters {
                let id = fetched.parameter_id;
                let entry = entries.entry(id).or_default();
                entry.last_error = None;

                let previous = entry.parameter.take();
                if fetched.menu_id.is_none() {
                    fetched.menu_id = previous.as_ref().and_then(|p| p.menu_id.clone());
                }
                if let Some(slot) = entry.pending.as_mut() {
                    slot.confirmed = fetched.raw_value.clone();
                    fetched.raw_value = previous.as_ref().and_then(|p| p.raw_value.clone());
                    fetched.pending_write = previous.as_ref().and_then(|p| p.pending_write.clone());
                }

                let value_changed = previous.as_ref().is_none_or(|p| {
                    p.raw_value != fetched.raw_value || p.display_value != fetched.display_value
                });
                if value_changed {
                    changed.push(fetched.clone());
                }
                entry.parameter = Some(fetched);
            }
        }
        for parameter in changed {
            self.inner.publish(parameter);
        }
    }

    /// Request a new value. The cached value changes immediately; the
    /// returned ticket resolves once the remote accepted the latest value
    /// written to this parameter.
    pub fn write(&self, parameter_id: ParameterId, value: impl Into<String>) -> WriteTicket {
        self.write_with_menu(parameter_id, None, value)
    }

    pub fn write_with_menu(
        &self,
        parameter_id: ParameterId,
        menu_id: Option<&str>,
        value: impl Into<String>,
    ) -> WriteTicket {
        let value = value.into();
        let (tx, rx) = oneshot::channel();

        if !self.inner.write_access {
            debug!(system = %self.inner.system_id, parameter = %parameter_id, "write rejected, system is read-only");
            let denied = ValidationError::PermissionDenied(format!("system {} has no write access", self.inner.system_id));
            let _ = tx.send(Err(denied.into()));
            return WriteTicket { rx, changed: None };
        }

        let (changed, start_worker, snapshot) = {
            let mut entries = self.inner.write_entries();
            let entry = entries.entry(parameter_id).or_default();
            let parameter = entry
                .parameter
                .get_or_insert_with(|| Parameter::unknown(parameter_id));
            let menu_id = menu_id.map(str::to_string).or_else(|| parameter.menu_id.clone());

            let (changed, start_worker) = match entry.pending.as_mut() {
                Some(slot) => {
                    debug!(parameter = %parameter_id, from = %slot.target, to = %value, "coalescing pending write");
                    slot.target = value.clone();
                    if menu_id.is_some() {
                        slot.menu_id = menu_id;
                    }
                    slot.waiters.push(tx);
                    if let Some(pending) = parameter.pending_write.as_mut() {
                        pending.target_value = value.clone();
                    }
                    (slot.changed.clone(), false)
                }
                None => {
                    let changed = Arc::new(Notify::new());
                    entry.pending = Some(PendingSlot {
                        menu_id,
                        target: value.clone(),
                        waiters: vec![tx],
                        changed: changed.clone(),
                        confirmed: parameter.raw_value.clone(),
                    });
                    parameter.pending_write = Some(PendingWrite {
                        parameter_id,
                        target_value: value.clone(),
                        attempt_count: 0,
                        submitted_at: Utc::now(),
                    });
                    (changed, true)
                }
            };
            parameter.raw_value = Some(value);
            (changed, start_worker, parameter.clone())
        };

        self.inner.publish(snapshot);
        if start_worker {
            tokio::spawn(drive_write(self.inner.clone(), parameter_id));
        } else {
            changed.notify_one();
        }
        WriteTicket {
            rx,
            changed: Some(changed),
        }
    }
}

impl CacheInner {
    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<ParameterId, Entry>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_watchers(&self) -> std::sync::MutexGuard<'_, HashMap<ParameterId, watch::Sender<Option<Parameter>>>> {
        self.watchers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, parameter: Parameter) {
        if let Some(tx) = self.lock_watchers().get(&parameter.parameter_id) {
            tx.send_replace(Some(parameter));
        }
    }

    /// Snapshot the latest target for dispatch, or withdraw the write when
    /// nobody is waiting for it any more.
    fn begin_attempt(&self, parameter_id: ParameterId) -> Attempt {
        let mut withdrawn = None;
        let attempt = {
            let mut entries = self.write_entries();
            let Some(entry) = entries.get_mut(&parameter_id) else {
                return Attempt::Finished;
            };
            let Some(slot) = entry.pending.as_mut() else {
                return Attempt::Finished;
            };
            slot.prune_waiters();

            if slot.waiters.is_empty() {
                let confirmed = slot.confirmed.clone();
                entry.pending = None;
                if let Some(parameter) = entry.parameter.as_mut() {
                    parameter.raw_value = confirmed;
                    parameter.pending_write = None;
                    withdrawn = Some(parameter.clone());
                }
                debug!(parameter = %parameter_id, "write abandoned by all callers, withdrawn");
                Attempt::Finished
            } else {
                if let Some(pending) = entry.parameter.as_mut().and_then(|p| p.pending_write.as_mut()) {
                    pending.target_value = slot.target.clone();
                    pending.attempt_count += 1;
                    pending.submitted_at = Utc::now();
                }
                Attempt::Submit {
                    target: slot.target.clone(),
                    menu_id: slot.menu_id.clone(),
                    changed: slot.changed.clone(),
                }
            }
        };
        if let Some(parameter) = withdrawn {
            self.publish(parameter);
        }
        attempt
    }

    /// True when the value on its way out is no longer wanted.
    fn is_superseded(&self, parameter_id: ParameterId, sent: &str) -> bool {
        let mut entries = self.write_entries();
        match entries.get_mut(&parameter_id).and_then(|e| e.pending.as_mut()) {
            Some(slot) => {
                slot.prune_waiters();
                slot.target != sent || slot.waiters.is_empty()
            }
            None => true,
        }
    }

    /// Apply the outcome of the PUT carrying `sent`. Returns false when a
    /// newer target arrived meanwhile and has to be sent next.
    fn settle(&self, parameter_id: ParameterId, sent: &str, outcome: WriteOutcome) -> bool {
        let (waiters, snapshot) = {
            let mut entries = self.write_entries();
            let Some(entry) = entries.get_mut(&parameter_id) else {
                return true;
            };
            let Some(slot) = entry.pending.as_mut() else {
                return true;
            };
            slot.prune_waiters();
            if outcome.is_ok() {
                slot.confirmed = Some(sent.to_string());
            }

            let revoked = matches!(&outcome, Err(e) if e.is_revoked());
            if !revoked && slot.target != sent && !slot.waiters.is_empty() {
                trace!(parameter = %parameter_id, superseded = %sent, latest = %slot.target, "pending write superseded in flight");
                return false;
            }

            let Some(slot) = entry.pending.take() else {
                return true;
            };
            match &outcome {
                Ok(ack) => {
                    debug!(parameter = %parameter_id, value = %ack.value, status = %ack.status, "write accepted");
                    entry.last_error = None;
                }
                Err(e) => {
                    warn!(parameter = %parameter_id, value = %sent, error = %e, "write failed, restoring last confirmed value");
                    entry.last_error = Some(e.clone());
                }
            }
            let parameter = entry
                .parameter
                .get_or_insert_with(|| Parameter::unknown(parameter_id));
            parameter.raw_value = slot.confirmed.clone();
            parameter.pending_write = None;
            (slot.waiters, parameter.clone())
        };

        self.publish(snapshot);
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        true
    }
}

async fn drive_write(inner: Arc<CacheInner>, parameter_id: ParameterId) {
    loop {
        let Attempt::Submit {
            target,
            menu_id,
            changed,
        } = inner.begin_attempt(parameter_id)
        else {
            return;
        };

        let operation = Operation::WriteParameter {
            system_id: inner.system_id,
            menu_id,
            parameter_id,
            value: target.clone(),
        };
        let mut ticket = match inner.client.submit(operation, Priority::Interactive).await {
            Ok(ticket) => ticket,
            Err(e) => {
                inner.settle(parameter_id, &target, Err(e));
                return;
            }
        };

        let result = loop {
            tokio::select! {
                result = &mut ticket => break Some(result),
                _ = changed.notified() => {
                    if inner.is_superseded(parameter_id, &target) && ticket.cancel() {
                        trace!(parameter = %parameter_id, value = %target, "withdrew superseded write before dispatch");
                        break None;
                    }
                }
            }
        };

        let Some(result) = result else {
            continue;
        };
        let outcome = result.and_then(|body| protocol::parse_write_ack(parameter_id, &target, &body));
        if inner.settle(parameter_id, &target, outcome) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{RateLimitedScheduler, SchedulerConfig};
    use crate::token::{OAuthCredentials, TokenManager};

    fn offline_cache(write_access: bool) -> ParameterCache {
        let credentials = OAuthCredentials::new("id", "secret", "cb", write_access);
        let tokens = Arc::new(TokenManager::builder(credentials).build().unwrap());
        let scheduler = RateLimitedScheduler::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            tokens.clone(),
            SchedulerConfig::default(),
        );
        let system = System {
            system_id: SystemId(7),
            capabilities: Capabilities { write_access },
            ..System::default()
        };
        ParameterCache::new(UplinkClient::from_parts(tokens, scheduler), &system)
    }

    fn fetched(id: u32, raw: &str) -> Parameter {
        Parameter {
            raw_value: Some(raw.into()),
            display_value: format!("{raw} units"),
            last_fetched_at: Some(Utc::now()),
            ..Parameter::unknown(ParameterId(id))
        }
    }

    #[tokio::test]
    async fn ingest_then_read_never_blocks() {
        let cache = offline_cache(false);
        assert!(cache.read(ParameterId(40004)).is_none());
        cache.ingest([fetched(40004, "-37"), fetched(40008, "254")]);
        assert_eq!(cache.read(ParameterId(40004)).unwrap().raw_value.as_deref(), Some("-37"));
        let ids: Vec<u32> = cache.snapshot().iter().map(|p| p.parameter_id.0).collect();
        assert_eq!(ids, vec![40004, 40008]);
    }

    #[tokio::test]
    async fn read_only_system_rejects_writes_locally() {
        let cache = offline_cache(false);
        cache.ingest([fetched(47011, "0")]);
        let err = cache.write(ParameterId(47011), "1").await.unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::PermissionDenied(_))));
        assert_eq!(cache.read(ParameterId(47011)).unwrap().raw_value.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn failed_write_without_authorization_rolls_back() {
        let cache = offline_cache(true);
        cache.ingest([fetched(47011, "0")]);
        let ticket = cache.write(ParameterId(47011), "1");
        assert_eq!(cache.read(ParameterId(47011)).unwrap().raw_value.as_deref(), Some("1"));

        let err = ticket.await.unwrap_err();
        assert!(err.is_revoked());
        let parameter = cache.read(ParameterId(47011)).unwrap();
        assert_eq!(parameter.raw_value.as_deref(), Some("0"));
        assert!(parameter.pending_write.is_none());
        assert!(cache.last_error(ParameterId(47011)).is_some());
    }

    #[tokio::test]
    async fn ingest_during_pending_write_keeps_optimistic_value() {
        let cache = offline_cache(true);
        cache.ingest([fetched(47011, "0")]);
        let ticket = cache.write(ParameterId(47011), "2");
        cache.ingest([fetched(47011, "1")]);
        assert_eq!(cache.read(ParameterId(47011)).unwrap().raw_value.as_deref(), Some("2"));

        // No authorization, so the write fails and rolls back to the newest fetched value.
        assert!(ticket.await.is_err());
        assert_eq!(cache.read(ParameterId(47011)).unwrap().raw_value.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn subscribers_see_changes_only() {
        let cache = offline_cache(false);
        let mut rx = cache.subscribe(ParameterId(40004));
        assert!(rx.borrow().is_none());

        cache.ingest([fetched(40004, "5")]);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().raw_value.as_deref(), Some("5"));

        cache.ingest([fetched(40004, "5")]);
        assert!(!rx.has_changed().unwrap());
    }
}
