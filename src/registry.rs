use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::cache::ParameterCache;
use crate::client::UplinkClient;
use crate::config::{ControlSettings, SystemConfig, ThermostatConfig, UplinkConfig};
use crate::error::AuthError;
use crate::thermostat::{ControlPolicy, InputProvider, Thermostat, ThermostatController};
use crate::types::*;
use crate::{Error, Result};

const EVENT_CAPACITY: usize = 64;

/// What the host platform needs to surface beyond parameter values.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    NotificationRaised {
        system_id: SystemId,
        notification: Notification,
    },
    NotificationCleared {
        system_id: SystemId,
        notification_id: i64,
    },
    StatusesChanged {
        system_id: SystemId,
        statuses: BTreeSet<String>,
    },
    /// Re-authorization is required before anything else can succeed.
    AuthorizationRevoked,
    PollFailed {
        system_id: SystemId,
        error: String,
    },
    MissingInput {
        system_id: SystemId,
        thermostat: u32,
    },
}

/// One system and everything attached to it.
pub struct SystemHandle {
    system: System,
    config: SystemConfig,
    cache: ParameterCache,
    statuses: RwLock<BTreeSet<String>>,
    notifications: RwLock<BTreeMap<i64, Notification>>,
}

impl SystemHandle {
    pub fn system(&self) -> &System {
        &self.system
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn cache(&self) -> &ParameterCache {
        &self.cache
    }

    /// Titles of the status icons shown on the last poll.
    pub fn statuses(&self) -> BTreeSet<String> {
        self.statuses.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// Active alarms as of the last poll.
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications
            .read()
            .map(|n| n.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Replace the status set, reporting whether it changed.
    fn update_statuses(&self, icons: &[StatusIcon]) -> Option<BTreeSet<String>> {
        let titles: BTreeSet<String> = icons.iter().map(|icon| icon.title.clone()).collect();
        let mut statuses = self.statuses.write().unwrap_or_else(|p| p.into_inner());
        if *statuses == titles {
            return None;
        }
        *statuses = titles.clone();
        Some(titles)
    }

    /// Replace the alarm set, returning what was raised and what cleared.
    fn update_notifications(&self, current: Vec<Notification>) -> (Vec<Notification>, Vec<i64>) {
        let mut known = self.notifications.write().unwrap_or_else(|p| p.into_inner());
        let current: BTreeMap<i64, Notification> =
            current.into_iter().map(|n| (n.notification_id, n)).collect();
        let raised = current
            .values()
            .filter(|n| !known.contains_key(&n.notification_id))
            .cloned()
            .collect();
        let cleared = known
            .keys()
            .filter(|id| !current.contains_key(id))
            .copied()
            .collect();
        *known = current;
        (raised, cleared)
    }
}

struct RegistryInner {
    client: UplinkClient,
    scan_interval: Duration,
    control: ControlSettings,
    systems: BTreeMap<SystemId, Arc<SystemHandle>>,
    events: broadcast::Sender<RegistryEvent>,
    pollers: Mutex<Vec<JoinHandle<()>>>,
    controllers: Mutex<HashMap<(SystemId, u32), JoinHandle<()>>>,
}

/// Cheap to clone; clones share systems and tasks.
#[derive(Clone)]
pub struct SystemRegistry {
    inner: Arc<RegistryInner>,
}

impl SystemRegistry {
    /// Fetch every configured system, or discover the account's systems
    /// when none are configured.
    pub async fn load(client: UplinkClient, config: &UplinkConfig) -> Result<Self> {
        let mut loaded: Vec<(System, SystemConfig)> = Vec::new();

        if config.systems.is_empty() {
            let discovered = client.list_systems().await?;
            info!(count = discovered.len(), "no systems configured, using discovered systems");
            for system in discovered {
                let system_config = SystemConfig::new(system.system_id);
                loaded.push((system, system_config));
            }
        } else {
            let mut tasks = JoinSet::new();
            for system_config in config.systems.iter().cloned() {
                let client = client.clone();
                tasks.spawn(async move {
                    let system = client.fetch_system(system_config.system_id).await;
                    (system_config, system)
                });
            }
            while let Some(joined) = tasks.join_next().await {
                let (system_config, system) =
                    joined.map_err(|e| Error::Protocol(format!("system load task failed: {e}")))?;
                let system = system.inspect_err(|e| {
                    error!(system = %system_config.system_id, error = %e, "failed to load system");
                })?;
                loaded.push((system, system_config));
            }
        }

        if loaded.is_empty() {
            return Err(Error::NoSystems);
        }

        let systems = loaded
            .into_iter()
            .map(|(system, system_config)| {
                debug!(
                    system = %system.system_id,
                    name = %system.name,
                    write_access = system.capabilities.write_access,
                    "system registered"
                );
                let handle = SystemHandle {
                    cache: ParameterCache::new(client.clone(), &system),
                    system,
                    config: system_config,
                    statuses: RwLock::new(BTreeSet::new()),
                    notifications: RwLock::new(BTreeMap::new()),
                };
                (handle.system.system_id, Arc::new(handle))
            })
            .collect();

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(RegistryInner {
                client,
                scan_interval: config.scan_interval(),
                control: config.control.clone(),
                systems,
                events,
                pollers: Mutex::new(Vec::new()),
                controllers: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn client(&self) -> &UplinkClient {
        &self.inner.client
    }

    pub fn system(&self, system_id: SystemId) -> Option<Arc<SystemHandle>> {
        self.inner.systems.get(&system_id).cloned()
    }

    pub fn systems(&self) -> Vec<Arc<SystemHandle>> {
        self.inner.systems.values().cloned().collect()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    /// Refresh configured parameters, status icons and alarms of one system.
    /// The three reads are queued together; the first failure is returned
    /// after all of them have been applied.
    pub async fn poll_system(&self, system_id: SystemId) -> Result<()> {
        let handle = self.system(system_id).ok_or(Error::UnknownSystem(system_id))?;
        let parameter_ids: Vec<ParameterId> = handle.config.parameter_ids()?.into_iter().collect();
        let client = &self.inner.client;

        let statuses = async {
            if handle.config.statuses {
                client.fetch_status(system_id).await.map(Some)
            } else {
                Ok(None)
            }
        };
        let notifications = async {
            if handle.config.notifications {
                client.fetch_notifications(system_id).await.map(Some)
            } else {
                Ok(None)
            }
        };
        let (refreshed, statuses, notifications) =
            tokio::join!(handle.cache.refresh(&parameter_ids), statuses, notifications);

        let mut failure = refreshed.err();

        match statuses {
            Ok(Some(icons)) => {
                handle
                    .cache
                    .ingest(icons.iter().flat_map(|icon| icon.parameters.iter().cloned()));
                if let Some(statuses) = handle.update_statuses(&icons) {
                    self.emit(RegistryEvent::StatusesChanged { system_id, statuses });
                }
            }
            Ok(None) => {}
            Err(e) => failure = failure.or(Some(e)),
        }

        match notifications {
            Ok(Some(current)) => {
                let (raised, cleared) = handle.update_notifications(current);
                for notification in raised {
                    warn!(system = %system_id, title = %notification.title, "alarm raised");
                    self.emit(RegistryEvent::NotificationRaised { system_id, notification });
                }
                for notification_id in cleared {
                    info!(system = %system_id, notification_id, "alarm cleared");
                    self.emit(RegistryEvent::NotificationCleared { system_id, notification_id });
                }
            }
            Ok(None) => {}
            Err(e) => failure = failure.or(Some(e)),
        }

        match failure {
            None => Ok(()),
            Some(e) if e.is_revoked() => {
                error!(system = %system_id, error = %e, "authorization lost during poll");
                self.emit(RegistryEvent::AuthorizationRevoked);
                Err(Error::Auth(AuthError::Revoked))
            }
            Some(e) => {
                warn!(system = %system_id, error = %e, "poll failed");
                self.emit(RegistryEvent::PollFailed {
                    system_id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Poll every system concurrently. Returns the first failure.
    pub async fn poll_all(&self) -> Result<()> {
        let mut tasks = JoinSet::new();
        for &system_id in self.inner.systems.keys() {
            let registry = self.clone();
            tasks.spawn(async move { registry.poll_system(system_id).await });
        }
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| Error::Protocol(format!("poll task failed: {e}")))?;
            if let Err(e) = result {
                first_error = first_error.or(Some(e));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Start one poll loop per system and one controller per configured
    /// thermostat.
    pub fn start(&self, inputs: Arc<dyn InputProvider>, policy: Arc<dyn ControlPolicy>) {
        let mut pollers = self.inner.pollers.lock().unwrap_or_else(|p| p.into_inner());
        for &system_id in self.inner.systems.keys() {
            let registry = self.clone();
            let scan_interval = self.inner.scan_interval;
            pollers.push(tokio::spawn(async move {
                let mut ticker = interval(scan_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    // Failures are already logged and broadcast.
                    let _ = registry.poll_system(system_id).await;
                }
            }));
        }
        drop(pollers);

        for handle in self.inner.systems.values() {
            for (&external_id, thermostat) in &handle.config.thermostats {
                self.add_thermostat(handle.system.system_id, external_id, thermostat, inputs.clone(), policy.clone());
            }
        }
    }

    /// Start a controller, replacing any running one with the same id.
    pub fn add_thermostat(
        &self,
        system_id: SystemId,
        external_id: u32,
        config: &ThermostatConfig,
        inputs: Arc<dyn InputProvider>,
        policy: Arc<dyn ControlPolicy>,
    ) -> bool {
        let Some(handle) = self.system(system_id) else {
            warn!(system = %system_id, thermostat = external_id, "thermostat for unknown system ignored");
            return false;
        };
        let controller = ThermostatController::new(
            Thermostat::from_config(external_id, config),
            handle.cache.clone(),
            inputs,
            policy,
            self.inner.control.cooldown(),
        )
        .with_events(self.inner.events.clone());

        let task = tokio::spawn(controller.run(self.inner.control.tick()));
        let mut controllers = self.inner.controllers.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = controllers.insert((system_id, external_id), task) {
            previous.abort();
        }
        debug!(system = %system_id, thermostat = external_id, name = %config.name, "thermostat controller started");
        true
    }

    /// Tear down a controller whose configuration went away.
    pub fn remove_thermostat(&self, system_id: SystemId, external_id: u32) -> bool {
        let removed = self
            .inner
            .controllers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&(system_id, external_id));
        match removed {
            Some(task) => {
                task.abort();
                debug!(system = %system_id, thermostat = external_id, "thermostat controller stopped");
                true
            }
            None => false,
        }
    }

    pub fn running_thermostats(&self) -> usize {
        self.inner.controllers.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Stop poll loops and controllers. The client stays usable.
    pub fn shutdown(&self) {
        for task in self.inner.pollers.lock().unwrap_or_else(|p| p.into_inner()).drain(..) {
            task.abort();
        }
        for (_, task) in self.inner.controllers.lock().unwrap_or_else(|p| p.into_inner()).drain() {
            task.abort();
        }
        debug!("registry tasks stopped");
    }
}
