use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::protocol;
use crate::scheduler::SchedulerConfig;
use crate::token::OAuthCredentials;
use crate::types::{ParameterId, SystemId};
use crate::{Error, Result};

pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_CONTROL_TICK_SECS: u64 = 60;
pub const DEFAULT_CONTROL_COOLDOWN_SECS: u64 = 300;

pub const ENV_CLIENT_ID: &str = "NIBE_UPLINK_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "NIBE_UPLINK_CLIENT_SECRET";

#[derive(Debug, Clone, Deserialize)]
pub struct UplinkConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    pub redirect_uri: String,
    #[serde(default, rename = "writeaccess", alias = "write_access")]
    pub write_access: bool,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    /// Empty means every system the account can see.
    #[serde(default)]
    pub systems: Vec<SystemConfig>,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub control: ControlSettings,
}

fn default_base_url() -> String {
    protocol::DEFAULT_BASE_URL.to_string()
}

fn default_scan_interval() -> u64 {
    DEFAULT_SCAN_INTERVAL_SECS
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    #[serde(rename = "system", alias = "system_id")]
    pub system_id: SystemId,
    #[serde(default)]
    pub sensors: BTreeSet<u32>,
    /// Parameter ids as strings, the way the Uplink API keys writable settings.
    #[serde(default)]
    pub switches: BTreeSet<String>,
    #[serde(default)]
    pub binary_sensors: BTreeSet<String>,
    #[serde(default)]
    pub thermostats: BTreeMap<u32, ThermostatConfig>,
    #[serde(default = "default_true")]
    pub statuses: bool,
    #[serde(default = "default_true")]
    pub notifications: bool,
}

fn default_true() -> bool {
    true
}

impl SystemConfig {
    /// Only the id set, everything else default.
    pub fn new(system_id: SystemId) -> Self {
        Self {
            system_id,
            sensors: BTreeSet::new(),
            switches: BTreeSet::new(),
            binary_sensors: BTreeSet::new(),
            thermostats: BTreeMap::new(),
            statuses: true,
            notifications: true,
        }
    }

    /// Every parameter this system polls: sensors, switches and binary sensors.
    pub fn parameter_ids(&self) -> Result<BTreeSet<ParameterId>> {
        let mut ids: BTreeSet<ParameterId> = self.sensors.iter().copied().map(ParameterId).collect();
        for id in self.switches.iter().chain(&self.binary_sensors) {
            ids.insert(id.parse()?);
        }
        Ok(ids)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ThermostatConfig {
    pub name: String,
    #[serde(default = "default_climate_systems")]
    pub climate_systems: BTreeSet<u8>,
    #[serde(default)]
    pub current_temperature: Option<String>,
    #[serde(default)]
    pub valve_position: Option<String>,
}

fn default_climate_systems() -> BTreeSet<u8> {
    BTreeSet::from([1])
}

/// Serde-facing scheduler settings; see [`SchedulerConfig`] for meanings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub window_limit: u32,
    pub window_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_factor: u32,
    pub backoff_cap_secs: u64,
    pub request_timeout_secs: u64,
    pub promote_after_secs: u64,
    pub default_retry_after_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        let config = SchedulerConfig::default();
        Self {
            window_limit: config.window_limit,
            window_secs: config.window_duration.as_secs(),
            max_attempts: config.max_attempts,
            backoff_base_ms: config.backoff_base.as_millis() as u64,
            backoff_factor: config.backoff_factor,
            backoff_cap_secs: config.backoff_cap.as_secs(),
            request_timeout_secs: config.request_timeout.as_secs(),
            promote_after_secs: config.promote_after.as_secs(),
            default_retry_after_secs: config.default_retry_after.as_secs(),
        }
    }
}

impl From<&SchedulerSettings> for SchedulerConfig {
    fn from(settings: &SchedulerSettings) -> Self {
        SchedulerConfig::default()
            .with_rate_limit(settings.window_limit, Duration::from_secs(settings.window_secs))
            .with_max_attempts(settings.max_attempts)
            .with_backoff(
                Duration::from_millis(settings.backoff_base_ms),
                settings.backoff_factor,
                Duration::from_secs(settings.backoff_cap_secs),
            )
            .with_request_timeout(Duration::from_secs(settings.request_timeout_secs))
            .with_promote_after(Duration::from_secs(settings.promote_after_secs))
            .with_default_retry_after(Duration::from_secs(settings.default_retry_after_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    pub tick_secs: u64,
    pub cooldown_secs: u64,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            tick_secs: DEFAULT_CONTROL_TICK_SECS,
            cooldown_secs: DEFAULT_CONTROL_COOLDOWN_SECS,
        }
    }
}

impl ControlSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl UplinkConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let mut config: UplinkConfig = serde_json::from_str(text)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    fn apply_env(&mut self) {
        if let Ok(id) = std::env::var(ENV_CLIENT_ID)
            && !id.trim().is_empty()
        {
            self.client_id = id.trim().to_string();
        }
        if let Ok(secret) = std::env::var(ENV_CLIENT_SECRET)
            && !secret.trim().is_empty()
        {
            self.client_secret = secret.trim().to_string();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(Error::Config(format!(
                "missing client credentials: set client_id/client_secret or {ENV_CLIENT_ID}/{ENV_CLIENT_SECRET}"
            )));
        }
        if self.scan_interval_secs == 0 {
            return Err(Error::Config("scan_interval_secs must be > 0".into()));
        }
        if self.scheduler.window_limit == 0 || self.scheduler.window_secs == 0 {
            return Err(Error::Config("scheduler window must admit at least one request".into()));
        }
        if self.scheduler.max_attempts == 0 {
            return Err(Error::Config("scheduler.max_attempts must be > 0".into()));
        }
        if self.control.tick_secs == 0 {
            return Err(Error::Config("control.tick_secs must be > 0".into()));
        }

        let mut seen = BTreeSet::new();
        for system in &self.systems {
            if !seen.insert(system.system_id) {
                return Err(Error::Config(format!("system {} configured twice", system.system_id)));
            }
            system.parameter_ids()?;
            for (id, thermostat) in &system.thermostats {
                if thermostat.climate_systems.is_empty() {
                    return Err(Error::Config(format!(
                        "thermostat {id} of system {} has no climate systems",
                        system.system_id
                    )));
                }
                if thermostat.climate_systems.iter().any(|&c| c == 0) {
                    return Err(Error::Config(format!("thermostat {id}: climate systems are numbered from 1")));
                }
            }
        }
        Ok(())
    }

    pub fn credentials(&self) -> OAuthCredentials {
        OAuthCredentials::new(
            self.client_id.clone(),
            self.client_secret.clone(),
            self.redirect_uri.clone(),
            self.write_access,
        )
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::from(&self.scheduler)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn system(&self, system_id: SystemId) -> Option<&SystemConfig> {
        self.systems.iter().find(|s| s.system_id == system_id)
    }
}
