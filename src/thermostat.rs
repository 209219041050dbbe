use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, trace, warn};

use crate::cache::ParameterCache;
use crate::config::ThermostatConfig;
use crate::registry::RegistryEvent;
use crate::types::ParameterId;

/// Resolves an external source reference (an entity id on the host
/// platform) to its current numeric reading.
pub trait InputProvider: Send + Sync {
    fn read(&self, source: &str) -> Option<f64>;
}

impl<F> InputProvider for F
where
    F: Fn(&str) -> Option<f64> + Send + Sync,
{
    fn read(&self, source: &str) -> Option<f64> {
        self(source)
    }
}

/// Readings pushed in by the host, e.g. from state-change callbacks.
#[derive(Debug, Default)]
pub struct SharedInputs {
    values: Mutex<HashMap<String, f64>>,
}

impl SharedInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, source: impl Into<String>, value: f64) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(source.into(), value);
        }
    }

    pub fn clear(&self, source: &str) {
        if let Ok(mut values) = self.values.lock() {
            values.remove(source);
        }
    }
}

impl InputProvider for SharedInputs {
    fn read(&self, source: &str) -> Option<f64> {
        self.values.lock().ok()?.get(source).copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThermostatSample {
    pub current_temperature: f64,
    pub valve_position: Option<f64>,
    pub sampled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterTarget {
    pub parameter_id: ParameterId,
    pub menu_id: Option<String>,
    pub value: String,
}

/// Maps a sample onto the parameters to write for one climate system.
pub trait ControlPolicy: Send + Sync {
    fn targets(&self, sample: &ThermostatSample, climate_system: u8) -> Vec<ParameterTarget>;
}

impl<F> ControlPolicy for F
where
    F: Fn(&ThermostatSample, u8) -> Vec<ParameterTarget> + Send + Sync,
{
    fn targets(&self, sample: &ThermostatSample, climate_system: u8) -> Vec<ParameterTarget> {
        self(sample, climate_system)
    }
}

/// Holds one setpoint regardless of the readings.
#[derive(Debug, Clone)]
pub struct FixedSetpoint {
    setpoint: f64,
    parameters: HashMap<u8, (ParameterId, Option<String>)>,
}

impl FixedSetpoint {
    pub fn new(setpoint: f64) -> Self {
        Self {
            setpoint,
            parameters: HashMap::new(),
        }
    }

    /// Parameter receiving the setpoint for `climate_system`.
    pub fn parameter(mut self, climate_system: u8, parameter_id: ParameterId, menu_id: Option<&str>) -> Self {
        self.parameters
            .insert(climate_system, (parameter_id, menu_id.map(str::to_string)));
        self
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }
}

impl ControlPolicy for FixedSetpoint {
    fn targets(&self, _sample: &ThermostatSample, climate_system: u8) -> Vec<ParameterTarget> {
        match self.parameters.get(&climate_system) {
            Some((parameter_id, menu_id)) => vec![ParameterTarget {
                parameter_id: *parameter_id,
                menu_id: menu_id.clone(),
                value: format!("{}", self.setpoint),
            }],
            None => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thermostat {
    pub external_id: u32,
    pub name: String,
    pub climate_systems: BTreeSet<u8>,
    pub current_temperature: Option<String>,
    pub valve_position: Option<String>,
}

impl Thermostat {
    pub fn from_config(external_id: u32, config: &ThermostatConfig) -> Self {
        Self {
            external_id,
            name: config.name.clone(),
            climate_systems: config.climate_systems.clone(),
            current_temperature: config.current_temperature.clone(),
            valve_position: config.valve_position.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Sampling,
    Submitting,
    Cooldown { until: Instant },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    CoolingDown { remaining: Duration },
    MissingInput,
    /// The policy asked for nothing this tick.
    NoTargets,
    Submitted { writes: usize, failures: usize },
}

pub struct ThermostatController {
    thermostat: Thermostat,
    cache: ParameterCache,
    inputs: Arc<dyn InputProvider>,
    policy: Arc<dyn ControlPolicy>,
    cooldown: Duration,
    state: ControllerState,
    missing_inputs: u64,
    events: Option<broadcast::Sender<RegistryEvent>>,
}

impl ThermostatController {
    pub fn new(
        thermostat: Thermostat,
        cache: ParameterCache,
        inputs: Arc<dyn InputProvider>,
        policy: Arc<dyn ControlPolicy>,
        cooldown: Duration,
    ) -> Self {
        Self {
            thermostat,
            cache,
            inputs,
            policy,
            cooldown,
            state: ControllerState::Idle,
            missing_inputs: 0,
            events: None,
        }
    }

    pub(crate) fn with_events(mut self, events: broadcast::Sender<RegistryEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn thermostat(&self) -> &Thermostat {
        &self.thermostat
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Ticks that found an input unavailable.
    pub fn missing_inputs(&self) -> u64 {
        self.missing_inputs
    }

    fn sample(&self) -> Option<ThermostatSample> {
        let source = self.thermostat.current_temperature.as_deref()?;
        let current_temperature = self.inputs.read(source).filter(|t| t.is_finite())?;
        // Valve position is advisory; an unavailable reading is passed on as None.
        let valve_position = self
            .thermostat
            .valve_position
            .as_deref()
            .and_then(|source| self.inputs.read(source))
            .filter(|v| v.is_finite());
        Some(ThermostatSample {
            current_temperature,
            valve_position,
            sampled_at: Utc::now(),
        })
    }

    /// One pass of the state machine.
    pub async fn tick(&mut self) -> TickOutcome {
        let now = Instant::now();
        if let ControllerState::Cooldown { until } = self.state {
            if now < until {
                let remaining = until - now;
                trace!(thermostat = self.thermostat.external_id, ?remaining, "cooling down");
                return TickOutcome::CoolingDown { remaining };
            }
            self.state = ControllerState::Idle;
        }

        self.state = ControllerState::Sampling;
        let Some(sample) = self.sample() else {
            self.missing_inputs += 1;
            warn!(
                thermostat = self.thermostat.external_id,
                name = %self.thermostat.name,
                source = ?self.thermostat.current_temperature,
                "thermostat input unavailable, skipping tick"
            );
            if let Some(events) = &self.events {
                let _ = events.send(RegistryEvent::MissingInput {
                    system_id: self.cache.system_id(),
                    thermostat: self.thermostat.external_id,
                });
            }
            self.state = ControllerState::Idle;
            return TickOutcome::MissingInput;
        };

        self.state = ControllerState::Submitting;
        let targets: Vec<ParameterTarget> = self
            .thermostat
            .climate_systems
            .iter()
            .flat_map(|&climate_system| self.policy.targets(&sample, climate_system))
            .collect();
        if targets.is_empty() {
            debug!(thermostat = self.thermostat.external_id, "policy produced no targets");
            self.state = ControllerState::Idle;
            return TickOutcome::NoTargets;
        }

        let submitted_at = Instant::now();
        let tickets: Vec<_> = targets
            .into_iter()
            .map(|target| {
                let ticket = self
                    .cache
                    .write_with_menu(target.parameter_id, target.menu_id.as_deref(), target.value.clone());
                (target, ticket)
            })
            .collect();
        let writes = tickets.len();
        let mut failures = 0;
        for (target, ticket) in tickets {
            if let Err(e) = ticket.await {
                failures += 1;
                warn!(
                    thermostat = self.thermostat.external_id,
                    parameter = %target.parameter_id,
                    value = %target.value,
                    error = %e,
                    "thermostat write failed"
                );
            }
        }

        info!(
            thermostat = self.thermostat.external_id,
            temperature = sample.current_temperature,
            writes,
            failures,
            "thermostat submission complete"
        );
        self.state = ControllerState::Cooldown {
            until: submitted_at + self.cooldown,
        };
        TickOutcome::Submitted { writes, failures }
    }

    /// Tick forever. The registry aborts the task when the thermostat is removed.
    pub async fn run(mut self, tick: Duration) {
        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }
}
