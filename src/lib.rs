mod budget;
mod cache;
mod client;
pub mod config;
pub mod error;
mod logger;
pub mod protocol;
mod registry;
mod scheduler;
mod thermostat;
mod token;
mod types;

pub use budget::RateBudget;
pub use cache::{ParameterCache, WriteTicket};
pub use client::{UplinkClient, UplinkClientBuilder};
pub use config::{ControlSettings, SchedulerSettings, SystemConfig, ThermostatConfig, UplinkConfig};
pub use error::{AuthError, Error, NetworkError, RateLimitError, Result, ValidationError};
pub use logger::MessageLogMode;
pub use protocol::Operation;
pub use registry::{RegistryEvent, SystemHandle, SystemRegistry};
pub use scheduler::{Priority, RateLimitedScheduler, SchedulerConfig, Ticket};
pub use thermostat::{
    ControlPolicy, ControllerState, FixedSetpoint, InputProvider, ParameterTarget, SharedInputs, Thermostat,
    ThermostatController, ThermostatSample, TickOutcome,
};
pub use token::{DEFAULT_SAFETY_MARGIN, MemoryTokenStore, OAuthCredentials, TokenManager, TokenManagerBuilder, TokenStore};
pub use types::*;
