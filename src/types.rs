use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SystemId(pub u32);

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterId(pub u32);

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ParameterId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse()
            .map(ParameterId)
            .map_err(|_| Error::Config(format!("invalid parameter id: {s:?}")))
    }
}

/// Cache and subscription key. Parameter ids are only unique within a system.
pub type ParameterKey = (SystemId, ParameterId);

/// OAuth2 token pair as issued by the Uplink token endpoint.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub scope: String,
}

impl Token {
    /// True when the token expires within `margin` of `now` (or already has).
    pub fn expires_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        let margin = TimeDelta::from_std(margin).unwrap_or(TimeDelta::MAX);
        self.expires_at.signed_duration_since(now) <= margin
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub write_access: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct System {
    pub system_id: SystemId,
    pub name: String,
    pub product_name: String,
    pub security_level: Option<String>,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub parameter_id: ParameterId,
    pub target_value: String,
    pub attempt_count: u32,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub parameter_id: ParameterId,
    pub menu_id: Option<String>,
    pub name: String,
    pub title: String,
    pub designation: String,
    pub raw_value: Option<String>,
    pub display_value: String,
    pub unit: String,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub pending_write: Option<PendingWrite>,
}

impl Parameter {
    /// Placeholder for a parameter that has been written but never fetched.
    pub fn unknown(parameter_id: ParameterId) -> Self {
        Self {
            parameter_id,
            menu_id: None,
            name: String::new(),
            title: String::new(),
            designation: String::new(),
            raw_value: None,
            display_value: String::new(),
            unit: String::new(),
            last_fetched_at: None,
            pending_write: None,
        }
    }

    /// Switch-style reading: raw "1" is on, anything else off.
    pub fn is_on(&self) -> Option<bool> {
        self.raw_value.as_deref().map(|v| v == "1")
    }

    pub fn numeric(&self) -> Option<f64> {
        self.raw_value.as_deref().and_then(|v| v.parse().ok())
    }

    /// How long ago the value was fetched, if it ever was.
    pub fn age(&self, now: DateTime<Utc>) -> Option<TimeDelta> {
        self.last_fetched_at.map(|at| now.signed_duration_since(at))
    }
}

/// Remote acknowledgement of a parameter write. Acceptance only: the new value
/// shows up in reads once the heat pump has applied it.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteAck {
    pub parameter_id: ParameterId,
    pub value: String,
    pub status: String,
}

pub type WriteOutcome = crate::Result<WriteAck>;

#[derive(Debug, Clone, PartialEq)]
pub struct StatusIcon {
    pub title: String,
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub notification_id: i64,
    pub title: String,
    pub description: String,
}
