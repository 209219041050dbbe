use chrono::{TimeDelta, Utc};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::types::*;
use crate::{Error, Result};

pub const DEFAULT_BASE_URL: &str = "https://api.nibeuplink.com";
pub const TOKEN_PATH: &str = "/oauth/token";
const API_PREFIX: &str = "/api/v1";

/// Uplink refuses parameter reads with more ids than this.
pub const MAX_PARAMETERS_PER_REQUEST: usize = 15;

pub const SCOPE_READ: &str = "READSYSTEM";
pub const SCOPE_WRITE: &str = "WRITESYSTEM";

pub fn scope(write_access: bool) -> String {
    if write_access {
        format!("{SCOPE_READ} {SCOPE_WRITE}")
    } else {
        SCOPE_READ.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    ListSystems,
    ReadSystem,
    ReadParameters,
    WriteParameter,
    ReadStatus,
    ReadNotifications,
}

/// One outbound API call, as queued by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    ListSystems,
    ReadSystem {
        system_id: SystemId,
    },
    ReadParameters {
        system_id: SystemId,
        parameter_ids: Vec<ParameterId>,
    },
    WriteParameter {
        system_id: SystemId,
        menu_id: Option<String>,
        parameter_id: ParameterId,
        value: String,
    },
    ReadStatus {
        system_id: SystemId,
    },
    ReadNotifications {
        system_id: SystemId,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::ListSystems => OperationKind::ListSystems,
            Operation::ReadSystem { .. } => OperationKind::ReadSystem,
            Operation::ReadParameters { .. } => OperationKind::ReadParameters,
            Operation::WriteParameter { .. } => OperationKind::WriteParameter,
            Operation::ReadStatus { .. } => OperationKind::ReadStatus,
            Operation::ReadNotifications { .. } => OperationKind::ReadNotifications,
        }
    }

    pub fn system_id(&self) -> Option<SystemId> {
        match self {
            Operation::ListSystems => None,
            Operation::ReadSystem { system_id }
            | Operation::ReadParameters { system_id, .. }
            | Operation::WriteParameter { system_id, .. }
            | Operation::ReadStatus { system_id }
            | Operation::ReadNotifications { system_id } => Some(*system_id),
        }
    }

    /// Key that serializes writes to the same parameter.
    pub fn write_key(&self) -> Option<ParameterKey> {
        match self {
            Operation::WriteParameter {
                system_id,
                parameter_id,
                ..
            } => Some((*system_id, *parameter_id)),
            _ => None,
        }
    }

    pub(crate) fn method(&self) -> Method {
        match self {
            Operation::WriteParameter { .. } => Method::PUT,
            _ => Method::GET,
        }
    }

    pub(crate) fn path(&self) -> String {
        match self {
            Operation::ListSystems => format!("{API_PREFIX}/systems"),
            Operation::ReadSystem { system_id } => format!("{API_PREFIX}/systems/{system_id}"),
            Operation::ReadParameters { system_id, .. } | Operation::WriteParameter { system_id, .. } => {
                format!("{API_PREFIX}/systems/{system_id}/parameters")
            }
            Operation::ReadStatus { system_id } => {
                format!("{API_PREFIX}/systems/{system_id}/status/system")
            }
            Operation::ReadNotifications { system_id } => {
                format!("{API_PREFIX}/systems/{system_id}/notifications")
            }
        }
    }

    pub(crate) fn query(&self) -> Vec<(&'static str, String)> {
        match self {
            Operation::ReadParameters { parameter_ids, .. } => parameter_ids
                .iter()
                .map(|id| ("parameterIds", id.to_string()))
                .collect(),
            Operation::ReadNotifications { .. } => vec![
                ("active", "True".to_string()),
                ("notificationType", "ALARM".to_string()),
            ],
            _ => Vec::new(),
        }
    }

    pub(crate) fn body(&self) -> Option<Value> {
        match self {
            Operation::WriteParameter {
                menu_id,
                parameter_id,
                value,
                ..
            } => Some(write_parameter_body(menu_id.as_deref(), *parameter_id, value)),
            _ => None,
        }
    }
}

pub fn write_parameter_body(menu_id: Option<&str>, parameter_id: ParameterId, value: &str) -> Value {
    let mut settings = Map::new();
    settings.insert(parameter_id.to_string(), Value::String(value.to_string()));
    let mut body = json!({ "settings": settings });
    if let Some(menu) = menu_id {
        body["menuId"] = Value::String(menu.to_string());
    }
    body
}

/// Token endpoint response. `refresh_token` may be omitted on refresh, in
/// which case the previous one stays valid.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    pub(crate) fn into_token(self, previous_refresh: Option<&str>, requested_scope: &str) -> Result<Token> {
        let refresh_token = self
            .refresh_token
            .or_else(|| previous_refresh.map(str::to_string))
            .ok_or_else(|| Error::Protocol("token response without refresh_token".into()))?;
        let expires_at = TimeDelta::try_seconds(self.expires_in)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| Error::Protocol(format!("token lifetime out of range: {}s", self.expires_in)))?;
        Ok(Token {
            access_token: self.access_token,
            refresh_token,
            expires_at,
            scope: self.scope.unwrap_or_else(|| requested_scope.to_string()),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SystemRecord {
    system_id: u32,
    #[serde(default)]
    name: String,
    #[serde(default)]
    product_name: String,
    #[serde(default)]
    security_level: Option<String>,
}

impl SystemRecord {
    fn into_system(self) -> System {
        System {
            system_id: SystemId(self.system_id),
            name: self.name,
            product_name: self.product_name,
            security_level: self.security_level,
            capabilities: Capabilities::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParameterRecord {
    parameter_id: u32,
    #[serde(default)]
    name: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    designation: String,
    #[serde(default)]
    unit: String,
    #[serde(default)]
    display_value: String,
    #[serde(default)]
    raw_value: Value,
}

impl ParameterRecord {
    fn into_parameter(self) -> Parameter {
        let fetched_at = Utc::now();
        Parameter {
            parameter_id: ParameterId(self.parameter_id),
            menu_id: None,
            name: self.name,
            title: self.title,
            designation: self.designation,
            raw_value: raw_value_string(&self.raw_value),
            display_value: self.display_value,
            unit: self.unit,
            last_fetched_at: Some(fetched_at),
            pending_write: None,
        }
    }
}

fn raw_value_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct StatusRecord {
    #[serde(default)]
    title: String,
    #[serde(default)]
    parameters: Vec<ParameterRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationRecord {
    notification_id: i64,
    #[serde(default)]
    info: NotificationInfo,
}

#[derive(Debug, Default, Deserialize)]
struct NotificationInfo {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
}

/// List endpoints wrap their results in `{"objects": [...]}`; some deployments
/// return the bare array.
fn objects(body: &Value) -> Result<&Vec<Value>> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(map) => match map.get("objects") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(Error::Protocol("expected an `objects` array".into())),
        },
        _ => Err(Error::Protocol(format!("expected a list, got {body}"))),
    }
}

pub fn parse_system(body: &Value) -> Result<System> {
    let record: SystemRecord = serde_json::from_value(body.clone())?;
    Ok(record.into_system())
}

pub fn parse_systems(body: &Value) -> Result<Vec<System>> {
    objects(body)?
        .iter()
        .map(parse_system)
        .collect()
}

pub fn parse_parameters(body: &Value) -> Result<Vec<Parameter>> {
    let records: Vec<ParameterRecord> = serde_json::from_value(body.clone())?;
    Ok(records.into_iter().map(ParameterRecord::into_parameter).collect())
}

pub fn parse_status(body: &Value) -> Result<Vec<StatusIcon>> {
    let records: Vec<StatusRecord> = serde_json::from_value(body.clone())?;
    Ok(records
        .into_iter()
        .map(|r| StatusIcon {
            title: r.title,
            parameters: r
                .parameters
                .into_iter()
                .map(ParameterRecord::into_parameter)
                .collect(),
        })
        .collect())
}

pub fn parse_notifications(body: &Value) -> Result<Vec<Notification>> {
    objects(body)?
        .iter()
        .map(|item| {
            let record: NotificationRecord = serde_json::from_value(item.clone())?;
            Ok(Notification {
                notification_id: record.notification_id,
                title: record.info.title,
                description: record.info.description,
            })
        })
        .collect()
}

/// PUT answers with `[{"parameter": {...}, "status": "DONE"}]`. An empty body
/// still means the write was accepted.
pub fn parse_write_ack(parameter_id: ParameterId, value: &str, body: &Value) -> Result<WriteAck> {
    let status = match body {
        Value::Null => "ACCEPTED".to_string(),
        Value::Array(items) => items
            .iter()
            .find(|item| {
                item.pointer("/parameter/parameterId").and_then(|v| v.as_u64())
                    == Some(parameter_id.0 as u64)
            })
            .or_else(|| items.first())
            .and_then(|item| item.get("status"))
            .and_then(|v| v.as_str())
            .unwrap_or("ACCEPTED")
            .to_string(),
        Value::Object(map) => map
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("ACCEPTED")
            .to_string(),
        other => return Err(Error::Protocol(format!("unexpected write response: {other}"))),
    };
    Ok(WriteAck {
        parameter_id,
        value: value.to_string(),
        status,
    })
}

/// Human readable message from an error body, falling back to the raw text.
pub fn error_message(body: &Value) -> String {
    match body {
        Value::Object(map) => map
            .get("message")
            .or_else(|| map.get("error_description"))
            .or_else(|| map.get("error"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string()),
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
