#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use nibe_uplink::*;
use serde_json::{Value, json};
use wiremock::MockServer;

pub const SYSTEM: SystemId = SystemId(36563);

pub fn credentials(write_access: bool) -> OAuthCredentials {
    OAuthCredentials::new("client", "secret", "http://localhost/callback", write_access)
}

pub fn token_expiring_in(secs: i64) -> Token {
    Token {
        access_token: "access-1".into(),
        refresh_token: "refresh-1".into(),
        expires_at: Utc::now() + TimeDelta::seconds(secs),
        scope: "READSYSTEM WRITESYSTEM".into(),
    }
}

/// Small backoffs and a roomy budget so tests run in milliseconds.
pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_rate_limit(100, Duration::from_secs(1))
        .with_backoff(Duration::from_millis(10), 2, Duration::from_millis(50))
        .with_request_timeout(Duration::from_secs(2))
}

pub fn client_with_token(server: &MockServer, token: Token, write_access: bool, config: SchedulerConfig) -> UplinkClient {
    UplinkClient::builder(credentials(write_access))
        .base_url(&server.uri())
        .token_store(Arc::new(MemoryTokenStore::with_token(token)))
        .scheduler_config(config)
        .build()
        .expect("client should build")
}

pub fn client(server: &MockServer, write_access: bool, config: SchedulerConfig) -> UplinkClient {
    client_with_token(server, token_expiring_in(3600), write_access, config)
}

pub fn system(write_access: bool) -> System {
    System {
        system_id: SYSTEM,
        name: "Home".into(),
        capabilities: Capabilities { write_access },
        ..System::default()
    }
}

pub fn token_body(access: &str, refresh: &str) -> Value {
    json!({
        "access_token": access,
        "refresh_token": refresh,
        "expires_in": 1800,
        "token_type": "bearer",
        "scope": "READSYSTEM WRITESYSTEM"
    })
}

pub fn parameter_json(id: u32, raw: i64, display: &str) -> Value {
    json!({
        "parameterId": id,
        "name": format!("{id}"),
        "title": format!("parameter {id}"),
        "designation": "",
        "unit": "°C",
        "displayValue": display,
        "rawValue": raw
    })
}

pub fn system_json(id: u32) -> Value {
    json!({
        "systemId": id,
        "name": "Home",
        "productName": "NIBE F750",
        "securityLevel": "ADMIN"
    })
}

pub fn write_ack(id: u32) -> Value {
    json!([{ "parameter": { "parameterId": id }, "status": "DONE" }])
}
