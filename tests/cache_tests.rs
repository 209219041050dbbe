mod common;

use std::time::Duration;

use common::*;
use nibe_uplink::*;
use serde_json::json;
use wiremock::matchers::{body_json, body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const HOT_WATER_BOOST: ParameterId = ParameterId(47011);
const OUTDOOR_TEMP: ParameterId = ParameterId(40004);

fn known(parameter_id: ParameterId, raw: &str) -> Parameter {
    Parameter {
        raw_value: Some(raw.into()),
        display_value: raw.into(),
        ..Parameter::unknown(parameter_id)
    }
}

async fn mount_parameters(server: &MockServer, raw: i64) {
    Mock::given(method("GET"))
        .and(path("/api/v1/systems/36563/parameters"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([parameter_json(40004, raw, "-3.7°C")])))
        .mount(server)
        .await;
}

#[tokio::test]
async fn quick_successive_writes_coalesce_into_one_put() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/systems/36563/parameters"))
        .and(body_json(json!({"settings": {"47011": "2"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(write_ack(47011)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(500))
        .with_priority(10)
        .expect(0)
        .mount(&server)
        .await;

    let cache = ParameterCache::new(client(&server, true, fast_config()), &system(true));
    cache.ingest([known(HOT_WATER_BOOST, "0")]);

    let first = cache.write(HOT_WATER_BOOST, "1");
    let second = cache.write(HOT_WATER_BOOST, "2");

    let visible = cache.read(HOT_WATER_BOOST).unwrap();
    assert_eq!(visible.raw_value.as_deref(), Some("2"));
    assert_eq!(visible.pending_write.as_ref().unwrap().target_value, "2");

    let first = first.await.unwrap();
    let second = second.await.unwrap();
    assert_eq!(first.value, "2");
    assert_eq!(second, first);
    assert_eq!(second.status, "DONE");

    let settled = cache.read(HOT_WATER_BOOST).unwrap();
    assert_eq!(settled.raw_value.as_deref(), Some("2"));
    assert!(settled.pending_write.is_none());
}

#[tokio::test]
async fn write_superseded_in_flight_is_followed_by_latest_value() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/systems/36563/parameters"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(write_ack(47011))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(2)
        .mount(&server)
        .await;

    let cache = ParameterCache::new(client(&server, true, fast_config()), &system(true));
    let first = cache.write(HOT_WATER_BOOST, "1");
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = cache.write(HOT_WATER_BOOST, "2");

    assert_eq!(first.await.unwrap().value, "2");
    assert_eq!(second.await.unwrap().value, "2");

    let bodies: Vec<serde_json::Value> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect();
    assert_eq!(bodies[0]["settings"]["47011"], "1");
    assert_eq!(bodies[1]["settings"]["47011"], "2");
}

#[tokio::test]
async fn write_carries_menu_id() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/systems/36563/parameters"))
        .and(body_string_contains("\"menuId\":\"2.2\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(write_ack(47011)))
        .expect(1)
        .mount(&server)
        .await;

    let cache = ParameterCache::new(client(&server, true, fast_config()), &system(true));
    cache
        .write_with_menu(HOT_WATER_BOOST, Some("2.2"), "1")
        .await
        .unwrap();
}

#[tokio::test]
async fn rejected_write_restores_confirmed_value() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({"message": "out of range"})))
        .expect(1)
        .mount(&server)
        .await;

    let cache = ParameterCache::new(client(&server, true, fast_config()), &system(true));
    cache.ingest([known(HOT_WATER_BOOST, "0")]);

    let err = cache.write(HOT_WATER_BOOST, "9").await.unwrap_err();
    assert!(matches!(err, Error::Validation(ValidationError::InvalidValue(_))), "got {err:?}");

    let parameter = cache.read(HOT_WATER_BOOST).unwrap();
    assert_eq!(parameter.raw_value.as_deref(), Some("0"));
    assert!(parameter.pending_write.is_none());
    assert!(cache.last_error(HOT_WATER_BOOST).is_some());
}

#[tokio::test]
async fn read_only_system_fails_locally() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = client(&server, false, fast_config());
    let cache = ParameterCache::new(client.clone(), &system(false));
    let err = cache.write(HOT_WATER_BOOST, "1").await.unwrap_err();
    assert!(matches!(err, Error::Validation(ValidationError::PermissionDenied(_))));
    assert_eq!(client.scheduler().dispatched(), 0);
}

#[tokio::test]
async fn abandoned_write_is_withdrawn_before_dispatch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/systems/36563"))
        .respond_with(ResponseTemplate::new(200).set_body_json(system_json(36563)))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let config = fast_config().with_rate_limit(1, Duration::from_secs(30));
    let client = client(&server, true, config);
    client.fetch_system(SYSTEM).await.unwrap();

    let cache = ParameterCache::new(client.clone(), &system(true));
    cache.ingest([known(HOT_WATER_BOOST, "0")]);
    let ticket = cache.write(HOT_WATER_BOOST, "1");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.scheduler().pending(), 1);

    drop(ticket);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(client.scheduler().pending(), 0);
    let parameter = cache.read(HOT_WATER_BOOST).unwrap();
    assert_eq!(parameter.raw_value.as_deref(), Some("0"));
    assert!(parameter.pending_write.is_none());
}

#[tokio::test]
async fn refresh_failure_keeps_previous_values() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/systems/36563/parameters"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([parameter_json(40004, -37, "-3.7°C")])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/systems/36563/parameters"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let cache = ParameterCache::new(client(&server, true, fast_config().with_max_attempts(2)), &system(true));
    cache.refresh(&[OUTDOOR_TEMP]).await.unwrap();
    let fetched = cache.read(OUTDOOR_TEMP).unwrap();
    assert_eq!(fetched.raw_value.as_deref(), Some("-37"));
    assert!(fetched.last_fetched_at.is_some());
    assert!(cache.last_error(OUTDOOR_TEMP).is_none());

    let err = cache.refresh(&[OUTDOOR_TEMP]).await.unwrap_err();
    assert!(matches!(err, Error::Network(NetworkError::Server { status: 500, .. })));
    assert_eq!(cache.read(OUTDOOR_TEMP).unwrap(), fetched);
    assert!(cache.last_error(OUTDOOR_TEMP).is_some());
}

#[tokio::test]
async fn failed_batch_does_not_discard_successful_ones() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/systems/36563/parameters"))
        .and(query_param("parameterIds", "40015"))
        .respond_with(ResponseTemplate::new(500))
        .with_priority(1)
        .mount(&server)
        .await;
    mount_parameters(&server, -37).await;

    let cache = ParameterCache::new(client(&server, true, fast_config().with_max_attempts(1)), &system(true));
    let ids: Vec<ParameterId> = (40000..40020).map(ParameterId).collect();
    let err = cache.refresh(&ids).await.unwrap_err();
    assert!(matches!(err, Error::Network(NetworkError::Server { status: 500, .. })), "got {err:?}");

    assert_eq!(cache.read(OUTDOOR_TEMP).unwrap().raw_value.as_deref(), Some("-37"));
    assert!(cache.last_error(OUTDOOR_TEMP).is_none());
    assert!(cache.last_error(ParameterId(40015)).is_some());
    assert!(cache.last_error(ParameterId(40019)).is_some());
    assert!(cache.last_error(ParameterId(40014)).is_none());
}

#[tokio::test]
async fn subscribers_are_notified_on_value_change() {
    let server = MockServer::start().await;
    mount_parameters(&server, -37).await;

    let cache = ParameterCache::new(client(&server, true, fast_config()), &system(true));
    let mut updates = cache.subscribe(OUTDOOR_TEMP);
    assert!(updates.borrow().is_none());

    cache.refresh(&[OUTDOOR_TEMP]).await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), updates.changed())
        .await
        .expect("subscriber should be notified")
        .unwrap();
    assert_eq!(
        updates.borrow_and_update().as_ref().unwrap().raw_value.as_deref(),
        Some("-37")
    );

    // Same value again: no notification.
    cache.refresh(&[OUTDOOR_TEMP]).await.unwrap();
    assert!(!updates.has_changed().unwrap());
}

#[tokio::test]
async fn revocation_leaves_entries_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = client_with_token(&server, token_expiring_in(5), true, fast_config());
    let cache = ParameterCache::new(client, &system(true));
    cache.ingest([known(OUTDOOR_TEMP, "-37"), known(HOT_WATER_BOOST, "0")]);
    let before = cache.snapshot();

    let err = cache.refresh(&[OUTDOOR_TEMP]).await.unwrap_err();
    assert!(err.is_revoked(), "got {err:?}");
    let err = cache.write(HOT_WATER_BOOST, "1").await.unwrap_err();
    assert!(err.is_revoked(), "got {err:?}");

    assert_eq!(cache.snapshot(), before);
}
