// Integration tests for `Clip2Client` using wiremock.

use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use clip2_api::events::{EventStreamHandle, ReconnectConfig};
use clip2_api::transport::TransportConfig;
use clip2_api::types::{EventKind, Resource, ResourceReference, ResourceType};
use clip2_api::{APPLICATION_ID, Clip2Client};

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup() -> (MockServer, Clip2Client) {
    let server = MockServer::start().await;
    let client = Clip2Client::with_base_url(
        &server.uri(),
        SecretString::from("test-app-key"),
        &TransportConfig::default(),
    )
    .unwrap();
    (server, client)
}

// ── Resource GET/PUT ────────────────────────────────────────────────

#[tokio::test]
async fn test_get_resource_collection() {
    let (server, client) = setup().await;

    let body = json!({
        "errors": [],
        "data": [
            { "id": "scene-1", "type": "scene", "status": { "active": "inactive" } },
            { "id": "scene-2", "type": "scene", "status": { "active": "static" } },
        ]
    });

    Mock::given(method("GET"))
        .and(path("/clip/v2/resource/scene"))
        .and(header("hue-application-key", "test-app-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&body))
        .mount(&server)
        .await;

    let scenes = client
        .get_resources(&ResourceReference::all(ResourceType::Scene))
        .await
        .unwrap();

    assert_eq!(scenes.len(), 2);
    assert_eq!(scenes[0].id, "scene-1");
    assert_eq!(scenes[0].scene_active(), Some(false));
    assert_eq!(scenes[1].scene_active(), Some(true));
    assert!(scenes[0].has_full_state());
}

#[tokio::test]
async fn test_get_single_resource() {
    let (server, client) = setup().await;

    let body = json!({
        "errors": [],
        "data": [{
            "id": "gl-1",
            "type": "grouped_light",
            "on": { "on": true },
            "dimming": { "brightness": 55.0 }
        }]
    });

    Mock::given(method("GET"))
        .and(path("/clip/v2/resource/grouped_light/gl-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&body))
        .mount(&server)
        .await;

    let resources = client
        .get_resources(&ResourceReference::one("gl-1", ResourceType::GroupedLight))
        .await
        .unwrap();

    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].dimming.map(|d| d.brightness), Some(55.0));
}

#[tokio::test]
async fn test_put_resource_sends_present_fields_only() {
    let (server, client) = setup().await;

    Mock::given(method("PUT"))
        .and(path("/clip/v2/resource/light/light-1"))
        .and(header("hue-application-key", "test-app-key"))
        .and(body_partial_json(json!({ "on": { "on": false } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": [{ "description": "brightness out of range" }],
            "data": [{ "id": "light-1", "type": "light" }]
        })))
        .mount(&server)
        .await;

    let mut command = Resource::new("light-1", ResourceType::Light);
    command.on = Some(clip2_api::types::OnState { on: false });

    // per-field rejections are warnings, not errors
    let response = client.put_resource(&command).await.unwrap();
    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.data[0].id, "light-1");
}

#[tokio::test]
async fn test_forbidden_maps_to_unauthorized() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/clip/v2/resource/device"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let err = client
        .get_resources(&ResourceReference::all(ResourceType::Device))
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());
}

#[tokio::test]
async fn test_server_error_carries_bridge_description() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/clip/v2/resource/room"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({
            "errors": [{ "description": "bridge busy" }],
            "data": []
        })))
        .mount(&server)
        .await;

    let err = client
        .get_resources(&ResourceReference::all(ResourceType::Room))
        .await
        .unwrap_err();
    match err {
        clip2_api::Error::Api { message, status } => {
            assert_eq!(status, 503);
            assert_eq!(message, "bridge busy");
        }
        other => panic!("expected Api error, got {other:?}"),
    }
}

// ── Pairing ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_register_application_key_success() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api"))
        .and(body_partial_json(json!({
            "devicetype": APPLICATION_ID,
            "generateclientkey": true
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "success": { "username": "fresh-key", "clientkey": "0123" } }
        ])))
        .mount(&server)
        .await;

    let key = client.register_application_key(APPLICATION_ID).await.unwrap();
    assert_eq!(key.expose_secret(), "fresh-key");
}

#[tokio::test]
async fn test_register_application_key_link_button_not_pressed() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "error": { "type": 101, "address": "", "description": "link button not pressed" } }
        ])))
        .mount(&server)
        .await;

    let err = client
        .register_application_key(APPLICATION_ID)
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());
    assert!(err.to_string().contains("link button not pressed"));
}

// ── Firmware version check ──────────────────────────────────────────

#[tokio::test]
async fn test_clip2_supported_on_current_firmware() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/api/0/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "Hue Bridge",
            "swversion": "1955082050",
            "bridgeid": "ecb5fafffe000000"
        })))
        .mount(&server)
        .await;

    assert!(client.is_clip2_supported().await.unwrap());
}

#[tokio::test]
async fn test_clip2_unsupported_on_old_firmware() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/api/0/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "swversion": "1935074050"
        })))
        .mount(&server)
        .await;

    assert!(!client.is_clip2_supported().await.unwrap());
}

// ── Event stream ────────────────────────────────────────────────────

#[tokio::test]
async fn test_event_stream_delivers_batches_and_liveness() {
    let (server, client) = setup().await;

    let sse_body = concat!(
        ": hi\n\n",
        "id: 1:0\n",
        "data: [{\"type\":\"update\",\"data\":",
        "[{\"id\":\"light-1\",\"type\":\"light\",\"on\":{\"on\":true}}]}]\n\n",
    );

    Mock::given(method("GET"))
        .and(path("/eventstream/clip/v2"))
        .and(header("hue-application-key", "test-app-key"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"),
        )
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let handle = EventStreamHandle::spawn(
        &client,
        &TransportConfig::default(),
        ReconnectConfig::default(),
        cancel.clone(),
    )
    .unwrap();

    let mut events = handle.subscribe();
    let mut alive = handle.alive();

    alive.wait_for(|up| *up).await.unwrap();

    let batch = events.recv().await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].kind, EventKind::Update);
    assert_eq!(batch[0].data[0].id, "light-1");
    assert!(!batch[0].data[0].has_full_state());

    handle.shutdown();
}
