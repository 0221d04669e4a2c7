// End-to-end session tests against a wiremock bridge.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use clip2_api::Clip2Client;
use clip2_api::transport::TransportConfig;
use clip2_api::types::ResourceType;
use clip2_core::channel::{CHANNEL_BRIGHTNESS, CHANNEL_SWITCH};
use clip2_core::{
    BridgeConfig, BridgeHandler, BridgeHost, ChannelValue, Command, CoreError, SessionState,
    StatusDetail, ThingConfig, ThingHandler, ThingHost, ThingStatus,
};

// ── Recording hosts ─────────────────────────────────────────────────

#[derive(Default)]
struct RecordingBridgeHost {
    statuses: Mutex<Vec<(ThingStatus, StatusDetail)>>,
    stored_keys: Mutex<Vec<String>>,
}

impl BridgeHost for RecordingBridgeHost {
    fn set_status(&self, status: ThingStatus, detail: StatusDetail, _message: Option<String>) {
        self.statuses.lock().unwrap().push((status, detail));
    }

    fn store_application_key(&self, key: &SecretString) -> Result<(), CoreError> {
        self.stored_keys
            .lock()
            .unwrap()
            .push(key.expose_secret().to_owned());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingThingHost {
    updates: Mutex<Vec<(String, ChannelValue)>>,
    statuses: Mutex<Vec<(ThingStatus, StatusDetail)>>,
    properties: Mutex<Vec<HashMap<String, String>>>,
    legacy_links: Mutex<Vec<Vec<&'static str>>>,
    scene_options: Mutex<Vec<Vec<String>>>,
}

impl ThingHost for RecordingThingHost {
    fn update_channel(&self, channel: &str, value: ChannelValue) {
        self.updates
            .lock()
            .unwrap()
            .push((channel.to_owned(), value));
    }

    fn set_status(&self, status: ThingStatus, detail: StatusDetail, _message: Option<String>) {
        self.statuses.lock().unwrap().push((status, detail));
    }

    fn channels_changed(&self, _channels: &[&'static str]) {}

    fn update_properties(&self, properties: &HashMap<String, String>) {
        self.properties.lock().unwrap().push(properties.clone());
    }

    fn replicate_legacy_links(&self, channels: &[&'static str]) {
        self.legacy_links.lock().unwrap().push(channels.to_vec());
    }

    fn set_scene_options(&self, names: &[String]) {
        self.scene_options.lock().unwrap().push(names.to_vec());
    }
}

// ── Mock bridge ─────────────────────────────────────────────────────

async fn mount_bridge(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/0/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "swversion": "1955082050",
            "bridgeid": "ecb5fafffe000000"
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/clip/v2/resource/bridge"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": [],
            "data": [{
                "id": "bridge-1",
                "type": "bridge",
                "bridge_id": "ecb5fafffe000000",
                "metadata": { "name": "Test Bridge" }
            }]
        })))
        .mount(server)
        .await;

    // a keep-alive comment keeps the SSE response shaped like the real
    // bridge; the connection still closes, which exercises reconnect
    Mock::given(method("GET"))
        .and(path("/eventstream/clip/v2"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(": hi\n\n", "text/event-stream"))
        .mount(server)
        .await;

    for rtype in ["smart_scene", "room", "zone", "bridge_home"] {
        mount_collection(server, rtype, json!([])).await;
    }
}

async fn mount_collection(server: &MockServer, rtype: &str, data: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(format!("/clip/v2/resource/{rtype}")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "errors": [], "data": data })),
        )
        .mount(server)
        .await;
}

fn config_for(server: &MockServer, key: Option<&str>) -> BridgeConfig {
    let mut config = BridgeConfig::new(server.uri());
    config.application_key = key.map(SecretString::from);
    config.check_minutes = 5;
    config
}

fn api_client(server: &MockServer) -> Clip2Client {
    Clip2Client::with_base_url(
        &server.uri(),
        SecretString::from("test-key"),
        &TransportConfig::default(),
    )
    .unwrap()
}

async fn count_requests(server: &MockServer, wanted: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == wanted)
        .count()
}

async fn wait_for_state(
    session: &BridgeHandler,
    wanted: SessionState,
) -> Result<(), tokio::time::error::Elapsed> {
    let mut state = session.session_state();
    tokio::time::timeout(Duration::from_secs(10), state.wait_for(|s| *s == wanted))
        .await
        .map(|_| ())
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn bootstrap_downloads_collections_in_dependency_order() {
    let server = MockServer::start().await;
    mount_bridge(&server).await;
    mount_collection(&server, "scene", json!([])).await;
    mount_collection(&server, "device", json!([])).await;

    let host = Arc::new(RecordingBridgeHost::default());
    let session = BridgeHandler::new(
        config_for(&server, Some("test-key")),
        Arc::clone(&host) as Arc<dyn BridgeHost>,
    );
    session.connect().await.unwrap();
    wait_for_state(&session, SessionState::Connected).await.unwrap();

    // wait until the final collection of the download was requested
    for _ in 0..100 {
        let done = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .any(|r| r.url.path() == "/clip/v2/resource/bridge_home");
        if done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let order: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.url.path().to_owned())
        .filter(|p| {
            [
                "/clip/v2/resource/scene",
                "/clip/v2/resource/device",
                "/clip/v2/resource/room",
                "/clip/v2/resource/zone",
            ]
            .contains(&p.as_str())
        })
        .collect();

    assert_eq!(
        order,
        vec![
            "/clip/v2/resource/scene",
            "/clip/v2/resource/device",
            "/clip/v2/resource/room",
            "/clip/v2/resource/zone",
        ]
    );

    session.dispose().await;
}

#[tokio::test]
async fn thing_comes_online_with_projected_state_and_commands_route() {
    let server = MockServer::start().await;
    mount_bridge(&server).await;
    mount_collection(&server, "scene", json!([])).await;
    mount_collection(
        &server,
        "device",
        json!([{
            "id": "device-1",
            "type": "device",
            "metadata": { "name": "Desk Lamp" },
            "product_data": { "model_id": "LCT012", "software_version": "1.104.2" },
            "services": [
                { "rid": "light-1", "rtype": "light" }
            ]
        }]),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/clip/v2/resource/device/device-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": [],
            "data": [{
                "id": "device-1",
                "type": "device",
                "metadata": { "name": "Desk Lamp" },
                "product_data": { "model_id": "LCT012", "software_version": "1.104.2" },
                "services": [ { "rid": "light-1", "rtype": "light" } ]
            }]
        })))
        .mount(&server)
        .await;
    mount_collection(
        &server,
        "light",
        json!([{
            "id": "light-1",
            "type": "light",
            "on": { "on": true },
            "dimming": { "brightness": 75.0 }
        }]),
    )
    .await;
    Mock::given(method("PUT"))
        .and(path("/clip/v2/resource/light/light-1"))
        .and(body_partial_json(json!({ "on": { "on": false } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": [],
            "data": [{ "id": "light-1", "type": "light" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let bridge_host = Arc::new(RecordingBridgeHost::default());
    let thing_host = Arc::new(RecordingThingHost::default());
    let session = BridgeHandler::new(
        config_for(&server, Some("test-key")),
        Arc::clone(&bridge_host) as Arc<dyn BridgeHost>,
    );

    let thing = ThingHandler::new(
        ThingConfig::new("device-1", ResourceType::Device),
        Arc::clone(&thing_host) as Arc<dyn ThingHost>,
    );
    session.register_thing(thing).await;

    session.connect().await.unwrap();
    wait_for_state(&session, SessionState::Connected).await.unwrap();

    // wait for the thing to come online
    for _ in 0..100 {
        let online = thing_host
            .statuses
            .lock()
            .unwrap()
            .iter()
            .any(|(s, _)| *s == ThingStatus::Online);
        if online {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let updates = thing_host.updates.lock().unwrap().clone();
    assert!(
        updates.contains(&(CHANNEL_SWITCH.to_owned(), ChannelValue::OnOff(true))),
        "light state not projected: {updates:?}"
    );
    assert!(updates.contains(&(CHANNEL_BRIGHTNESS.to_owned(), ChannelValue::Percent(75.0))));

    let properties = thing_host.properties.lock().unwrap();
    assert!(
        properties
            .iter()
            .any(|p| p.get("modelId").map(String::as_str) == Some("LCT012"))
    );
    drop(properties);

    session
        .handle_thing_command("device-1", CHANNEL_SWITCH, &Command::OnOff(false))
        .await
        .unwrap();

    session.dispose().await;
}

#[tokio::test]
async fn thing_missing_from_download_goes_gone() {
    let server = MockServer::start().await;
    mount_bridge(&server).await;
    mount_collection(&server, "scene", json!([])).await;
    mount_collection(&server, "device", json!([])).await;
    Mock::given(method("GET"))
        .and(path("/clip/v2/resource/device/device-gone"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "errors": [], "data": [] })),
        )
        .mount(&server)
        .await;

    let bridge_host = Arc::new(RecordingBridgeHost::default());
    let thing_host = Arc::new(RecordingThingHost::default());
    let session = BridgeHandler::new(
        config_for(&server, Some("test-key")),
        Arc::clone(&bridge_host) as Arc<dyn BridgeHost>,
    );
    session
        .register_thing(ThingHandler::new(
            ThingConfig::new("device-gone", ResourceType::Device),
            Arc::clone(&thing_host) as Arc<dyn ThingHost>,
        ))
        .await;

    session.connect().await.unwrap();
    wait_for_state(&session, SessionState::Connected).await.unwrap();

    for _ in 0..100 {
        let gone = thing_host
            .statuses
            .lock()
            .unwrap()
            .iter()
            .any(|(_, d)| *d == StatusDetail::Gone);
        if gone {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(
        thing_host
            .statuses
            .lock()
            .unwrap()
            .iter()
            .any(|(s, d)| *s == ThingStatus::Offline && *d == StatusDetail::Gone)
    );

    session.dispose().await;
}

// mocks for direct `ThingHandler` resolution tests: one device with one
// light service, a scene targeting it, and a legacy v1 id
async fn mount_lamp_device(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/clip/v2/resource/device/device-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": [],
            "data": [{
                "id": "device-1",
                "type": "device",
                "id_v1": "/lights/3",
                "metadata": { "name": "Desk Lamp" },
                "services": [ { "rid": "light-1", "rtype": "light" } ]
            }]
        })))
        .mount(server)
        .await;
    mount_collection(
        server,
        "scene",
        json!([{
            "id": "scene-relax",
            "type": "scene",
            "metadata": { "name": "Relax" },
            "group": { "rid": "device-1", "rtype": "device" }
        }]),
    )
    .await;
    mount_collection(server, "smart_scene", json!([])).await;
    mount_collection(
        server,
        "light",
        json!([{
            "id": "light-1",
            "type": "light",
            "on": { "on": true },
            "dimming": { "brightness": 75.0 }
        }]),
    )
    .await;
}

#[tokio::test]
async fn concurrent_dependency_resolution_collapses_into_one_pass() {
    let server = MockServer::start().await;
    mount_lamp_device(&server).await;

    let host = Arc::new(RecordingThingHost::default());
    let client = api_client(&server);
    let thing = ThingHandler::new(
        ThingConfig::new("device-1", ResourceType::Device),
        Arc::clone(&host) as Arc<dyn ThingHost>,
    );

    let (first, second) = tokio::join!(
        thing.update_dependencies(&client),
        thing.update_dependencies(&client),
    );
    first.unwrap();
    second.unwrap();
    // a later call is a no-op too
    thing.update_dependencies(&client).await.unwrap();

    assert_eq!(count_requests(&server, "/clip/v2/resource/device/device-1").await, 1);
    let online = host
        .statuses
        .lock()
        .unwrap()
        .iter()
        .filter(|(s, _)| *s == ThingStatus::Online)
        .count();
    assert_eq!(online, 1);
}

#[tokio::test]
async fn bootstrap_with_disconnected_device_does_not_end_online() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/clip/v2/resource/device/device-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": [],
            "data": [{
                "id": "device-2",
                "type": "device",
                "services": [ { "rid": "zb-1", "rtype": "zigbee_connectivity" } ]
            }]
        })))
        .mount(&server)
        .await;
    mount_collection(&server, "scene", json!([])).await;
    mount_collection(&server, "smart_scene", json!([])).await;
    mount_collection(
        &server,
        "zigbee_connectivity",
        json!([{
            "id": "zb-1",
            "type": "zigbee_connectivity",
            "status": "disconnected"
        }]),
    )
    .await;

    let host = Arc::new(RecordingThingHost::default());
    let thing = ThingHandler::new(
        ThingConfig::new("device-2", ResourceType::Device),
        Arc::clone(&host) as Arc<dyn ThingHost>,
    );
    thing.update_dependencies(&api_client(&server)).await.unwrap();

    let statuses = host.statuses.lock().unwrap();
    assert!(!statuses.iter().any(|(s, _)| *s == ThingStatus::Online));
    assert_eq!(
        statuses.last().copied(),
        Some((ThingStatus::Offline, StatusDetail::CommunicationError))
    );
}

#[tokio::test]
async fn legacy_links_replicate_once_and_scenes_become_options() {
    let server = MockServer::start().await;
    mount_lamp_device(&server).await;

    let host = Arc::new(RecordingThingHost::default());
    let client = api_client(&server);
    let mut config = ThingConfig::new("device-1", ResourceType::Device);
    config.legacy_id = Some("/lights/3".to_owned());
    let thing = ThingHandler::new(config, Arc::clone(&host) as Arc<dyn ThingHost>);

    thing.update_dependencies(&client).await.unwrap();

    {
        let links = host.legacy_links.lock().unwrap();
        assert_eq!(links.len(), 1);
        assert!(links[0].contains(&CHANNEL_SWITCH));
        let options = host.scene_options.lock().unwrap();
        assert_eq!(options.last().unwrap().as_slice(), ["Relax".to_owned()]);
    }

    // a refresh command re-fetches contributors but never replays the
    // one-shot link migration
    thing
        .handle_command(&client, CHANNEL_SWITCH, &Command::Refresh)
        .await
        .unwrap();

    assert_eq!(count_requests(&server, "/clip/v2/resource/device/device-1").await, 2);
    assert_eq!(host.legacy_links.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn pairing_retries_until_link_button_pressed_then_stores_key() {
    let server = MockServer::start().await;
    mount_bridge(&server).await;
    mount_collection(&server, "scene", json!([])).await;
    mount_collection(&server, "device", json!([])).await;

    // first attempt: link button not pressed; afterwards: success
    Mock::given(method("POST"))
        .and(path("/api"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "error": { "type": 101, "description": "link button not pressed" } }
        ])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "success": { "username": "fresh-key" } }
        ])))
        .mount(&server)
        .await;

    let host = Arc::new(RecordingBridgeHost::default());
    let session = BridgeHandler::new(
        config_for(&server, None),
        Arc::clone(&host) as Arc<dyn BridgeHost>,
    );
    session.connect().await.unwrap();

    wait_for_state(&session, SessionState::Connected).await.unwrap();

    assert_eq!(host.stored_keys.lock().unwrap().as_slice(), ["fresh-key"]);
    // the failed attempt pushed the session through the pairing state
    assert!(
        host.statuses
            .lock()
            .unwrap()
            .iter()
            .any(|(_, d)| *d == StatusDetail::PairingInProgress)
    );

    session.dispose().await;
}

struct ReadOnlyStoreHost {
    statuses: Mutex<Vec<(ThingStatus, StatusDetail)>>,
}

impl BridgeHost for ReadOnlyStoreHost {
    fn set_status(&self, status: ThingStatus, detail: StatusDetail, _message: Option<String>) {
        self.statuses.lock().unwrap().push((status, detail));
    }

    fn store_application_key(&self, _key: &SecretString) -> Result<(), CoreError> {
        Err(CoreError::ConfigReadOnly)
    }
}

#[tokio::test]
async fn unpersistable_application_key_is_reported_but_the_session_runs() {
    let server = MockServer::start().await;
    mount_bridge(&server).await;
    mount_collection(&server, "scene", json!([])).await;
    mount_collection(&server, "device", json!([])).await;
    Mock::given(method("POST"))
        .and(path("/api"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "success": { "username": "fresh-key" } }
        ])))
        .mount(&server)
        .await;

    let host = Arc::new(ReadOnlyStoreHost {
        statuses: Mutex::new(Vec::new()),
    });
    let session = BridgeHandler::new(
        config_for(&server, None),
        Arc::clone(&host) as Arc<dyn BridgeHost>,
    );
    session.connect().await.unwrap();

    // the key only lives in memory, but the session still comes up
    wait_for_state(&session, SessionState::Connected).await.unwrap();

    assert!(
        host.statuses
            .lock()
            .unwrap()
            .iter()
            .any(|(s, d)| *s == ThingStatus::Offline
                && *d == StatusDetail::ConfigurationError)
    );

    session.dispose().await;
}
