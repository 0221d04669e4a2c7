//! Bridge session: connection lifecycle, event fan-out, mass download.
//!
//! One [`BridgeHandler`] owns the connection to one bridge: the REST
//! client, the SSE event stream, the connection check schedule, and the
//! registry of thing handlers fed by the stream.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use secrecy::SecretString;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use clip2_api::events::{EventStreamHandle, ReconnectConfig};
use clip2_api::types::{Event, EventKind, Resource, ResourceReference, ResourceType};
use clip2_api::{APPLICATION_ID, Clip2Client};

use crate::command::Command;
use crate::config::BridgeConfig;
use crate::error::CoreError;
use crate::host::{BridgeHost, DiscoveryListener, StatusDetail, ThingStatus};
use crate::monitor::{CheckOutcome, ConnectionMonitor, SessionState};
use crate::thing::ThingHandler;

/// Resource types downloaded after (re)connecting, in dependency order:
/// scenes before the things that reference them, then owners before the
/// groups aggregating them. Smart scenes ride with scenes, the
/// bridge-home group with zones.
const DOWNLOAD_ORDER: [ResourceType; 6] = [
    ResourceType::Scene,
    ResourceType::SmartScene,
    ResourceType::Device,
    ResourceType::Room,
    ResourceType::Zone,
    ResourceType::BridgeHome,
];

/// Session handler for one bridge. Cheaply cloneable via `Arc`.
#[derive(Clone)]
pub struct BridgeHandler {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    config: BridgeConfig,
    host: Arc<dyn BridgeHost>,
    client: ArcSwapOption<Clip2Client>,
    application_key: std::sync::Mutex<Option<SecretString>>,
    monitor: std::sync::Mutex<ConnectionMonitor>,
    state_tx: watch::Sender<SessionState>,
    /// Last (status, detail) reported to the host, so per-tick state
    /// churn (pairing countdowns, degraded retries) reports only on
    /// actual transitions.
    last_report: std::sync::Mutex<Option<(ThingStatus, StatusDetail)>>,
    /// Registered things, keyed by their own resource id.
    things: DashMap<String, ThingHandler>,
    /// Event routing: resource id -> owning thing key. First claim wins.
    routing: DashMap<String, String>,
    discovery: std::sync::Mutex<Option<Arc<dyn DiscoveryListener>>>,
    event_handle: Mutex<Option<EventStreamHandle>>,
    /// Collapses overlapping mass download requests into one run.
    download_guard: Mutex<()>,
    check_notify: Notify,
    cancel: CancellationToken,
    /// Child token for the current connection; replaced on reconnect.
    cancel_child: std::sync::Mutex<CancellationToken>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Accepts a bare host name (standard https endpoints) or a full base
/// URL (proxies, mock servers).
fn build_client(config: &BridgeConfig, key: SecretString) -> Result<Clip2Client, CoreError> {
    let client = if config.host.contains("://") {
        Clip2Client::with_base_url(&config.host, key, &config.transport())?
    } else {
        Clip2Client::new(&config.host, key, &config.transport())?
    };
    Ok(client)
}

impl BridgeHandler {
    /// Create a session. Does NOT connect — call
    /// [`connect()`](Self::connect) to start the check schedule.
    pub fn new(config: BridgeConfig, host: Arc<dyn BridgeHost>) -> Self {
        let heartbeat = config.heartbeat();
        let application_key = config.application_key.clone();
        let (state_tx, _) = watch::channel(SessionState::Unpaired);
        let cancel = CancellationToken::new();
        let cancel_child = cancel.child_token();

        Self {
            inner: Arc::new(BridgeInner {
                config,
                host,
                client: ArcSwapOption::empty(),
                application_key: std::sync::Mutex::new(application_key),
                monitor: std::sync::Mutex::new(ConnectionMonitor::new(heartbeat)),
                state_tx,
                last_report: std::sync::Mutex::new(None),
                things: DashMap::new(),
                routing: DashMap::new(),
                discovery: std::sync::Mutex::new(None),
                event_handle: Mutex::new(None),
                download_guard: Mutex::new(()),
                check_notify: Notify::new(),
                cancel,
                cancel_child: std::sync::Mutex::new(cancel_child),
                task_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Subscribe to session state changes.
    pub fn session_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// The REST client, once connected.
    pub fn client(&self) -> Result<Arc<Clip2Client>, CoreError> {
        self.inner
            .client
            .load_full()
            .ok_or(CoreError::BridgeDisconnected)
    }

    pub fn set_discovery(&self, listener: Arc<dyn DiscoveryListener>) {
        *self
            .inner
            .discovery
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(listener);
    }

    // ── Connection lifecycle ─────────────────────────────────────────

    /// Build the client, verify CLIP v2 support, and start the check
    /// schedule. Pairing, the initial mass download, and the event
    /// stream are all driven by the checks.
    pub async fn connect(&self) -> Result<(), CoreError> {
        let key = self
            .inner
            .application_key
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| SecretString::from(""));
        let client = build_client(&self.inner.config, key)?;

        // Unreachable here is not fatal; the check schedule retries.
        // Firmware that answers and is too old is a configuration error.
        match client.is_clip2_supported().await {
            Ok(true) => {}
            Ok(false) => {
                self.inner.host.set_status(
                    ThingStatus::Offline,
                    StatusDetail::ConfigurationError,
                    Some("bridge firmware does not support CLIP v2".to_owned()),
                );
                return Err(CoreError::Clip2NotSupported);
            }
            Err(e) => {
                warn!(error = %e, "firmware version check failed, will retry");
            }
        }

        self.inner.client.store(Some(Arc::new(client)));

        // Fresh child token for this connection.
        let child = self.inner.cancel.child_token();
        *self
            .inner
            .cancel_child
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = child.clone();

        let session = self.clone();
        let mut handles = self.inner.task_handles.lock().await;
        handles.push(tokio::spawn(check_task(session, child)));

        info!(host = %self.inner.config.host, "bridge session started");
        Ok(())
    }

    /// Tear the session down: cancel tasks, close the event stream, and
    /// take every registered thing offline.
    pub async fn dispose(&self) {
        self.inner
            .cancel_child
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .cancel();
        self.inner
            .monitor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .close();

        let mut handles = self.inner.task_handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }

        if let Some(handle) = self.inner.event_handle.lock().await.take() {
            handle.shutdown();
        }
        self.inner.client.store(None);

        for thing in &self.inner.things {
            thing.value().bridge_offline();
        }
        let _ = self.inner.state_tx.send(SessionState::Closed);
        debug!("bridge session disposed");
    }

    // ── Thing registry ───────────────────────────────────────────────

    /// Register a thing with the session and, if connected, resolve its
    /// dependencies right away.
    pub async fn register_thing(&self, thing: ThingHandler) {
        let key = thing.resource_id().to_owned();
        self.inner.things.insert(key.clone(), thing.clone());
        self.claim_routes(&thing);

        if let Ok(client) = self.client() {
            if *self.inner.state_tx.borrow() == SessionState::Connected {
                if let Err(e) = thing.update_dependencies(&client).await {
                    warn!(thing = %key, error = %e, "dependency update failed");
                }
                self.claim_routes(&thing);
            }
        }
    }

    pub fn unregister_thing(&self, resource_id: &str) {
        if self.inner.things.remove(resource_id).is_some() {
            self.inner
                .routing
                .retain(|_, thing_key| thing_key != resource_id);
        }
    }

    /// Register every resource id a thing claims. First claim per id
    /// wins: a resource already routed to another thing stays there.
    fn claim_routes(&self, thing: &ThingHandler) {
        let key = thing.resource_id().to_owned();
        for id in thing.owned_ids() {
            self.inner.routing.entry(id).or_insert_with(|| key.clone());
        }
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Route a channel command to the thing owning `resource_id`.
    pub async fn handle_thing_command(
        &self,
        resource_id: &str,
        channel: &str,
        command: &Command,
    ) -> Result<(), CoreError> {
        let client = self.client()?;
        let thing = self
            .inner
            .things
            .get(resource_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                CoreError::InvalidConfig(format!("no thing with resource id {resource_id}"))
            })?;
        thing.handle_command(&client, channel, command).await
    }

    // ── Mass download ────────────────────────────────────────────────

    /// Download every relevant resource collection in dependency order
    /// and fan the full states out to the registered things.
    ///
    /// One failing collection is logged and skipped; the remaining types
    /// still download. Things absent from their own type's list are
    /// marked gone.
    pub async fn mass_download(&self) -> Result<(), CoreError> {
        let Ok(guard) = self.inner.download_guard.try_lock() else {
            debug!("mass download already running, skipping");
            return Ok(());
        };
        let client = self.client()?;

        for rtype in DOWNLOAD_ORDER {
            let resources = match client.get_resources(&ResourceReference::all(rtype)).await {
                Ok(resources) => resources,
                Err(e) if e.is_unauthorized() => return Err(e.into()),
                Err(e) => {
                    warn!(rtype = %rtype, error = %e, "collection download failed");
                    continue;
                }
            };

            if matches!(
                rtype,
                ResourceType::Device | ResourceType::Room | ResourceType::Zone
            ) {
                let ids: HashSet<String> =
                    resources.iter().map(|r| r.id.clone()).collect();
                for thing in &self.inner.things {
                    if thing.value().resource_type() == rtype {
                        thing.value().verify_presence(&ids);
                    }
                }
            }

            for resource in resources {
                self.route_full_resource(&resource);
            }
            debug!(rtype = %rtype, "collection downloaded");
        }

        drop(guard);
        Ok(())
    }

    fn route_full_resource(&self, resource: &Resource) {
        if let Some(entry) = self.inner.routing.get(&resource.id) {
            if let Some(thing) = self.inner.things.get(entry.value()) {
                thing.value().apply_full(resource);
                return;
            }
        }
        self.offer_to_discovery(resource);
    }

    fn offer_to_discovery(&self, resource: &Resource) {
        if !matches!(
            resource.rtype,
            ResourceType::Device | ResourceType::Room | ResourceType::Zone
        ) {
            return;
        }
        let listener = self
            .inner
            .discovery
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            listener.resource_found(resource);
        }
    }

    /// Spawn a background task bound to the current connection's cancel
    /// token; `dispose()` stops it with everything else.
    fn spawn_guarded(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        let cancel = self
            .inner
            .cancel_child
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = task => {}
            }
        });
    }

    // ── Event fan-out ────────────────────────────────────────────────

    /// Route one event batch to the things claiming its resources,
    /// preserving batch boundaries per thing.
    fn dispatch_batch(&self, events: &[Event]) {
        let mut per_thing: HashMap<String, Vec<(EventKind, Resource)>> = HashMap::new();

        for event in events {
            for resource in &event.data {
                if let Some(entry) = self.inner.routing.get(&resource.id) {
                    per_thing
                        .entry(entry.value().clone())
                        .or_default()
                        .push((event.kind, resource.clone()));
                } else if event.kind == EventKind::Add {
                    self.offer_to_discovery(resource);
                }
            }
        }

        for (key, items) in per_thing {
            let Some(thing) = self.inner.things.get(&key).map(|e| e.value().clone()) else {
                continue;
            };
            let outcome = thing.on_event_batch(&items);
            // new contributors may have appeared (merged placeholders)
            self.claim_routes(&thing);

            if outcome.needs_refresh {
                let session = self.clone();
                self.spawn_guarded(async move {
                    let Ok(client) = session.client() else { return };
                    if let Err(e) = thing.update_dependencies(&client).await {
                        warn!(thing = %thing.resource_id(), error = %e, "refresh failed");
                    }
                    session.claim_routes(&thing);
                });
            }
        }
    }

    // ── Connection check ─────────────────────────────────────────────

    /// Run one connection check and classify its outcome.
    async fn run_check(&self) -> CheckOutcome {
        let Ok(client) = self.client() else {
            return CheckOutcome::Unreachable;
        };

        let has_key = self
            .inner
            .application_key
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_some();
        if !has_key {
            return self.try_pairing(&client).await;
        }

        match client
            .get_resources(&ResourceReference::all(ResourceType::Bridge))
            .await
        {
            Ok(bridges) => {
                if let Some(bridge) = bridges.first() {
                    self.publish_bridge_properties(bridge);
                }
                if self.ensure_event_stream(&client).await {
                    CheckOutcome::Online
                } else {
                    CheckOutcome::StreamDown
                }
            }
            Err(e) if e.is_unauthorized() => {
                // drop the bad key so the next check pairs afresh
                *self
                    .inner
                    .application_key
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
                CheckOutcome::Unauthorized
            }
            Err(e) => {
                debug!(error = %e, "bridge check failed");
                CheckOutcome::Unreachable
            }
        }
    }

    /// One pairing attempt. On success the fresh key is persisted and a
    /// re-keyed client installed.
    async fn try_pairing(&self, client: &Clip2Client) -> CheckOutcome {
        match client.register_application_key(APPLICATION_ID).await {
            Ok(key) => {
                info!("pairing succeeded");
                if let Err(e) = self.inner.host.store_application_key(&key) {
                    // the key still works for this run, but it is lost on
                    // restart and the user has to pair again
                    warn!(error = %e, "application key could not be persisted");
                    self.report_status(
                        ThingStatus::Offline,
                        StatusDetail::ConfigurationError,
                        Some("application key could not be persisted".to_owned()),
                    );
                }
                match build_client(&self.inner.config, key.clone()) {
                    Ok(rekeyed) => {
                        self.inner.client.store(Some(Arc::new(rekeyed)));
                        *self
                            .inner
                            .application_key
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(key);
                        CheckOutcome::Paired
                    }
                    Err(e) => {
                        warn!(error = %e, "re-keyed client build failed");
                        CheckOutcome::Unreachable
                    }
                }
            }
            Err(e) if e.is_unauthorized() => {
                debug!("link button not pressed yet");
                CheckOutcome::PairingFailed
            }
            Err(e) => {
                debug!(error = %e, "pairing attempt failed");
                CheckOutcome::Unreachable
            }
        }
    }

    /// Make sure the SSE stream is up; returns its liveness. A dead or
    /// missing stream is respawned with a fan-out task attached.
    async fn ensure_event_stream(&self, client: &Clip2Client) -> bool {
        let mut guard = self.inner.event_handle.lock().await;
        if let Some(handle) = guard.as_ref() {
            if handle.is_alive() {
                return true;
            }
            handle.shutdown();
        }

        let stream_cancel = self
            .inner
            .cancel_child
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .child_token();
        let handle = match EventStreamHandle::spawn(
            client,
            &self.inner.config.transport(),
            ReconnectConfig::default(),
            stream_cancel.clone(),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "event stream spawn failed");
                return false;
            }
        };

        let mut rx = handle.subscribe();
        let mut alive = handle.alive();
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = stream_cancel.cancelled() => break,
                    result = rx.recv() => match result {
                        Ok(batch) => session.dispatch_batch(&batch),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "event fan-out lagged, forcing check");
                            session.inner.check_notify.notify_one();
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        // give the stream a moment to come up before declaring degraded
        let connected = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            alive.wait_for(|up| *up),
        )
        .await
        .is_ok_and(|r| r.is_ok());

        *guard = Some(handle);
        connected
    }

    fn publish_bridge_properties(&self, bridge: &Resource) {
        let mut properties = HashMap::new();
        if let Some(id) = &bridge.bridge_id {
            properties.insert("bridgeId".to_owned(), id.clone());
        }
        if let Some(name) = bridge.name() {
            properties.insert("name".to_owned(), name.to_owned());
        }
        if !properties.is_empty() {
            self.inner.host.update_properties(&properties);
        }
    }

    /// Report a host status, deduplicating repeats of the same
    /// (status, detail) pair.
    fn report_status(
        &self,
        status: ThingStatus,
        detail: StatusDetail,
        message: Option<String>,
    ) -> bool {
        let mut last = self
            .inner
            .last_report
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *last == Some((status, detail)) {
            return false;
        }
        *last = Some((status, detail));
        drop(last);
        self.inner.host.set_status(status, detail, message);
        true
    }

    /// Report state transitions to the host and the registered things.
    ///
    /// `Pairing` and `Degraded` carry a per-tick countdown; the host
    /// only hears about them when the reported (status, detail) pair
    /// actually changes. A pairing budget that runs out without the
    /// link button being pressed turns into a configuration error.
    fn publish_state(&self, state: SessionState) {
        let _ = self.inner.state_tx.send_replace(state);

        match state {
            SessionState::Connected => {
                self.report_status(ThingStatus::Online, StatusDetail::None, None);
            }
            SessionState::Pairing { remaining } if remaining > 0 => {
                self.report_status(
                    ThingStatus::Offline,
                    StatusDetail::PairingInProgress,
                    Some("press the link button on the bridge".to_owned()),
                );
            }
            SessionState::Pairing { .. } => {
                self.report_status(
                    ThingStatus::Offline,
                    StatusDetail::ConfigurationError,
                    Some("link button was not pressed in time".to_owned()),
                );
            }
            SessionState::Degraded { .. } | SessionState::Unpaired => {
                let transitioned = self.report_status(
                    ThingStatus::Offline,
                    StatusDetail::CommunicationError,
                    None,
                );
                if transitioned {
                    for thing in &self.inner.things {
                        thing.value().bridge_offline();
                    }
                }
            }
            SessionState::Closed => {}
        }
    }

    /// Bring every registered thing up after a (re)connect: mass
    /// download first, then per-thing dependency resolution.
    async fn on_connected(&self) {
        if let Err(e) = self.mass_download().await {
            warn!(error = %e, "mass download failed");
        }

        let things: Vec<ThingHandler> = self
            .inner
            .things
            .iter()
            .map(|e| e.value().clone())
            .collect();
        let Ok(client) = self.client() else { return };
        for thing in things {
            if let Err(e) = thing.update_dependencies(&client).await {
                warn!(thing = %thing.resource_id(), error = %e, "dependency update failed");
            }
            self.claim_routes(&thing);
        }
    }
}

/// Background task: check, apply the outcome to the monitor, sleep for
/// the delay it returns (or until an early check is requested).
async fn check_task(session: BridgeHandler, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let was_connected =
            *session.inner.state_tx.borrow() == SessionState::Connected;
        let outcome = session.run_check().await;
        let (state, delay) = {
            let mut monitor = session
                .inner
                .monitor
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let delay = monitor.on_outcome(outcome);
            (monitor.state(), delay)
        };
        session.publish_state(state);

        if state == SessionState::Connected && !was_connected {
            session.on_connected().await;
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = session.inner.check_notify.notified() => {}
            () = tokio::time::sleep(delay) => {}
        }
    }
    debug!("check task exiting");
}
