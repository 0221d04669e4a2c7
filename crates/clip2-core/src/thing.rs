//! Thing handler: one device, room, or zone.
//!
//! A thing owns one CLIP v2 resource (its configured device/room/zone)
//! plus the contributor resources that feed its channels: the services
//! the owner aggregates (lights, sensors, connectivity, power) and the
//! scenes targeting it. Contributor full states are cached so partial
//! event-stream updates can be merged before projection.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use clip2_api::Clip2Client;
use clip2_api::types::{
    EventKind, Resource, ResourceReference, ResourceType, ZigbeeStatus,
};

use crate::channel::{
    CHANNEL_ALERT, CHANNEL_BRIGHTNESS, CHANNEL_COLOR_TEMPERATURE, CHANNEL_COLOR_XY,
    CHANNEL_COLOR_XY_ONLY, CHANNEL_DIMMING_ONLY, CHANNEL_EFFECT, CHANNEL_LAST_UPDATED,
    CHANNEL_LIGHT_LEVEL_ENABLED, CHANNEL_MOTION_ENABLED, CHANNEL_SCENE, CHANNEL_SWITCH,
    CHANNEL_SWITCH_ONLY, CHANNEL_TEMPERATURE_ENABLED, CHANNEL_ZIGBEE_STATUS, ChannelValue,
    exposed_channels,
};
use crate::command::{Command, build_payload};
use crate::config::ThingConfig;
use crate::error::CoreError;
use crate::host::{StatusDetail, ThingHost, ThingStatus};
use crate::projection::project;

/// What the session should do after a batch was applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// A device reconnected; contributor full states are stale and the
    /// session should re-run [`ThingHandler::update_dependencies`].
    pub needs_refresh: bool,
}

/// Handler for one thing. Cheaply cloneable via `Arc`.
#[derive(Clone)]
pub struct ThingHandler {
    inner: Arc<ThingInner>,
}

struct ThingInner {
    config: ThingConfig,
    host: Arc<dyn ThingHost>,
    /// Contributor cache: resource id -> last known full state.
    cache: DashMap<String, Resource>,
    /// Command routing: channel -> PUT target. First contributor that
    /// carries a channel claims it; later duplicates are ignored.
    command_targets: DashMap<String, ResourceReference>,
    /// Channels confirmed by a full-state update.
    supported: std::sync::Mutex<BTreeSet<&'static str>>,
    /// Last channel list reported to the host.
    exposed: std::sync::Mutex<Vec<&'static str>>,
    /// Serializes dependency resolution; at most one pass runs at a time.
    resolve_guard: tokio::sync::Mutex<()>,
    /// Set when a resolution pass completed; further calls are no-ops
    /// until the flag is cleared (bridge outage, device reconnect, or an
    /// explicit refresh command).
    dependencies_done: AtomicBool,
    /// One-shot latch for legacy channel link replication.
    legacy_links_done: AtomicBool,
    /// Zigbee connectivity blanking latch: set while the device is
    /// disconnected and its channels have been blanked to Undef.
    blanked: AtomicBool,
    gone: AtomicBool,
}

impl ThingHandler {
    pub fn new(config: ThingConfig, host: Arc<dyn ThingHost>) -> Self {
        Self {
            inner: Arc::new(ThingInner {
                config,
                host,
                cache: DashMap::new(),
                command_targets: DashMap::new(),
                supported: std::sync::Mutex::new(BTreeSet::new()),
                exposed: std::sync::Mutex::new(Vec::new()),
                resolve_guard: tokio::sync::Mutex::new(()),
                dependencies_done: AtomicBool::new(false),
                legacy_links_done: AtomicBool::new(false),
                blanked: AtomicBool::new(false),
                gone: AtomicBool::new(false),
            }),
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.inner.config.resource_id
    }

    pub fn resource_type(&self) -> ResourceType {
        self.inner.config.resource_type
    }

    fn own_reference(&self) -> ResourceReference {
        ResourceReference::one(self.resource_id(), self.resource_type())
    }

    /// All resource ids this thing claims: its own plus every cached
    /// contributor. The session registers these in its routing table.
    pub fn owned_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.cache.iter().map(|e| e.key().clone()).collect();
        ids.push(self.resource_id().to_owned());
        ids
    }

    // ── Dependency resolution ────────────────────────────────────────

    /// Fetch the thing's own resource and every contributor, seed the
    /// cache, and bring the thing online.
    ///
    /// At most one resolution pass runs at a time, and a completed pass
    /// makes further calls no-ops until the done flag is cleared again
    /// (bridge outage, device reconnect, or a refresh command).
    pub async fn update_dependencies(&self, client: &Clip2Client) -> Result<(), CoreError> {
        let _guard = self.inner.resolve_guard.lock().await;
        if self.inner.dependencies_done.load(Ordering::SeqCst) {
            debug!(thing = %self.resource_id(), "dependencies already resolved");
            return Ok(());
        }
        self.resolve_dependencies(client).await
    }

    /// Re-fetch contributors even when dependencies are already done.
    ///
    /// Debounced: a refresh arriving while a pass is running is dropped
    /// rather than queued.
    pub async fn refresh(&self, client: &Clip2Client) -> Result<(), CoreError> {
        let Ok(_guard) = self.inner.resolve_guard.try_lock() else {
            debug!(thing = %self.resource_id(), "refresh collapsed into running pass");
            return Ok(());
        };
        self.resolve_dependencies(client).await
    }

    /// Contributors are the owner's service references plus the scenes
    /// whose group points at the owner. Each contributor id is seeded as
    /// a placeholder before its full state arrives, so event routing
    /// already claims it during the download.
    async fn resolve_dependencies(&self, client: &Clip2Client) -> Result<(), CoreError> {
        let own = client.get_resources(&self.own_reference()).await?;
        let Some(own) = own.into_iter().next() else {
            self.mark_gone();
            return Ok(());
        };

        let mut properties = HashMap::new();
        if let Some(name) = own.name() {
            properties.insert("name".to_owned(), name.to_owned());
        }
        if let Some(product) = &own.product_data {
            if let Some(model) = &product.model_id {
                properties.insert("modelId".to_owned(), model.clone());
            }
            if let Some(vendor) = &product.manufacturer_name {
                properties.insert("vendor".to_owned(), vendor.clone());
            }
            if let Some(firmware) = &product.software_version {
                properties.insert("firmwareVersion".to_owned(), firmware.clone());
            }
        }
        if let Some(id_v1) = own.id_v1.clone().or_else(|| self.inner.config.legacy_id.clone())
        {
            properties.insert("legacyId".to_owned(), id_v1);
        }
        if !properties.is_empty() {
            self.inner.host.update_properties(&properties);
        }

        // Seed placeholders so events for contributors route here even
        // before their full state lands.
        let mut wanted: Vec<ResourceReference> = Vec::new();
        for service in own.service_references() {
            if let Some(id) = &service.id {
                self.inner
                    .cache
                    .entry(id.clone())
                    .or_insert_with(|| Resource::placeholder(service.rtype));
                wanted.push(service.clone());
            }
        }
        self.inner.cache.insert(own.id.clone(), own.clone());

        // Scenes targeting this thing's group contribute to the scene
        // channel; their names double as command options.
        let own_ref = self.own_reference();
        let mut scene_names = Vec::new();
        for scene_type in [ResourceType::Scene, ResourceType::SmartScene] {
            match client.get_resources(&ResourceReference::all(scene_type)).await {
                Ok(scenes) => {
                    for scene in scenes {
                        if scene.group.as_ref() == Some(&own_ref) {
                            if let Some(name) = scene.name() {
                                scene_names.push(name.to_owned());
                            }
                            wanted.push(scene.reference());
                            self.apply_full(&scene);
                        }
                    }
                }
                Err(e) => {
                    warn!(rtype = %scene_type, error = %e, "scene download failed");
                }
            }
        }
        self.inner.host.set_scene_options(&scene_names);

        // Fetch each contributor type once and apply the matching
        // instances as full updates.
        let wanted_ids: HashSet<&String> =
            wanted.iter().filter_map(|r| r.id.as_ref()).collect();
        let mut types: Vec<ResourceType> = wanted
            .iter()
            .map(|r| r.rtype)
            .filter(|t| !t.is_scene_type())
            .collect();
        types.sort_by_key(|t| t.to_string());
        types.dedup();

        for rtype in types {
            match client.get_resources(&ResourceReference::all(rtype)).await {
                Ok(resources) => {
                    for resource in resources {
                        if wanted_ids.contains(&resource.id) {
                            self.apply_full(&resource);
                        }
                    }
                }
                Err(e) => {
                    // one failing type leaves its channels undefined but
                    // does not take the whole thing down
                    warn!(rtype = %rtype, error = %e, "contributor download failed");
                }
            }
        }

        if (own.id_v1.is_some() || self.inner.config.legacy_id.is_some())
            && !self.inner.legacy_links_done.swap(true, Ordering::SeqCst)
        {
            let exposed = self
                .inner
                .exposed
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone();
            self.inner.host.replicate_legacy_links(&exposed);
        }

        for channel in self.missing_required_channels() {
            warn!(
                thing = %self.resource_id(),
                channel,
                "required channel not fed by any contributor"
            );
        }

        // the pass must not override a gone thing or one whose device is
        // reported disconnected
        if !self.inner.gone.load(Ordering::SeqCst)
            && !self.inner.blanked.load(Ordering::SeqCst)
        {
            self.inner
                .host
                .set_status(ThingStatus::Online, StatusDetail::None, None);
        }
        self.inner.dependencies_done.store(true, Ordering::SeqCst);
        debug!(
            thing = %self.resource_id(),
            contributors = self.inner.cache.len(),
            "dependencies updated"
        );
        Ok(())
    }

    fn missing_required_channels(&self) -> Vec<String> {
        let supported = self
            .inner
            .supported
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.inner
            .config
            .required_channels
            .iter()
            .filter(|required| !supported.contains(required.as_str()))
            .cloned()
            .collect()
    }

    // ── Event intake ─────────────────────────────────────────────────

    /// Apply one event batch (already filtered to this thing's resources).
    ///
    /// Scene priority: when any scene in the batch activates, the
    /// deactivation entries of sibling scenes in the same batch must not
    /// blank the scene channel, or the activation would be lost to
    /// ordering.
    pub fn on_event_batch(&self, batch: &[(EventKind, Resource)]) -> BatchOutcome {
        let scene_activates = batch.iter().any(|(kind, resource)| {
            *kind != EventKind::Delete
                && resource.rtype.is_scene_type()
                && resource.scene_active() == Some(true)
        });

        let mut outcome = BatchOutcome::default();
        for (kind, resource) in batch {
            match kind {
                EventKind::Delete => self.on_delete(resource),
                EventKind::Add | EventKind::Update => {
                    if self.on_resource(resource, scene_activates) {
                        outcome.needs_refresh = true;
                    }
                }
                EventKind::Error => {
                    warn!(thing = %self.resource_id(), id = %resource.id, "error event");
                }
            }
        }
        outcome
    }

    /// Apply one resource; returns `true` if contributors need a refresh.
    fn on_resource(&self, resource: &Resource, suppress_scene_off: bool) -> bool {
        if !self.owns(&resource.id) {
            return false;
        }

        // Merge partial state over the cached full state; the merged
        // instance supplies values for fields the event did not carry
        // (scene names, button control ids).
        let mut merged = resource.clone();
        if !resource.has_full_state() {
            if let Some(cached) = self.inner.cache.get(&resource.id) {
                merged.merge_from(&cached);
            }
        }
        self.inner.cache.insert(merged.id.clone(), merged.clone());

        if resource.rtype.is_scene_type() {
            self.update_scene_channel(resource, &merged, suppress_scene_off);
            return false;
        }

        let needs_refresh = if resource.rtype == ResourceType::ZigbeeConnectivity {
            self.update_connectivity_state(&merged)
        } else {
            false
        };

        self.apply_projection(resource, &merged);
        needs_refresh
    }

    fn on_delete(&self, resource: &Resource) {
        if resource.id == self.resource_id() {
            self.mark_gone();
        } else if self.inner.cache.remove(&resource.id).is_some() {
            debug!(
                thing = %self.resource_id(),
                id = %resource.id,
                "contributor deleted"
            );
        }
    }

    fn owns(&self, id: &str) -> bool {
        id == self.resource_id() || self.inner.cache.contains_key(id)
    }

    /// Apply a full-state resource fetched by a bulk GET.
    pub fn apply_full(&self, resource: &Resource) {
        self.on_resource(resource, false);
    }

    /// The session downloaded the full list of this thing's own type;
    /// a thing missing from it no longer exists on the bridge.
    pub fn verify_presence(&self, own_type_ids: &HashSet<String>) {
        if !own_type_ids.contains(self.resource_id()) {
            self.mark_gone();
        }
    }

    fn mark_gone(&self) {
        if !self.inner.gone.swap(true, Ordering::SeqCst) {
            info!(thing = %self.resource_id(), "resource no longer exists on bridge");
            self.inner.host.set_status(
                ThingStatus::Offline,
                StatusDetail::Gone,
                Some("resource not found on bridge".to_owned()),
            );
        }
    }

    /// The owning bridge session went offline. Contributor state is
    /// stale from here on, so the next reconnect resolves afresh.
    pub fn bridge_offline(&self) {
        self.inner.dependencies_done.store(false, Ordering::SeqCst);
        self.inner
            .host
            .set_status(ThingStatus::Offline, StatusDetail::BridgeOffline, None);
    }

    // ── Channel state ────────────────────────────────────────────────

    /// Write projected channel values, applying the full/partial rules.
    fn apply_projection(&self, incoming: &Resource, merged: &Resource) {
        let full = incoming.has_full_state();

        // Which channels the incoming instance actually touched.
        let touched: HashSet<&'static str> = project(incoming)
            .into_iter()
            .filter_map(|u| u.value.map(|_| u.channel))
            .collect();

        let mut supported_grew = false;
        for update in project(merged) {
            if full {
                // full state confirms the channel exists on this thing
                if update.value.is_some() {
                    supported_grew |= self.support_channel(update.channel);
                }
                self.inner
                    .host
                    .update_channel(update.channel, update.value.unwrap_or(ChannelValue::Undef));
            } else if touched.contains(update.channel) {
                if let Some(value) = update.value {
                    self.inner.host.update_channel(update.channel, value);
                }
            }
        }

        if full {
            self.register_command_targets(merged);
            // device things track when a contributor last delivered a
            // full state
            if self.resource_type() == ResourceType::Device {
                supported_grew |= self.support_channel(CHANNEL_LAST_UPDATED);
                self.inner.host.update_channel(
                    CHANNEL_LAST_UPDATED,
                    ChannelValue::Text(
                        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                    ),
                );
            }
        }
        if supported_grew {
            self.publish_channel_list();
        }
    }

    fn support_channel(&self, channel: &'static str) -> bool {
        let mut supported = self
            .inner
            .supported
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        supported.insert(channel)
    }

    fn publish_channel_list(&self) {
        let supported = self
            .inner
            .supported
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let channels = exposed_channels(&supported);

        let mut exposed = self
            .inner
            .exposed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *exposed != channels {
            *exposed = channels.clone();
            drop(exposed);
            self.inner.host.channels_changed(&channels);
        }
    }

    /// Claim command channels for a contributor. First claim per
    /// channel wins so duplicate contributors cannot flip routing.
    fn register_command_targets(&self, resource: &Resource) {
        let channels: &[&str] = match resource.rtype {
            ResourceType::Light => &[
                CHANNEL_SWITCH,
                CHANNEL_SWITCH_ONLY,
                CHANNEL_BRIGHTNESS,
                CHANNEL_DIMMING_ONLY,
                CHANNEL_COLOR_XY,
                CHANNEL_COLOR_XY_ONLY,
                CHANNEL_COLOR_TEMPERATURE,
                CHANNEL_ALERT,
                CHANNEL_EFFECT,
            ],
            ResourceType::GroupedLight => &[
                CHANNEL_SWITCH,
                CHANNEL_SWITCH_ONLY,
                CHANNEL_BRIGHTNESS,
                CHANNEL_DIMMING_ONLY,
                CHANNEL_ALERT,
            ],
            ResourceType::Motion => &[CHANNEL_MOTION_ENABLED],
            ResourceType::LightLevel => &[CHANNEL_LIGHT_LEVEL_ENABLED],
            ResourceType::Temperature => &[CHANNEL_TEMPERATURE_ENABLED],
            _ => &[],
        };
        for channel in channels {
            self.inner
                .command_targets
                .entry((*channel).to_owned())
                .or_insert_with(|| resource.reference());
        }
    }

    // ── Scenes ───────────────────────────────────────────────────────

    fn update_scene_channel(&self, incoming: &Resource, merged: &Resource, suppress_off: bool) {
        if incoming.has_full_state() && self.support_channel(CHANNEL_SCENE) {
            self.publish_channel_list();
        }

        match incoming.scene_active() {
            Some(true) => {
                let name = merged.name().unwrap_or(&merged.id).to_owned();
                self.inner
                    .host
                    .update_channel(CHANNEL_SCENE, ChannelValue::Text(name));
            }
            Some(false) => {
                // a sibling activation in the same batch owns the channel
                if !suppress_off {
                    self.inner
                        .host
                        .update_channel(CHANNEL_SCENE, ChannelValue::Undef);
                }
            }
            None => {}
        }
    }

    // ── Zigbee connectivity ──────────────────────────────────────────

    /// Track the device's radio link. Going non-connected blanks every
    /// other channel to Undef exactly once and takes the thing offline;
    /// coming back brings it online and asks for a contributor refresh
    /// (state moved while the device was away).
    fn update_connectivity_state(&self, resource: &Resource) -> bool {
        let Some(status) = resource.zigbee_status() else {
            return false;
        };

        if status == ZigbeeStatus::Connected {
            if self.inner.blanked.swap(false, Ordering::SeqCst) {
                info!(thing = %self.resource_id(), "device reconnected");
                // state moved while the device was away
                self.inner.dependencies_done.store(false, Ordering::SeqCst);
                self.inner
                    .host
                    .set_status(ThingStatus::Online, StatusDetail::None, None);
                return true;
            }
            return false;
        }

        self.inner.host.set_status(
            ThingStatus::Offline,
            StatusDetail::CommunicationError,
            Some(format!("zigbee status: {status}")),
        );
        if !self.inner.blanked.swap(true, Ordering::SeqCst) {
            let supported = self
                .inner
                .supported
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone();
            for channel in supported {
                if channel != CHANNEL_ZIGBEE_STATUS {
                    self.inner.host.update_channel(channel, ChannelValue::Undef);
                }
            }
        }
        false
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Execute a command against a channel.
    ///
    /// `Refresh` re-fetches the contributors instead of writing state.
    /// Scene recalls by name resolve against the cached scenes; every
    /// other channel routes to the contributor that claimed it.
    pub async fn handle_command(
        &self,
        client: &Clip2Client,
        channel: &str,
        command: &Command,
    ) -> Result<(), CoreError> {
        if *command == Command::Refresh {
            return self.refresh(client).await;
        }

        let target = if channel == CHANNEL_SCENE {
            self.scene_target(command)?
        } else {
            self.inner
                .command_targets
                .get(channel)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| CoreError::UnsupportedCommand {
                    channel: channel.to_owned(),
                })?
        };

        let payload = match (channel, command) {
            // scene by name is expressed as an activation of the target
            (CHANNEL_SCENE, Command::Text(_)) => {
                build_payload(&target, CHANNEL_SCENE, &Command::OnOff(true))?
            }
            _ => build_payload(&target, channel, command)?,
        };

        debug!(
            thing = %self.resource_id(),
            channel,
            target = %payload.id,
            "sending command"
        );
        client.put_resource(&payload).await?;
        Ok(())
    }

    fn scene_target(&self, command: &Command) -> Result<ResourceReference, CoreError> {
        let Command::Text(name) = command else {
            return Err(CoreError::UnsupportedCommand {
                channel: CHANNEL_SCENE.to_owned(),
            });
        };
        self.inner
            .cache
            .iter()
            .find(|entry| {
                entry.value().rtype.is_scene_type() && entry.value().name() == Some(name)
            })
            .map(|entry| entry.value().reference())
            .ok_or_else(|| {
                CoreError::InvalidConfig(format!("no scene named '{name}' on this thing"))
            })
    }
}
