//! Typed model of CLIP v2 resource objects.
//!
//! A [`Resource`] is one addressable entity on the bridge (light, sensor,
//! scene, device, room, zone, ...). The same struct carries both variants
//! the protocol distinguishes:
//!
//! - **full-state** resources, returned by bulk GET, with every field the
//!   type defines populated;
//! - **sparse** resources, delivered by the SSE event stream, carrying only
//!   the changed fields. Absent fields mean *unchanged*, never *null* —
//!   [`Resource::merge_from`] enforces that when merging into a cache.

use serde::{Deserialize, Serialize};

// ── ResourceType ─────────────────────────────────────────────────────

/// CLIP v2 resource type. Doubles as the URL path segment of the
/// collection endpoint (`/clip/v2/resource/<type>`).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResourceType {
    Bridge,
    BridgeHome,
    Device,
    Room,
    Zone,
    Light,
    GroupedLight,
    Scene,
    SmartScene,
    Button,
    RelativeRotary,
    Temperature,
    Motion,
    LightLevel,
    DevicePower,
    ZigbeeConnectivity,
    /// Forward-compatible catch-all for types this crate does not model.
    #[default]
    #[serde(other)]
    Unknown,
}

impl ResourceType {
    /// Types whose state is projected onto a scene channel.
    pub fn is_scene_type(self) -> bool {
        matches!(self, Self::Scene | Self::SmartScene)
    }
}

// ── ResourceReference ────────────────────────────────────────────────

/// A non-owning link to another resource: `(id, type)`.
///
/// `id == None` addresses the whole collection of the given type
/// (used for bulk GET).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceReference {
    #[serde(rename = "rid", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub rtype: ResourceType,
}

impl ResourceReference {
    /// Reference the whole collection of a type.
    pub fn all(rtype: ResourceType) -> Self {
        Self { id: None, rtype }
    }

    /// Reference one specific resource.
    pub fn one(id: impl Into<String>, rtype: ResourceType) -> Self {
        Self {
            id: Some(id.into()),
            rtype,
        }
    }
}

// ── Field sections ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archetype: Option<String>,
    /// Which physical button of a multi-button device this resource is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_id: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_archetype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub software_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware_platform_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certified: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OnState {
    pub on: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dimming {
    /// Brightness percentage, 0.0..=100.0.
    pub brightness: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ColorTemperature {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirek: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirek_valid: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct XyCoordinates {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorXy {
    pub xy: XyCoordinates,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Alerts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub action_values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Effects {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub effect_values: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LightLevelReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub light_level: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub light_level_valid: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ButtonReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RotaryRotation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RotaryReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<RotaryRotation>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_valid: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motion: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motion_valid: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_state: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

/// Zigbee radio link status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ZigbeeStatus {
    Connected,
    Disconnected,
    ConnectivityIssue,
    UnidirectionalIncoming,
}

// ── Resource ─────────────────────────────────────────────────────────

/// One CLIP v2 resource object.
///
/// All state sections are optional; which ones a full-state instance
/// carries depends on [`Resource::rtype`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(skip)]
    sparse: bool,

    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub rtype: ResourceType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge_id: Option<String>,
    /// The `/lights/3`-style id this resource had under the v1 API,
    /// used for one-shot migration of legacy things.
    #[serde(rename = "id_v1", skip_serializing_if = "Option::is_none")]
    pub id_v1: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<ResourceReference>,
    /// For scenes: the room/zone the scene belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<ResourceReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetaData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_data: Option<ProductData>,
    /// Service resources this (device/room/zone) resource aggregates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<ResourceReference>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub on: Option<OnState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimming: Option<Dimming>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_temperature: Option<ColorTemperature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<ColorXy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<Alerts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effects: Option<Effects>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub light: Option<LightLevelReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub button: Option<ButtonReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative_rotary: Option<RotaryReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<TemperatureReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motion: Option<MotionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_state: Option<PowerState>,

    /// Untyped status element; carries the zigbee link status for
    /// `zigbee_connectivity` resources and `{ "active": ... }` for scenes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<serde_json::Value>,
    /// Smart-scene state ("active" / "inactive").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recall: Option<Recall>,
}

impl Resource {
    pub fn new(id: impl Into<String>, rtype: ResourceType) -> Self {
        Self {
            id: id.into(),
            rtype,
            ..Self::default()
        }
    }

    /// An empty placeholder of the given type, used to pre-seed
    /// contributor caches before the first GET.
    pub fn placeholder(rtype: ResourceType) -> Self {
        Self {
            rtype,
            ..Self::default()
        }
    }

    /// `true` if this instance came from a bulk GET and carries every
    /// field its type defines.
    pub fn has_full_state(&self) -> bool {
        !self.sparse
    }

    /// Mark this instance as a sparse (event-stream) resource.
    pub fn mark_sparse(mut self) -> Self {
        self.sparse = true;
        self
    }

    /// Reference to this resource.
    pub fn reference(&self) -> ResourceReference {
        ResourceReference::one(self.id.clone(), self.rtype)
    }

    /// Friendly name from the metadata section, if any.
    pub fn name(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.name.as_deref())
    }

    /// Control id of a button resource, if any.
    pub fn control_id(&self) -> Option<u8> {
        self.metadata.as_ref().and_then(|m| m.control_id)
    }

    /// Service references declared by this (device/room/zone) resource.
    pub fn service_references(&self) -> &[ResourceReference] {
        self.services.as_deref().unwrap_or_default()
    }

    /// Parse the zigbee link status, if this resource carries one.
    pub fn zigbee_status(&self) -> Option<ZigbeeStatus> {
        let status = self.status.as_ref()?;
        serde_json::from_value(status.clone()).ok()
    }

    /// Whether a scene resource reports itself active.
    ///
    /// `None` means the status element is absent (don't touch the channel),
    /// `Some(false)` means explicitly inactive.
    pub fn scene_active(&self) -> Option<bool> {
        match self.rtype {
            ResourceType::Scene => {
                let active = self.status.as_ref()?.get("active")?.as_str()?;
                Some(!active.eq_ignore_ascii_case("inactive"))
            }
            ResourceType::SmartScene => {
                let state = self.state.as_deref()?;
                Some(state.eq_ignore_ascii_case("active"))
            }
            _ => None,
        }
    }

    /// Merge a cached full-state resource into this sparse instance.
    ///
    /// Every field absent on `self` is copied from `cached`; fields
    /// present on `self` win. This is the core merge invariant: absence
    /// in an event-stream resource means "unchanged".
    pub fn merge_from(&mut self, cached: &Resource) {
        macro_rules! fill {
            ($($field:ident),* $(,)?) => {
                $(
                    if self.$field.is_none() {
                        self.$field = cached.$field.clone();
                    }
                )*
            };
        }
        fill!(
            bridge_id,
            id_v1,
            owner,
            group,
            metadata,
            product_data,
            services,
            on,
            dimming,
            color_temperature,
            color,
            alert,
            effects,
            enabled,
            light,
            button,
            relative_rotary,
            temperature,
            motion,
            power_state,
            status,
            state,
            recall,
        );
    }
}

// ── Response envelope ────────────────────────────────────────────────

/// Error entry in a GET/PUT response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceError {
    #[serde(default)]
    pub description: String,
}

/// GET/PUT response envelope: a list of resources plus an error list.
///
/// A PUT response mirrors the applied changes; its `errors` list carries
/// per-field rejections, which are warnings rather than hard failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub data: Vec<Resource>,
    #[serde(default)]
    pub errors: Vec<ResourceError>,
}

// ── SSE events ───────────────────────────────────────────────────────

/// Change kind of an SSE event batch entry.
///
/// `FULL_STATE` only ever appears in direct GET responses, never in the
/// push stream, so it is not modelled here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Add,
    Update,
    Delete,
    Error,
}

/// One entry of an SSE message: a change kind plus the affected
/// (partial) resources.
#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub data: Vec<Resource>,
}
