//! Projection of resource state onto channels.
//!
//! Each rule maps one field section of a resource to one channel. The
//! result is three-valued per channel:
//!
//! - no entry: the resource type never feeds this channel;
//! - `value: None`: the field is absent on this instance (a partial
//!   update that did not touch it);
//! - `value: Some(..)`: the field is present, including `Undef` when the
//!   bridge explicitly flags the reading as invalid.
//!
//! Callers apply the full/partial write rules: a full-state resource
//! writes every entry (absent fields as `Undef`) and its present entries
//! grow the supported-channel set; a partial resource writes present
//! entries only.

use clip2_api::types::{Resource, ResourceType};

use crate::channel::{
    CHANNEL_ALERT, CHANNEL_BATTERY_LEVEL, CHANNEL_BATTERY_LOW, CHANNEL_BRIGHTNESS,
    CHANNEL_BUTTON_LAST_EVENT, CHANNEL_COLOR_TEMPERATURE, CHANNEL_COLOR_XY, CHANNEL_EFFECT,
    CHANNEL_LIGHT_LEVEL, CHANNEL_LIGHT_LEVEL_ENABLED, CHANNEL_MOTION, CHANNEL_MOTION_ENABLED,
    CHANNEL_ROTARY_STEPS, CHANNEL_SWITCH, CHANNEL_TEMPERATURE, CHANNEL_TEMPERATURE_ENABLED,
    CHANNEL_ZIGBEE_STATUS, ChannelValue,
};

/// One projected channel entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelUpdate {
    pub channel: &'static str,
    pub value: Option<ChannelValue>,
}

impl ChannelUpdate {
    fn new(channel: &'static str, value: Option<ChannelValue>) -> Self {
        Self { channel, value }
    }
}

/// Project a resource's state sections onto channel entries.
///
/// Scene resources are not handled here; the thing handler projects
/// those itself because they need batch context (scene priority) and
/// the scene name from the cache.
pub fn project(resource: &Resource) -> Vec<ChannelUpdate> {
    match resource.rtype {
        ResourceType::Light => light_updates(resource),
        ResourceType::GroupedLight => grouped_light_updates(resource),
        ResourceType::Button => button_updates(resource),
        ResourceType::RelativeRotary => rotary_updates(resource),
        ResourceType::Motion => motion_updates(resource),
        ResourceType::LightLevel => light_level_updates(resource),
        ResourceType::Temperature => temperature_updates(resource),
        ResourceType::DevicePower => power_updates(resource),
        ResourceType::ZigbeeConnectivity => zigbee_updates(resource),
        _ => Vec::new(),
    }
}

fn light_updates(resource: &Resource) -> Vec<ChannelUpdate> {
    let mut updates = grouped_light_updates(resource);
    updates.push(ChannelUpdate::new(
        CHANNEL_COLOR_XY,
        resource
            .color
            .map(|c| ChannelValue::Xy { x: c.xy.x, y: c.xy.y }),
    ));
    updates.push(ChannelUpdate::new(
        CHANNEL_COLOR_TEMPERATURE,
        resource.color_temperature.map(|ct| {
            // a mirek value flagged invalid means the light is in color
            // mode; the channel exists but holds no defined value
            match (ct.mirek, ct.mirek_valid) {
                (Some(mirek), valid) if valid.unwrap_or(true) => {
                    ChannelValue::Number(f64::from(mirek))
                }
                _ => ChannelValue::Undef,
            }
        }),
    ));
    updates.push(ChannelUpdate::new(
        CHANNEL_EFFECT,
        resource
            .effects
            .as_ref()
            .map(|e| match e.effect.as_deref() {
                Some(effect) => ChannelValue::Text(effect.to_owned()),
                None => ChannelValue::Undef,
            }),
    ));
    updates
}

fn grouped_light_updates(resource: &Resource) -> Vec<ChannelUpdate> {
    vec![
        ChannelUpdate::new(
            CHANNEL_SWITCH,
            resource.on.map(|s| ChannelValue::OnOff(s.on)),
        ),
        ChannelUpdate::new(
            CHANNEL_BRIGHTNESS,
            resource
                .dimming
                .map(|d| ChannelValue::Percent(d.brightness.clamp(0.0, 100.0))),
        ),
        ChannelUpdate::new(
            CHANNEL_ALERT,
            resource.alert.as_ref().map(|a| match a.action.as_deref() {
                Some(action) => ChannelValue::Text(action.to_owned()),
                None => ChannelValue::Undef,
            }),
        ),
    ]
}

fn button_updates(resource: &Resource) -> Vec<ChannelUpdate> {
    // Multiple button resources of one device share a single channel;
    // the control id distinguishes which physical button fired.
    let control_id = resource.control_id().unwrap_or(0);
    vec![ChannelUpdate::new(
        CHANNEL_BUTTON_LAST_EVENT,
        resource.button.as_ref().map(|b| match b.last_event.as_deref() {
            Some(event) => ChannelValue::Text(format!("{control_id}:{event}")),
            None => ChannelValue::Undef,
        }),
    )]
}

fn rotary_updates(resource: &Resource) -> Vec<ChannelUpdate> {
    vec![ChannelUpdate::new(
        CHANNEL_ROTARY_STEPS,
        resource.relative_rotary.as_ref().map(|r| {
            let Some(rotation) = r.rotation.as_ref() else {
                return ChannelValue::Undef;
            };
            let Some(steps) = rotation.steps else {
                return ChannelValue::Undef;
            };
            #[allow(clippy::cast_precision_loss)]
            let magnitude = steps as f64;
            let signed = if rotation.direction.as_deref() == Some("counter_clock_wise") {
                -magnitude
            } else {
                magnitude
            };
            ChannelValue::Number(signed)
        }),
    )]
}

fn motion_updates(resource: &Resource) -> Vec<ChannelUpdate> {
    vec![
        ChannelUpdate::new(
            CHANNEL_MOTION,
            resource.motion.map(|m| match (m.motion, m.motion_valid) {
                (Some(motion), valid) if valid.unwrap_or(true) => ChannelValue::OnOff(motion),
                _ => ChannelValue::Undef,
            }),
        ),
        ChannelUpdate::new(
            CHANNEL_MOTION_ENABLED,
            resource.enabled.map(ChannelValue::OnOff),
        ),
    ]
}

fn light_level_updates(resource: &Resource) -> Vec<ChannelUpdate> {
    vec![
        ChannelUpdate::new(
            CHANNEL_LIGHT_LEVEL,
            resource.light.map(|l| {
                match (l.light_level, l.light_level_valid) {
                    // the bridge reports 10000*log10(lux)+1; surface lux
                    (Some(level), valid) if valid.unwrap_or(true) => {
                        ChannelValue::Number(10_f64.powf((level - 1.0) / 10_000.0))
                    }
                    _ => ChannelValue::Undef,
                }
            }),
        ),
        ChannelUpdate::new(
            CHANNEL_LIGHT_LEVEL_ENABLED,
            resource.enabled.map(ChannelValue::OnOff),
        ),
    ]
}

fn temperature_updates(resource: &Resource) -> Vec<ChannelUpdate> {
    vec![
        ChannelUpdate::new(
            CHANNEL_TEMPERATURE,
            resource
                .temperature
                .map(|t| match (t.temperature, t.temperature_valid) {
                    (Some(celsius), valid) if valid.unwrap_or(true) => {
                        ChannelValue::Number(celsius)
                    }
                    _ => ChannelValue::Undef,
                }),
        ),
        ChannelUpdate::new(
            CHANNEL_TEMPERATURE_ENABLED,
            resource.enabled.map(ChannelValue::OnOff),
        ),
    ]
}

fn power_updates(resource: &Resource) -> Vec<ChannelUpdate> {
    vec![
        ChannelUpdate::new(
            CHANNEL_BATTERY_LEVEL,
            resource.power_state.as_ref().map(|p| match p.battery_level {
                Some(level) => ChannelValue::Percent(level.clamp(0.0, 100.0)),
                None => ChannelValue::Undef,
            }),
        ),
        ChannelUpdate::new(
            CHANNEL_BATTERY_LOW,
            resource.power_state.as_ref().map(|p| {
                match p.battery_state.as_deref() {
                    Some(state) => ChannelValue::OnOff(matches!(state, "low" | "critical")),
                    None => ChannelValue::Undef,
                }
            }),
        ),
    ]
}

fn zigbee_updates(resource: &Resource) -> Vec<ChannelUpdate> {
    vec![ChannelUpdate::new(
        CHANNEL_ZIGBEE_STATUS,
        resource.status.as_ref().map(|_| match resource.zigbee_status() {
            Some(status) => ChannelValue::Text(status.to_string()),
            None => ChannelValue::Undef,
        }),
    )]
}
