//! Channel identifiers and channel values.
//!
//! A channel is one externally visible state slot of a thing. Channel ids
//! are fixed strings; the set of channels a thing actually supports is
//! discovered at runtime from the fields its resources carry.

use std::collections::BTreeSet;
use std::fmt;

// ── Channel ids ──────────────────────────────────────────────────────

pub const CHANNEL_SWITCH: &str = "switch";
pub const CHANNEL_BRIGHTNESS: &str = "brightness";
pub const CHANNEL_COLOR_XY: &str = "color-xy";
pub const CHANNEL_COLOR_TEMPERATURE: &str = "color-temperature";
pub const CHANNEL_ALERT: &str = "alert";
pub const CHANNEL_EFFECT: &str = "effect";
pub const CHANNEL_SCENE: &str = "scene";
pub const CHANNEL_BUTTON_LAST_EVENT: &str = "button-last-event";
pub const CHANNEL_ROTARY_STEPS: &str = "rotary-steps";
pub const CHANNEL_MOTION: &str = "motion";
pub const CHANNEL_MOTION_ENABLED: &str = "motion-enabled";
pub const CHANNEL_LIGHT_LEVEL: &str = "light-level";
pub const CHANNEL_LIGHT_LEVEL_ENABLED: &str = "light-level-enabled";
pub const CHANNEL_TEMPERATURE: &str = "temperature";
pub const CHANNEL_TEMPERATURE_ENABLED: &str = "temperature-enabled";
pub const CHANNEL_BATTERY_LEVEL: &str = "battery-level";
pub const CHANNEL_BATTERY_LOW: &str = "battery-low";
pub const CHANNEL_ZIGBEE_STATUS: &str = "zigbee-status";
pub const CHANNEL_LAST_UPDATED: &str = "last-updated";

// Advanced split channels, shown instead of switch/brightness when the
// combined color channel covers them.
pub const CHANNEL_SWITCH_ONLY: &str = "switch-only";
pub const CHANNEL_DIMMING_ONLY: &str = "dimming-only";
pub const CHANNEL_COLOR_XY_ONLY: &str = "color-xy-only";

// ── ChannelValue ─────────────────────────────────────────────────────

/// A value written to a channel.
///
/// `Undef` is a real value, distinct from "don't touch the channel": it
/// tells the host the channel exists but its state is currently unknown
/// (e.g. an unreachable device, or a mirek value flagged invalid).
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelValue {
    Undef,
    OnOff(bool),
    /// Percentage, 0.0..=100.0.
    Percent(f64),
    Number(f64),
    Xy { x: f64, y: f64 },
    Text(String),
}

impl fmt::Display for ChannelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undef => write!(f, "UNDEF"),
            Self::OnOff(true) => write!(f, "ON"),
            Self::OnOff(false) => write!(f, "OFF"),
            Self::Percent(v) => write!(f, "{v}%"),
            Self::Number(v) => write!(f, "{v}"),
            Self::Xy { x, y } => write!(f, "({x}, {y})"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

// ── Channel list reconciliation ──────────────────────────────────────

/// Collapse the supported-channel set into the list a thing exposes.
///
/// When the combined color channel is supported, the plain switch and
/// brightness channels are redundant (color subsumes both) and are
/// replaced with their advanced split variants, so each state slot is
/// exposed exactly once.
pub fn exposed_channels(supported: &BTreeSet<&'static str>) -> Vec<&'static str> {
    let mut exposed: BTreeSet<&'static str> = supported.clone();

    if exposed.contains(CHANNEL_COLOR_XY) {
        if exposed.remove(CHANNEL_SWITCH) {
            exposed.insert(CHANNEL_SWITCH_ONLY);
        }
        if exposed.remove(CHANNEL_BRIGHTNESS) {
            exposed.insert(CHANNEL_DIMMING_ONLY);
        }
        exposed.insert(CHANNEL_COLOR_XY_ONLY);
    }

    exposed.into_iter().collect()
}
