//! Commands and their translation into sparse PUT payloads.
//!
//! A command addresses a channel; the thing handler resolves the channel
//! to a target resource and this module builds the minimal resource
//! carrying exactly the fields the command changes.

use clip2_api::types::{
    Alerts, ColorXy, Dimming, Effects, OnState, Recall, Resource, ResourceReference,
    ResourceType, XyCoordinates,
};

use crate::channel::{
    CHANNEL_ALERT, CHANNEL_BRIGHTNESS, CHANNEL_COLOR_TEMPERATURE, CHANNEL_COLOR_XY,
    CHANNEL_COLOR_XY_ONLY, CHANNEL_DIMMING_ONLY, CHANNEL_EFFECT, CHANNEL_LIGHT_LEVEL_ENABLED,
    CHANNEL_MOTION_ENABLED, CHANNEL_SCENE, CHANNEL_SWITCH, CHANNEL_SWITCH_ONLY,
    CHANNEL_TEMPERATURE_ENABLED,
};
use crate::error::CoreError;

/// A command issued against one channel of a thing.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    OnOff(bool),
    /// Percentage, 0.0..=100.0.
    Percent(f64),
    Xy { x: f64, y: f64 },
    Mirek(u32),
    Text(String),
    /// Re-fetch the thing's contributors instead of writing state. Never
    /// translates to a PUT; the thing handler intercepts it.
    Refresh,
}

/// Build the sparse resource a command PUTs to its target.
pub fn build_payload(
    target: &ResourceReference,
    channel: &str,
    command: &Command,
) -> Result<Resource, CoreError> {
    let id = target.id.clone().ok_or_else(|| {
        CoreError::InvalidConfig("command target reference has no id".into())
    })?;
    let mut payload = Resource::new(id, target.rtype);

    match (channel, command) {
        (CHANNEL_SWITCH | CHANNEL_SWITCH_ONLY, Command::OnOff(on)) => {
            payload.on = Some(OnState { on: *on });
        }
        (CHANNEL_BRIGHTNESS | CHANNEL_DIMMING_ONLY, Command::Percent(percent)) => {
            let brightness = percent.clamp(0.0, 100.0);
            // brightness zero means "off"; the dimming section alone
            // cannot express that
            payload.on = Some(OnState {
                on: brightness > 0.0,
            });
            if brightness > 0.0 {
                payload.dimming = Some(Dimming { brightness });
            }
        }
        (CHANNEL_BRIGHTNESS | CHANNEL_DIMMING_ONLY, Command::OnOff(on)) => {
            payload.on = Some(OnState { on: *on });
        }
        (CHANNEL_COLOR_XY | CHANNEL_COLOR_XY_ONLY, Command::Xy { x, y }) => {
            payload.color = Some(ColorXy {
                xy: XyCoordinates { x: *x, y: *y },
            });
        }
        (CHANNEL_COLOR_TEMPERATURE, Command::Mirek(mirek)) => {
            payload.color_temperature = Some(clip2_api::types::ColorTemperature {
                mirek: Some(*mirek),
                mirek_valid: None,
            });
        }
        (CHANNEL_ALERT, Command::Text(action)) => {
            payload.alert = Some(Alerts {
                action: Some(action.clone()),
                action_values: Vec::new(),
            });
        }
        (CHANNEL_EFFECT, Command::Text(effect)) => {
            payload.effects = Some(Effects {
                effect: Some(effect.clone()),
                effect_values: Vec::new(),
                status: None,
            });
        }
        (CHANNEL_SCENE, Command::OnOff(true)) => {
            // smart scenes use a different recall verb than plain scenes
            let action = if target.rtype == ResourceType::SmartScene {
                "activate"
            } else {
                "active"
            };
            payload.recall = Some(Recall {
                action: Some(action.to_owned()),
            });
        }
        (
            CHANNEL_MOTION_ENABLED | CHANNEL_LIGHT_LEVEL_ENABLED | CHANNEL_TEMPERATURE_ENABLED,
            Command::OnOff(enabled),
        ) => {
            payload.enabled = Some(*enabled);
        }
        _ => {
            return Err(CoreError::UnsupportedCommand {
                channel: channel.to_owned(),
            });
        }
    }

    Ok(payload)
}
