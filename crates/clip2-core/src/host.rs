//! Integration seams toward the hosting framework.
//!
//! The session and thing handlers never talk to a UI or automation
//! framework directly; they report status, channel state, and discovered
//! resources through these traits. Tests plug in recording fakes.

use std::collections::HashMap;

use secrecy::SecretString;

use clip2_api::types::Resource;

use crate::channel::ChannelValue;
use crate::error::CoreError;

/// Lifecycle status of a bridge session or thing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThingStatus {
    Unknown,
    Online,
    Offline,
}

/// Why a status is what it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusDetail {
    #[default]
    None,
    /// Bad or missing configuration (unsupported firmware, bad host).
    ConfigurationError,
    /// The bridge or device is unreachable.
    CommunicationError,
    /// The owning bridge session is offline.
    BridgeOffline,
    /// The resource no longer exists on the bridge.
    Gone,
    /// Waiting for the user to press the link button.
    PairingInProgress,
}

/// Callbacks a thing handler raises toward its host.
pub trait ThingHost: Send + Sync {
    /// Write a value to a channel.
    fn update_channel(&self, channel: &str, value: ChannelValue);

    /// Report a status change.
    fn set_status(&self, status: ThingStatus, detail: StatusDetail, message: Option<String>);

    /// The set of channels this thing exposes changed.
    fn channels_changed(&self, channels: &[&'static str]);

    /// Firmware/model properties learned from the device resource.
    fn update_properties(&self, properties: &HashMap<String, String>) {
        let _ = properties;
    }

    /// Copy channel/item links over from the legacy (v1) thing this one
    /// replaces. Called at most once, when a legacy id is configured.
    fn replicate_legacy_links(&self, channels: &[&'static str]) {
        let _ = channels;
    }

    /// The friendly names of the scenes recallable on this thing, for
    /// command option hints.
    fn set_scene_options(&self, names: &[String]) {
        let _ = names;
    }
}

/// Callbacks a bridge session raises toward its host.
pub trait BridgeHost: Send + Sync {
    /// Report a status change.
    fn set_status(&self, status: ThingStatus, detail: StatusDetail, message: Option<String>);

    /// Pairing succeeded; persist the fresh application key.
    ///
    /// A host whose configuration store is read-only fails with
    /// [`CoreError::ConfigReadOnly`]; the session surfaces that as a
    /// configuration error.
    fn store_application_key(&self, key: &SecretString) -> Result<(), CoreError>;

    /// Bridge name/model/firmware properties learned from the bridge
    /// device resource.
    fn update_properties(&self, properties: &HashMap<String, String>) {
        let _ = properties;
    }
}

/// Receiver for resources that no registered thing claims.
pub trait DiscoveryListener: Send + Sync {
    fn resource_found(&self, resource: &Resource);
}
