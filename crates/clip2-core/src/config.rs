//! Session and thing configuration.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use clip2_api::transport::{TlsMode, TransportConfig};
use clip2_api::types::ResourceType;

/// Default interval between connection checks, in minutes.
pub const DEFAULT_CHECK_MINUTES: u64 = 5;

/// TLS verification policy for the bridge connection.
///
/// Bridges ship a self-signed certificate, so the default accepts it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsVerification {
    System,
    CustomCa(PathBuf),
    #[default]
    DangerAcceptInvalid,
}

impl TlsVerification {
    fn to_tls_mode(&self) -> TlsMode {
        match self {
            Self::System => TlsMode::System,
            Self::CustomCa(path) => TlsMode::CustomCa(path.clone()),
            Self::DangerAcceptInvalid => TlsMode::DangerAcceptInvalid,
        }
    }
}

/// Configuration of one bridge session.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Host name or IP address of the bridge.
    pub host: String,

    /// Application key obtained by pairing. `None` until the first
    /// successful pairing; the session then stores the fresh key
    /// through [`BridgeHost`](crate::host::BridgeHost).
    #[serde(default)]
    pub application_key: Option<SecretString>,

    /// Interval between connection checks, in minutes.
    #[serde(default = "default_check_minutes")]
    pub check_minutes: u64,

    #[serde(default)]
    pub tls: TlsVerification,
}

fn default_check_minutes() -> u64 {
    DEFAULT_CHECK_MINUTES
}

impl BridgeConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            application_key: None,
            check_minutes: DEFAULT_CHECK_MINUTES,
            tls: TlsVerification::default(),
        }
    }

    /// The heartbeat interval derived from `check_minutes`.
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.check_minutes.max(1) * 60)
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            tls: self.tls.to_tls_mode(),
            ..TransportConfig::default()
        }
    }
}

/// Configuration of one thing (a device, room, or zone).
#[derive(Debug, Clone, Deserialize)]
pub struct ThingConfig {
    /// CLIP v2 id of the thing's own resource.
    pub resource_id: String,

    /// Type of the thing's own resource.
    pub resource_type: ResourceType,

    /// Legacy v1 resource id (e.g. `/lights/3`), used once to migrate
    /// item links from the old API binding.
    #[serde(default)]
    pub legacy_id: Option<String>,

    /// Channels the host declares this thing must expose. A required
    /// channel still missing after dependency resolution is logged as a
    /// warning, never a failure.
    #[serde(default)]
    pub required_channels: Vec<String>,
}

impl ThingConfig {
    pub fn new(resource_id: impl Into<String>, resource_type: ResourceType) -> Self {
        Self {
            resource_id: resource_id.into(),
            resource_type,
            legacy_id: None,
            required_channels: Vec::new(),
        }
    }
}
