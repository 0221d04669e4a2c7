use thiserror::Error;

/// Top-level error type for the `clip2-core` crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Error from the underlying CLIP v2 API client.
    #[error(transparent)]
    Api(#[from] clip2_api::Error),

    /// The session is not connected (no client yet, or disposed).
    #[error("Bridge session is not connected")]
    BridgeDisconnected,

    /// The bridge firmware is too old for CLIP v2.
    #[error("Bridge firmware does not support CLIP v2 (upgrade required)")]
    Clip2NotSupported,

    /// A configuration value is missing or invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The host's configuration store rejected a write.
    #[error("Configuration is read-only")]
    ConfigReadOnly,

    /// The command does not apply to the addressed channel, or the
    /// channel has no known command target resource.
    #[error("Channel '{channel}' cannot handle this command")]
    UnsupportedCommand { channel: String },
}
