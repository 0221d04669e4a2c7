use thiserror::Error;

/// Top-level error type for the `clip2-api` crate.
///
/// Covers every failure mode of the wire protocol: authentication,
/// transport, resource GET/PUT, pairing, and the SSE event stream.
/// `clip2-core` maps these into thing-status diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// The bridge refused the request (401/403), or the pairing
    /// handshake was rejected because the link button was not pressed.
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request timed out.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// TLS setup or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── API ─────────────────────────────────────────────────────────
    /// The bridge was reachable but rejected the operation or
    /// returned an unexpected status.
    #[error("API error (HTTP {status}): {message}")]
    Api { message: String, status: u16 },

    /// The event stream dropped or could not be established.
    #[error("Event stream error: {0}")]
    EventStream(String),

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if re-pairing (a new application key) might
    /// resolve this error.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } | Self::EventStream(_) => true,
            _ => false,
        }
    }
}
