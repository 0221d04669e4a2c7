// Shared transport configuration for building reqwest::Client instances.
//
// The resource client, the pairing client, and the SSE stream all share
// TLS and timeout settings through this module. Hue bridges present a
// self-signed certificate, so the default TLS mode accepts it.

use std::path::PathBuf;
use std::time::Duration;

/// TLS verification mode.
#[derive(Debug, Clone)]
pub enum TlsMode {
    /// Use the system certificate store.
    System,
    /// Use a custom CA certificate from the given PEM file
    /// (e.g. the Signify root CA for newer bridge firmware).
    CustomCa(PathBuf),
    /// Accept any certificate (bridges ship a self-signed cert).
    DangerAcceptInvalid,
}

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tls: TlsMode,
    pub timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: TlsMode::DangerAcceptInvalid,
            timeout: Duration::from_secs(10),
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, crate::error::Error> {
        self.builder()?
            .timeout(self.timeout)
            .build()
            .map_err(|e| crate::error::Error::Tls(format!("failed to build HTTP client: {e}")))
    }

    /// Build a `reqwest::Client` without a total-request timeout.
    ///
    /// Used by the SSE event stream, where the response body is open-ended
    /// and a whole-request timeout would kill the subscription. A connect
    /// timeout still applies.
    pub fn build_streaming_client(&self) -> Result<reqwest::Client, crate::error::Error> {
        self.builder()?
            .connect_timeout(self.timeout)
            .build()
            .map_err(|e| crate::error::Error::Tls(format!("failed to build HTTP client: {e}")))
    }

    fn builder(&self) -> Result<reqwest::ClientBuilder, crate::error::Error> {
        let mut builder = reqwest::Client::builder().user_agent(crate::APPLICATION_ID);

        match &self.tls {
            TlsMode::System => {}
            TlsMode::CustomCa(path) => {
                let cert_pem = std::fs::read(path).map_err(|e| {
                    crate::error::Error::Tls(format!("failed to read CA cert: {e}"))
                })?;
                let cert = reqwest::Certificate::from_pem(&cert_pem)
                    .map_err(|e| crate::error::Error::Tls(format!("invalid CA cert: {e}")))?;
                builder = builder.add_root_certificate(cert);
            }
            TlsMode::DangerAcceptInvalid => {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        Ok(builder)
    }
}
