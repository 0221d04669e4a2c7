//! REST client for the CLIP v2 resource endpoints.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;
use crate::types::{Resource, ResourceReference, Resources};

/// Name of the header carrying the application key.
pub const APPLICATION_KEY_HEADER: &str = "hue-application-key";

/// Minimum bridge firmware version with CLIP v2 support.
pub const MIN_CLIP2_SWVERSION: u64 = 1_948_086_000;

/// Minimum gap between consecutive requests. The bridge drops or
/// garbles responses when requests arrive back to back.
const REQUEST_INTERVAL: Duration = Duration::from_millis(100);

/// Async client for one Hue bridge.
///
/// Cheap to clone is not needed here; the owning session wraps it in an
/// `Arc`. All requests are serialized through an internal throttle so no
/// two requests hit the bridge within [`REQUEST_INTERVAL`] of each other.
#[derive(Debug)]
pub struct Clip2Client {
    http: reqwest::Client,
    resource_base: Url,
    config_url: Url,
    pairing_url: Url,
    event_url: Url,
    application_key: SecretString,
    throttle: Mutex<Option<Instant>>,
}

impl Clip2Client {
    /// Create a client for the bridge at `host`.
    pub fn new(
        host: &str,
        application_key: SecretString,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        Ok(Self {
            http: transport.build_client()?,
            resource_base: Url::parse(&format!("https://{host}/clip/v2/resource/"))?,
            config_url: Url::parse(&format!("https://{host}/api/0/config"))?,
            pairing_url: Url::parse(&format!("https://{host}/api"))?,
            event_url: Url::parse(&format!("https://{host}/eventstream/clip/v2"))?,
            application_key,
            throttle: Mutex::new(None),
        })
    }

    /// Create a client with every endpoint rooted at an arbitrary base URL.
    ///
    /// Intended for tests against a local mock server.
    pub fn with_base_url(
        base: &str,
        application_key: SecretString,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let base = Url::parse(base)?;
        Ok(Self {
            http: transport.build_client()?,
            resource_base: base.join("clip/v2/resource/")?,
            config_url: base.join("api/0/config")?,
            pairing_url: base.join("api")?,
            event_url: base.join("eventstream/clip/v2")?,
            application_key,
            throttle: Mutex::new(None),
        })
    }

    /// URL of the SSE event stream for this bridge.
    pub fn event_url(&self) -> &Url {
        &self.event_url
    }

    /// The application key this client authenticates with.
    pub(crate) fn application_key(&self) -> &SecretString {
        &self.application_key
    }

    pub(crate) fn streaming_http(
        transport: &TransportConfig,
    ) -> Result<reqwest::Client, Error> {
        transport.build_streaming_client()
    }

    /// GET the resource(s) addressed by `reference`.
    ///
    /// A reference without an id fetches the whole collection of its type.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn get_resources(
        &self,
        reference: &ResourceReference,
    ) -> Result<Vec<Resource>, Error> {
        let url = self.resource_url(reference)?;
        self.throttle().await;

        let response = self
            .http
            .get(url)
            .header(APPLICATION_KEY_HEADER, self.application_key.expose_secret())
            .send()
            .await?;

        let resources = Self::handle_response(response).await?;
        Ok(resources.data)
    }

    /// PUT a (sparse) resource, applying its present fields as a command.
    ///
    /// Per-field rejections in the response error list are logged as
    /// warnings; the call still succeeds.
    #[tracing::instrument(skip(self, resource), fields(id = %resource.id, rtype = %resource.rtype), level = "debug")]
    pub async fn put_resource(&self, resource: &Resource) -> Result<Resources, Error> {
        let url = self.resource_url(&resource.reference())?;
        self.throttle().await;

        let response = self
            .http
            .put(url)
            .header(APPLICATION_KEY_HEADER, self.application_key.expose_secret())
            .json(resource)
            .send()
            .await?;

        let resources = Self::handle_response(response).await?;
        for error in &resources.errors {
            tracing::warn!(
                id = %resource.id,
                rtype = %resource.rtype,
                "bridge rejected field: {}",
                error.description
            );
        }
        Ok(resources)
    }

    /// Check whether the bridge firmware supports CLIP v2.
    ///
    /// Reads the unauthenticated `/api/0/config` endpoint and compares
    /// `swversion` against [`MIN_CLIP2_SWVERSION`].
    pub async fn is_clip2_supported(&self) -> Result<bool, Error> {
        #[derive(Deserialize)]
        struct BridgeConfigInfo {
            #[serde(default)]
            swversion: String,
        }

        let response = self.http.get(self.config_url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Api {
                message: format!("config endpoint returned {status}"),
                status: status.as_u16(),
            });
        }
        let info: BridgeConfigInfo = response.json().await?;
        Ok(info
            .swversion
            .parse::<u64>()
            .is_ok_and(|v| v >= MIN_CLIP2_SWVERSION))
    }

    /// Attempt one pairing handshake, returning a fresh application key.
    ///
    /// Fails with [`Error::Unauthorized`] until the user presses the
    /// link button on the bridge; the caller retries on a timer.
    pub async fn register_application_key(
        &self,
        device_type: &str,
    ) -> Result<SecretString, Error> {
        #[derive(Deserialize)]
        struct Entry {
            success: Option<PairingSuccess>,
            error: Option<PairingError>,
        }
        #[derive(Deserialize)]
        struct PairingSuccess {
            username: String,
        }
        #[derive(Deserialize)]
        struct PairingError {
            #[serde(default)]
            description: String,
        }

        let response = self
            .http
            .post(self.pairing_url.clone())
            .json(&json!({
                "devicetype": device_type,
                "generateclientkey": true,
            }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Api {
                message: body,
                status: status.as_u16(),
            });
        }

        let entries: Vec<Entry> =
            serde_json::from_str(&body).map_err(|e| Error::Deserialization {
                message: e.to_string(),
                body: body.clone(),
            })?;

        for entry in entries {
            if let Some(success) = entry.success {
                return Ok(SecretString::from(success.username));
            }
            if let Some(error) = entry.error {
                return Err(Error::Unauthorized {
                    message: error.description,
                });
            }
        }
        Err(Error::Deserialization {
            message: "pairing response had neither success nor error".into(),
            body,
        })
    }

    fn resource_url(&self, reference: &ResourceReference) -> Result<Url, Error> {
        let mut url = self.resource_base.join(&reference.rtype.to_string())?;
        if let Some(id) = &reference.id {
            url = url.join(&format!("{}/{id}", reference.rtype))?;
        }
        Ok(url)
    }

    /// Wait out the minimum inter-request gap.
    async fn throttle(&self) {
        let mut last = self.throttle.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < REQUEST_INTERVAL {
                tokio::time::sleep(REQUEST_INTERVAL - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn handle_response(response: reqwest::Response) -> Result<Resources, Error> {
        let status = response.status();
        let body = response.text().await?;

        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(Error::Unauthorized { message: body });
        }
        if !status.is_success() {
            // Error bodies usually carry the envelope's error list; fall
            // back to the raw body when they don't.
            let message = serde_json::from_str::<Resources>(&body)
                .ok()
                .and_then(|r| r.errors.first().map(|e| e.description.clone()))
                .unwrap_or(body);
            return Err(Error::Api {
                message,
                status: status.as_u16(),
            });
        }

        serde_json::from_str(&body).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body,
        })
    }
}
