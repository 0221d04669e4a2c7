//! Session and thing logic between `clip2-api` and a hosting framework.
//!
//! This crate owns the device/session engine for one or more Hue bridges:
//!
//! - **[`BridgeHandler`]** — Session facade managing the full lifecycle:
//!   [`connect()`](BridgeHandler::connect) verifies firmware support and
//!   starts the connection check schedule, which drives pairing, the SSE
//!   event stream, and the post-connect mass download.
//!
//! - **[`ConnectionMonitor`]** — Pure retry/backoff state machine. The
//!   check task feeds it outcomes and schedules the next check from the
//!   delay it returns; no timers live inside it.
//!
//! - **[`ThingHandler`]** — One device, room, or zone: contributor cache,
//!   partial-update merging, channel projection, scene priority, zigbee
//!   connectivity tracking, and command routing.
//!
//! - **Host traits** ([`host`]) — The seams toward the hosting framework:
//!   channel writes, status reporting, key persistence, and discovery.

pub mod bridge;
pub mod channel;
pub mod command;
pub mod config;
pub mod error;
pub mod host;
pub mod monitor;
pub mod projection;
pub mod thing;

// ── Primary re-exports ──────────────────────────────────────────────
pub use bridge::BridgeHandler;
pub use channel::ChannelValue;
pub use command::Command;
pub use config::{BridgeConfig, ThingConfig, TlsVerification};
pub use error::CoreError;
pub use host::{BridgeHost, DiscoveryListener, StatusDetail, ThingHost, ThingStatus};
pub use monitor::{CheckOutcome, ConnectionMonitor, SessionState};
pub use thing::ThingHandler;
