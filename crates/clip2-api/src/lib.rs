// clip2-api: Async Rust client for the Philips Hue CLIP v2 API (REST + SSE)

pub mod client;
pub mod error;
pub mod events;
pub mod transport;
pub mod types;

pub use client::Clip2Client;
pub use error::Error;

/// Application identifier, sent as the user agent and used as the
/// `devicetype` when registering a new application key.
pub const APPLICATION_ID: &str = "clipstream";
