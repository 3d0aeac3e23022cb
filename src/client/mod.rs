//! Scene client
//!
//! Producer side of the protocol:
//! - announcing scenes to renderers, and re-announcing after reconnects
//! - answering subscriptions with a full-state flush
//! - streaming flushes to the renderers subscribed to each scene

pub mod config;
pub mod publisher;

pub use config::ClientConfig;
pub use publisher::{ClientEvent, SceneClient};
