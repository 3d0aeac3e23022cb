//! # scene-relay
//!
//! Scene publication and display coordination between client processes that
//! produce scene content and renderer processes that draw it.
//!
//! - Scenes are announced by their owning client, subscribed and mapped by a
//!   renderer, and torn down in order when the owner withdraws or goes away
//! - Displays own a registry of framebuffers and offscreen buffers, with
//!   double-buffered render target pairs
//! - Data links feed consumer slots from other scenes or offscreen buffers
//! - Flushes are queued per scene and applied at the frame boundary, with
//!   bounded backpressure
//!
//! ## Renderer
//!
//! ```no_run
//! use scene_relay::renderer::{DisplayConfig, Renderer, RendererConfig};
//!
//! #[tokio::main]
//! async fn main() -> scene_relay::Result<()> {
//!     let (mut renderer, _handle) = Renderer::new(RendererConfig::default()).await?;
//!     renderer.create_display(DisplayConfig::default())?;
//!     renderer.run().await
//! }
//! ```

pub mod client;
pub mod device;
pub mod display;
pub mod error;
pub mod link;
pub mod publication;
pub mod renderer;
pub mod shader_cache;
pub mod stats;
pub mod transport;
pub mod types;
pub mod update;

pub use client::{ClientConfig, SceneClient};
pub use error::{Error, Result};
pub use renderer::{Renderer, RendererCommand, RendererConfig, RendererHandle};
pub use transport::{DiscoveryDaemon, TransportConfig};
pub use types::{BufferHandle, DataSlotId, DisplayId, ParticipantId, ParticipantIdentifier, SceneId};
