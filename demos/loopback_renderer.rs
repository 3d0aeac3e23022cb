//! Renderer and scene client over loopback TCP
//!
//! Run with: cargo run --example loopback_renderer
//!
//! Set RUST_LOG=scene_relay=debug to see every message and device call.
//!
//! The client publishes one scene with a counter slot. The control side
//! waits for the scene to show up in a frame snapshot, then subscribes,
//! maps and shows it. The client keeps flushing until Ctrl+C.

use std::time::Duration;

use bytes::Bytes;
use tracing_subscriber::EnvFilter;

use scene_relay::client::{ClientConfig, ClientEvent, SceneClient};
use scene_relay::device::{DeviceBackend, DeviceLog};
use scene_relay::link::{DataType, SlotRole};
use scene_relay::publication::SceneState;
use scene_relay::renderer::{DisplayConfig, Renderer, RendererCommand, RendererConfig};
use scene_relay::transport::TransportConfig;
use scene_relay::types::{DataSlotId, ParticipantIdentifier, SceneId};
use scene_relay::update::SceneOp;

const SCENE: SceneId = SceneId(42);
const COUNTER: DataSlotId = DataSlotId(1);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scene_relay=info")))
        .init();

    let loopback = TransportConfig::default().bind("127.0.0.1:0".parse()?);

    let log = DeviceLog::new();
    let config = RendererConfig::new(ParticipantIdentifier::unresolved(1, "loopback-renderer"))
        .max_frame_rate(30)
        .transport(loopback.clone())
        .device(DeviceBackend::Logging(log.clone()));
    let (renderer, handle) = Renderer::new(config).await?;
    let renderer_identity = renderer.identity().clone();
    println!("Renderer listening on {}", renderer_identity);

    let display = handle.create_display(DisplayConfig::default()).await?;
    let renderer_task = tokio::spawn(renderer.run_until(async {
        let _ = tokio::signal::ctrl_c().await;
    }));

    let mut client = SceneClient::new(
        ClientConfig::new(ParticipantIdentifier::unresolved(2, "loopback-client")).transport(loopback),
    )
    .await?;
    client.publish(SCENE, "counter")?;
    client.connect(&renderer_identity).await?;

    // Control side: bring the scene on screen once the renderer knows it
    let control = handle.clone();
    tokio::spawn(async move {
        let mut frames = control.frames();
        while frames.changed().await.is_ok() {
            let published = frames
                .borrow()
                .scene(SCENE)
                .map_or(false, |s| s.state == SceneState::Published);
            if published {
                break;
            }
        }
        for command in [
            RendererCommand::SubscribeScene(SCENE),
            RendererCommand::MapScene {
                scene: SCENE,
                display,
                buffer: None,
                render_order: 0,
            },
            RendererCommand::ShowScene(SCENE),
        ] {
            if control.submit(command).await.is_err() {
                return;
            }
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    let mut counter: u64 = 0;
    loop {
        tokio::select! {
            event = client.next_event() => match event {
                Some(ClientEvent::Subscribed { scene, renderer }) => {
                    println!("{} subscribed by {}", scene, renderer);
                    client.flush(scene, &[SceneOp::DeclareSlot {
                        slot: COUNTER,
                        role: SlotRole::Provider,
                        data_type: DataType::Value(0),
                    }])?;
                }
                Some(other) => println!("Client event: {:?}", other),
                None => break,
            },
            _ = ticker.tick() => {
                if client.subscribers(SCENE).is_empty() {
                    continue;
                }
                counter += 1;
                client.flush(SCENE, &[SceneOp::SetValue {
                    slot: COUNTER,
                    value: Bytes::from(counter.to_be_bytes().to_vec()),
                }])?;
                if counter % 10 == 0 {
                    let frame = handle.latest_frame();
                    println!(
                        "frame={} state={:?} device_calls={} bytes_sent={}",
                        frame.frame,
                        frame.scene(SCENE).map(|s| s.state),
                        log.len(),
                        client.stats().bytes_sent,
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.shutdown();
    renderer_task.await??;
    println!("Stopped");
    Ok(())
}
