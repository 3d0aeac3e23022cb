//! Statistics for renderers and scene clients

use std::time::{Duration, Instant};

/// Renderer-wide statistics
#[derive(Debug, Clone)]
pub struct RendererStats {
    /// When the renderer started
    pub started_at: Instant,
    /// Frame boundaries processed
    pub frames: u64,
    /// Control commands executed
    pub commands_executed: u64,
    /// Control commands rejected
    pub commands_failed: u64,
    /// Flushes applied to replicas
    pub flushes_applied: u64,
    /// Flushes dropped because their payload did not decode
    pub flushes_rejected: u64,
    /// Flushes applied without waiting for resources
    pub force_applies: u64,
    /// Scenes unsubscribed because their queue overflowed
    pub force_unsubscribes: u64,
    /// Buffers drawn across all displays
    pub buffers_rendered: u64,
    /// Payload bytes currently queued
    pub pending_bytes: usize,
}

impl Default for RendererStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RendererStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            frames: 0,
            commands_executed: 0,
            commands_failed: 0,
            flushes_applied: 0,
            flushes_rejected: 0,
            force_applies: 0,
            force_unsubscribes: 0,
            buffers_rendered: 0,
            pending_bytes: 0,
        }
    }

    /// Time since the renderer started
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Average frame boundaries per second
    pub fn frame_rate(&self) -> f64 {
        let secs = self.uptime().as_secs_f64();
        if secs > 0.0 {
            self.frames as f64 / secs
        } else {
            0.0
        }
    }
}

/// Per-client publishing statistics
#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    /// Scenes currently published
    pub published_scenes: u64,
    /// Flushes sent, counted once per subscriber
    pub flushes_sent: u64,
    /// Payload bytes sent
    pub bytes_sent: u64,
    /// Subscriptions acknowledged
    pub subscriptions: u64,
    /// Sends that failed because the session was gone
    pub failed_sends: u64,
}

impl ClientStats {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renderer_stats_new() {
        let stats = RendererStats::new();
        assert_eq!(stats.frames, 0);
        assert_eq!(stats.flushes_applied, 0);
        assert_eq!(stats.force_unsubscribes, 0);
        assert!(stats.frame_rate() >= 0.0);
    }

    #[test]
    fn test_client_stats_new() {
        let stats = ClientStats::new();
        assert_eq!(stats.flushes_sent, 0);
        assert_eq!(stats.bytes_sent, 0);
    }
}
