//! Scene update applier
//!
//! Flushes are queued per scene as they arrive and applied at the frame
//! boundary. Scenes that are only subscribed apply everything pending. Mapped
//! scenes apply flushes in order until [`ResourceReadiness`] reports one is not
//! ready; the rest stay queued.
//!
//! Queue depth is bounded in two places:
//!
//! - at the boundary, a blocked queue deeper than `force_apply_limit` is
//!   applied regardless of readiness
//! - on arrival, a queue deeper than `force_unsubscribe_limit` is discarded
//!   and the scene is reported for forced unsubscription
//!
//! [`BackpressurePolicy`] selects which of the two actions may be taken.

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::publication::SceneState;
use crate::types::SceneId;

use super::decoder::{SceneUpdateDecoder, SlotRecordDecoder};
use super::queue::{PendingFlush, PendingFlushQueue};
use super::replica::{SceneReplica, SlotChange};

/// What to do when a scene's flush queue grows past its limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Force-apply past `force_apply_limit`, force-unsubscribe past `force_unsubscribe_limit`
    #[default]
    ForceApplyThenUnsubscribe,
    /// Only force-apply; arrival past `force_unsubscribe_limit` also force-applies
    ForceApplyOnly,
    /// Never apply unready flushes; unsubscribe past `force_unsubscribe_limit`
    ForceUnsubscribeOnly,
}

impl BackpressurePolicy {
    fn allows_force_apply(self) -> bool {
        !matches!(self, BackpressurePolicy::ForceUnsubscribeOnly)
    }

    fn allows_force_unsubscribe(self) -> bool {
        !matches!(self, BackpressurePolicy::ForceApplyOnly)
    }
}

/// Update applier configuration
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    /// Pending flushes tolerated on a blocked scene before force-applying
    pub force_apply_limit: usize,

    /// Pending flushes tolerated before the scene is force-unsubscribed
    pub force_unsubscribe_limit: usize,

    /// Which backpressure actions are allowed
    pub policy: BackpressurePolicy,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            force_apply_limit: 60,
            force_unsubscribe_limit: 120,
            policy: BackpressurePolicy::default(),
        }
    }
}

impl UpdateConfig {
    /// Set both queue limits
    pub fn limits(mut self, force_apply: usize, force_unsubscribe: usize) -> Self {
        self.force_apply_limit = force_apply;
        self.force_unsubscribe_limit = force_unsubscribe;
        self
    }

    /// Set the backpressure policy
    pub fn policy(mut self, policy: BackpressurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.force_apply_limit == 0 || self.force_unsubscribe_limit == 0 {
            return Err(Error::Config("pending flush limits must be non-zero".into()));
        }
        if self.policy == BackpressurePolicy::ForceApplyThenUnsubscribe
            && self.force_unsubscribe_limit < self.force_apply_limit
        {
            return Err(Error::Config(format!(
                "force unsubscribe limit {} is below force apply limit {}",
                self.force_unsubscribe_limit, self.force_apply_limit
            )));
        }
        Ok(())
    }
}

/// Decides whether a queued flush can be applied now
///
/// Typically backed by the device: a flush referencing resources that are not
/// uploaded yet is not ready.
pub trait ResourceReadiness {
    fn is_ready(&self, scene: SceneId, flush: &PendingFlush) -> bool;
}

/// Readiness check that never blocks
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReady;

impl ResourceReadiness for AlwaysReady {
    fn is_ready(&self, _scene: SceneId, _flush: &PendingFlush) -> bool {
        true
    }
}

impl<F> ResourceReadiness for F
where
    F: Fn(SceneId, &PendingFlush) -> bool,
{
    fn is_ready(&self, scene: SceneId, flush: &PendingFlush) -> bool {
        self(scene, flush)
    }
}

/// One flush that made it into the replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedFlush {
    pub flush_index: u64,
    pub expires_at: Option<u64>,
    pub changes: Vec<SlotChange>,
}

/// Result of queueing a flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Flush waits for the next boundary
    Queued { depth: usize },
    /// Queue overflowed and everything pending was applied
    ForceApplied(Vec<AppliedFlush>),
    /// Queue overflowed and was discarded; the scene must be unsubscribed
    ForceUnsubscribe { discarded: usize },
    /// Scene does not accept content in its current state
    Dropped,
}

/// How a scene's queue fared at a frame boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending
    Idle,
    /// Every pending flush was applied
    Applied,
    /// Some flushes wait for resources
    Blocked { pending: usize },
    /// Blocked flushes were applied regardless of readiness
    ForceApplied,
    /// Queue was discarded; the scene must be unsubscribed
    ForceUnsubscribe { discarded: usize },
}

/// Per-scene report from [`SceneUpdateApplier::apply_pending`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub scene: SceneId,
    pub outcome: FlushOutcome,
    pub applied: Vec<AppliedFlush>,
    /// Flushes dropped because their payload did not decode
    pub rejected: usize,
}

/// Queues and applies scene content flushes
pub struct SceneUpdateApplier {
    config: UpdateConfig,
    decoder: Box<dyn SceneUpdateDecoder>,
    queues: HashMap<SceneId, PendingFlushQueue>,
    replicas: HashMap<SceneId, SceneReplica>,
}

impl SceneUpdateApplier {
    /// Create an applier using the default record decoder
    pub fn new(config: UpdateConfig) -> Self {
        Self::with_decoder(config, Box::new(SlotRecordDecoder))
    }

    pub fn with_decoder(config: UpdateConfig, decoder: Box<dyn SceneUpdateDecoder>) -> Self {
        Self {
            config,
            decoder,
            queues: HashMap::new(),
            replicas: HashMap::new(),
        }
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    /// Change the queue limits at runtime
    pub fn set_limits(&mut self, force_apply: usize, force_unsubscribe: usize) {
        self.config.force_apply_limit = force_apply;
        self.config.force_unsubscribe_limit = force_unsubscribe;
        tracing::info!(force_apply, force_unsubscribe, "Pending flush limits changed");
    }

    /// Queue a flush received for `scene`
    pub fn enqueue(
        &mut self,
        scene: SceneId,
        state: SceneState,
        flush_index: u64,
        payload: Bytes,
    ) -> EnqueueOutcome {
        self.enqueue_flush(scene, state, PendingFlush::new(flush_index, payload))
    }

    /// Queue a flush that carries more than index and payload
    pub fn enqueue_flush(&mut self, scene: SceneId, state: SceneState, flush: PendingFlush) -> EnqueueOutcome {
        if !state.receives_content() {
            tracing::debug!(
                scene = %scene,
                state = ?state,
                flush_index = flush.flush_index,
                "Flush for scene without subscription dropped"
            );
            return EnqueueOutcome::Dropped;
        }

        let queue = self.queues.entry(scene).or_default();
        let depth = queue.push(flush);
        if depth <= self.config.force_unsubscribe_limit {
            return EnqueueOutcome::Queued { depth };
        }

        if self.config.policy.allows_force_unsubscribe() {
            let discarded = queue.clear();
            tracing::error!(
                scene = %scene,
                discarded,
                limit = self.config.force_unsubscribe_limit,
                "Pending flush queue overflowed, forcing unsubscribe"
            );
            EnqueueOutcome::ForceUnsubscribe { discarded }
        } else {
            tracing::error!(
                scene = %scene,
                depth,
                limit = self.config.force_unsubscribe_limit,
                "Pending flush queue overflowed, forcing apply"
            );
            let (applied, _) = self.drain(scene, None);
            EnqueueOutcome::ForceApplied(applied)
        }
    }

    /// Apply what can be applied for one scene at the frame boundary
    pub fn apply_pending(
        &mut self,
        scene: SceneId,
        state: SceneState,
        readiness: &dyn ResourceReadiness,
    ) -> ApplyReport {
        let mut report = ApplyReport {
            scene,
            outcome: FlushOutcome::Idle,
            applied: Vec::new(),
            rejected: 0,
        };
        let pending = self.queues.get(&scene).map_or(0, PendingFlushQueue::len);
        if pending == 0 || !state.receives_content() {
            return report;
        }

        // Scenes that are not on screen have nothing to wait for
        let gate = if state.is_mapped() { Some(readiness) } else { None };
        let (applied, rejected) = self.drain(scene, gate);
        report.applied = applied;
        report.rejected = rejected;

        let Some(queue) = self.queues.get_mut(&scene) else {
            report.outcome = FlushOutcome::Applied;
            return report;
        };
        if queue.is_empty() {
            queue.mark_unblocked();
            report.outcome = FlushOutcome::Applied;
            return report;
        }

        queue.mark_blocked();
        let depth = queue.len();
        let policy = self.config.policy;
        if policy.allows_force_apply() && depth > self.config.force_apply_limit {
            tracing::error!(
                scene = %scene,
                depth,
                blocked_frames = queue.blocked_frames(),
                "Resources not ready for too many flushes, forcing apply"
            );
            let (applied, rejected) = self.drain(scene, None);
            report.applied.extend(applied);
            report.rejected += rejected;
            report.outcome = FlushOutcome::ForceApplied;
        } else if policy.allows_force_unsubscribe() && depth > self.config.force_unsubscribe_limit {
            let discarded = self.discard(scene);
            tracing::error!(scene = %scene, discarded, "Blocked flush queue overflowed, forcing unsubscribe");
            report.outcome = FlushOutcome::ForceUnsubscribe { discarded };
        } else {
            tracing::debug!(scene = %scene, pending = depth, "Flushes blocked on resources");
            report.outcome = FlushOutcome::Blocked { pending: depth };
        }
        report
    }

    /// Pop and apply flushes in order, stopping at the first one `gate` rejects
    fn drain(
        &mut self,
        scene: SceneId,
        gate: Option<&dyn ResourceReadiness>,
    ) -> (Vec<AppliedFlush>, usize) {
        let mut applied = Vec::new();
        let mut rejected = 0;
        let Some(queue) = self.queues.get_mut(&scene) else {
            return (applied, rejected);
        };

        while let Some(front) = queue.front() {
            if let Some(gate) = gate {
                if !gate.is_ready(scene, front) {
                    break;
                }
            }
            let Some(flush) = queue.pop() else { break };

            match self.decoder.decode(scene, &flush.payload) {
                Ok(ops) => {
                    let replica = self
                        .replicas
                        .entry(scene)
                        .or_insert_with(|| SceneReplica::new(scene));
                    let changes = replica.apply(flush.flush_index, ops);
                    tracing::debug!(
                        scene = %scene,
                        flush_index = flush.flush_index,
                        changes = changes.len(),
                        "Flush applied"
                    );
                    applied.push(AppliedFlush {
                        flush_index: flush.flush_index,
                        expires_at: flush.expires_at,
                        changes,
                    });
                }
                Err(e) => {
                    tracing::warn!(scene = %scene, flush_index = flush.flush_index, error = %e, "Flush rejected");
                    rejected += 1;
                }
            }
        }
        (applied, rejected)
    }

    /// Drop pending flushes of a scene, returns how many were dropped
    ///
    /// The replica is kept; see [`SceneUpdateApplier::remove_scene`].
    pub fn discard(&mut self, scene: SceneId) -> usize {
        let discarded = self.queues.remove(&scene).map_or(0, |mut q| q.clear());
        if discarded > 0 {
            tracing::info!(scene = %scene, discarded, "Pending flushes discarded");
        }
        discarded
    }

    /// Forget everything about a scene
    pub fn remove_scene(&mut self, scene: SceneId) -> usize {
        self.replicas.remove(&scene);
        self.discard(scene)
    }

    /// Scenes with queued flushes
    pub fn scenes_with_pending(&self) -> Vec<SceneId> {
        let mut scenes: Vec<SceneId> = self
            .queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(scene, _)| *scene)
            .collect();
        scenes.sort();
        scenes
    }

    /// Earliest expiration stamp among a scene's queued flushes
    pub fn earliest_pending_expiration(&self, scene: SceneId) -> Option<u64> {
        self.queues.get(&scene).and_then(PendingFlushQueue::earliest_expiration)
    }

    pub fn pending(&self, scene: SceneId) -> usize {
        self.queues.get(&scene).map_or(0, PendingFlushQueue::len)
    }

    /// Total queued flushes across scenes
    pub fn total_pending(&self) -> usize {
        self.queues.values().map(PendingFlushQueue::len).sum()
    }

    /// Total queued payload bytes across scenes
    pub fn pending_bytes(&self) -> usize {
        self.queues.values().map(PendingFlushQueue::bytes).sum()
    }

    pub fn replica(&self, scene: SceneId) -> Option<&SceneReplica> {
        self.replicas.get(&scene)
    }

    pub fn replicas(&self) -> impl Iterator<Item = &SceneReplica> {
        self.replicas.values()
    }
}
