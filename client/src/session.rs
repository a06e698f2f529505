use crate::entity_cache::{Entity, EntityCache};
use crate::reconciler::{
    IncrementalUpdate, Phase, ReconcileError, Reconciler, SnapshotEnvelope, UpdateOutcome,
};
use log::{debug, info};
use shared::{Envelope, Packet, SessionId};

/// Counters for one connection's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames: u64,
    pub applied: u64,
    pub buffered: u64,
    pub dropped: u64,
    pub replayed: u64,
    pub discarded: u64,
}

/// Client-side state of one connection: the entity cache plus the reconciler
/// that feeds it. Dropping the session tears both down; a reconnect starts a
/// new one.
#[derive(Debug)]
pub struct Session {
    cache: EntityCache,
    reconciler: Reconciler,
    local_id: Option<SessionId>,
    worker_id: Option<u32>,
    stats: SessionStats,
}

impl Session {
    pub fn new(max_pending: Option<usize>) -> Self {
        Self {
            cache: EntityCache::new(),
            reconciler: Reconciler::new(max_pending),
            local_id: None,
            worker_id: None,
            stats: SessionStats::default(),
        }
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    pub fn phase(&self) -> Phase {
        self.reconciler.phase()
    }

    pub fn local_id(&self) -> Option<SessionId> {
        self.local_id
    }

    pub fn worker_id(&self) -> Option<u32> {
        self.worker_id
    }

    pub fn local_entity(&self) -> Option<&Entity> {
        self.local_id.and_then(|id| self.cache.get(id))
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Decodes and applies one frame. Frames that do not decode are dropped.
    pub fn handle_envelope(&mut self, envelope: &Envelope) -> Result<(), ReconcileError> {
        self.stats.frames += 1;
        match Packet::from_envelope(envelope) {
            Ok(packet) => self.handle_packet(packet),
            Err(e) => {
                debug!("Dropping `{}` frame: {}", envelope.kind, e);
                self.stats.dropped += 1;
                Ok(())
            }
        }
    }

    pub fn handle_packet(&mut self, packet: Packet) -> Result<(), ReconcileError> {
        match packet {
            Packet::Welcome {
                session_id,
                worker_id,
            } => {
                info!("Joined as {} on worker {}", session_id, worker_id);
                self.local_id = Some(session_id);
                self.worker_id = Some(worker_id);
                self.cache
                    .when_created(session_id, |entity| entity.is_local = true);
            }

            Packet::SnapshotLoad {
                entities,
                snapshot_revision,
            } => {
                let report = self.reconciler.on_snapshot(
                    SnapshotEnvelope {
                        entities,
                        snapshot_revision,
                    },
                    &mut self.cache,
                );
                self.stats.replayed += report.applied.len() as u64;
                self.stats.discarded += (report.discarded + report.orphaned) as u64;
                info!(
                    "Snapshot loaded at revision {:?}: {} entities, {} updates replayed",
                    snapshot_revision,
                    report.materialized,
                    report.applied.len()
                );
            }

            Packet::Spawn { entity } => {
                self.cache.materialize(entity);
            }

            Packet::PositionUpdate {
                entity_id,
                x,
                y,
                revision,
            } => self.apply_update(IncrementalUpdate::position(entity_id, x, y, revision))?,

            Packet::AnimationUpdate {
                entity_id,
                animation,
                revision,
            } => self.apply_update(IncrementalUpdate::animation(
                entity_id, animation, revision,
            ))?,

            Packet::Disconnect { entity_id } => {
                self.cache.remove(entity_id);
            }

            other => {
                debug!("Ignoring client-bound `{}` packet", other.kind());
                self.stats.dropped += 1;
            }
        }

        Ok(())
    }

    fn apply_update(&mut self, update: IncrementalUpdate) -> Result<(), ReconcileError> {
        match self.reconciler.on_incremental_update(update, &mut self.cache)? {
            UpdateOutcome::Applied => self.stats.applied += 1,
            UpdateOutcome::Buffered => self.stats.buffered += 1,
            UpdateOutcome::Dropped(_) => self.stats.dropped += 1,
        }
        Ok(())
    }
}
