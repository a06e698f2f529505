//! Snapshot reconciliation for a freshly (re)connected client.
//!
//! Updates that arrive before the snapshot are buffered, never applied. When
//! the snapshot lands its entities are written into the cache, the buffered
//! updates newer than the snapshot revision are replayed in revision order,
//! and the buffers are dropped. From then on updates apply directly and the
//! last write per entity wins.
//!
//! The phase only moves forward. A new connection gets a new `Reconciler`.

use crate::entity_cache::{EntityCache, EntityFields};
use log::{debug, warn};
use shared::{EntitySnapshot, Revision, SessionId};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingSnapshot,
    /// Only observable while `on_snapshot` replays the buffer.
    Reconciling,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Movement,
    Animation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdatePayload {
    Position { x: f32, y: f32 },
    Animation { animation: String },
}

impl UpdatePayload {
    pub fn stream(&self) -> Stream {
        match self {
            UpdatePayload::Position { .. } => Stream::Movement,
            UpdatePayload::Animation { .. } => Stream::Animation,
        }
    }

    fn into_fields(self) -> EntityFields {
        match self {
            UpdatePayload::Position { x, y } => EntityFields::position(x, y),
            UpdatePayload::Animation { animation } => EntityFields::animation(animation),
        }
    }
}

/// An incremental update as received from the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct IncrementalUpdate {
    pub entity_id: SessionId,
    pub payload: UpdatePayload,
    pub revision: Option<Revision>,
}

impl IncrementalUpdate {
    pub fn position(entity_id: SessionId, x: f32, y: f32, revision: Option<Revision>) -> Self {
        Self {
            entity_id,
            payload: UpdatePayload::Position { x, y },
            revision,
        }
    }

    pub fn animation(
        entity_id: SessionId,
        animation: impl Into<String>,
        revision: Option<Revision>,
    ) -> Self {
        Self {
            entity_id,
            payload: UpdatePayload::Animation {
                animation: animation.into(),
            },
            revision,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpdate {
    pub entity_id: SessionId,
    pub payload: UpdatePayload,
    pub revision: Revision,
    arrival: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEnvelope {
    pub entities: Vec<EntitySnapshot>,
    pub snapshot_revision: Option<Revision>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    MissingRevision,
    UnknownEntity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Buffered,
    Applied,
    Dropped(DropReason),
}

/// What a snapshot did to the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub materialized: usize,
    /// Revisions applied from the buffer, in application order.
    pub applied: Vec<Revision>,
    /// Buffered updates at or below the snapshot revision.
    pub discarded: usize,
    /// Buffered updates newer than the snapshot whose entity does not exist.
    pub orphaned: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("{limit} updates buffered without a snapshot")]
    BufferOverflow { limit: usize },
}

#[derive(Debug)]
pub struct Reconciler {
    phase: Phase,
    snapshot_revision: Option<Revision>,
    movement: Vec<PendingUpdate>,
    animation: Vec<PendingUpdate>,
    next_arrival: u64,
    max_pending: Option<usize>,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Reconciler {
    /// `max_pending` bounds the pre-snapshot buffers; `None` buffers without limit.
    pub fn new(max_pending: Option<usize>) -> Self {
        Self {
            phase: Phase::AwaitingSnapshot,
            snapshot_revision: None,
            movement: Vec::new(),
            animation: Vec::new(),
            next_arrival: 0,
            max_pending,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn snapshot_revision(&self) -> Option<Revision> {
        self.snapshot_revision
    }

    pub fn pending_len(&self) -> usize {
        self.movement.len() + self.animation.len()
    }

    pub fn pending(&self, stream: Stream) -> &[PendingUpdate] {
        match stream {
            Stream::Movement => &self.movement,
            Stream::Animation => &self.animation,
        }
    }

    pub fn on_incremental_update(
        &mut self,
        update: IncrementalUpdate,
        cache: &mut EntityCache,
    ) -> Result<UpdateOutcome, ReconcileError> {
        let Some(revision) = update.revision else {
            debug!(
                "Dropping {:?} update for entity {} without revision",
                update.payload.stream(),
                update.entity_id
            );
            return Ok(UpdateOutcome::Dropped(DropReason::MissingRevision));
        };

        if self.phase != Phase::AwaitingSnapshot {
            return Ok(if cache.update(update.entity_id, update.payload.into_fields()) {
                UpdateOutcome::Applied
            } else {
                UpdateOutcome::Dropped(DropReason::UnknownEntity)
            });
        }

        if let Some(limit) = self.max_pending {
            if self.pending_len() >= limit {
                return Err(ReconcileError::BufferOverflow { limit });
            }
        }

        let pending = PendingUpdate {
            entity_id: update.entity_id,
            revision,
            arrival: self.next_arrival,
            payload: update.payload,
        };
        self.next_arrival += 1;

        match pending.payload.stream() {
            Stream::Movement => self.movement.push(pending),
            Stream::Animation => self.animation.push(pending),
        }
        Ok(UpdateOutcome::Buffered)
    }

    pub fn on_snapshot(&mut self, snapshot: SnapshotEnvelope, cache: &mut EntityCache) -> ReplayReport {
        let mut report = ReplayReport {
            materialized: snapshot.entities.len(),
            ..ReplayReport::default()
        };

        if self.phase != Phase::AwaitingSnapshot {
            warn!(
                "Snapshot received in {:?} phase, refreshing entities without replay",
                self.phase
            );
            for entity in snapshot.entities {
                cache.materialize(entity);
            }
            return report;
        }

        self.phase = Phase::Reconciling;
        self.snapshot_revision = snapshot.snapshot_revision;

        for entity in snapshot.entities {
            cache.materialize(entity);
        }

        let buffered = self.pending_len();
        let mut keep: Vec<PendingUpdate> = self
            .movement
            .drain(..)
            .chain(self.animation.drain(..))
            .filter(|update| match snapshot.snapshot_revision {
                Some(snapshot_revision) => update.revision > snapshot_revision,
                None => true,
            })
            .collect();
        report.discarded = buffered - keep.len();

        match snapshot.snapshot_revision {
            Some(_) => keep.sort_by_key(|update| (update.revision, update.arrival)),
            None => keep.sort_by_key(|update| update.arrival),
        }

        for update in keep {
            if cache.update(update.entity_id, update.payload.into_fields()) {
                report.applied.push(update.revision);
            } else {
                report.orphaned += 1;
            }
        }

        self.phase = Phase::Live;
        debug!(
            "Snapshot reconciled: {} entities, {} replayed, {} stale, {} orphaned",
            report.materialized,
            report.applied.len(),
            report.discarded,
            report.orphaned
        );
        report
    }
}
