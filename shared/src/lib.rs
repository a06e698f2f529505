//! Wire contract shared by the worker processes and the game client.
//!
//! Every message travels as an [`Envelope`]: a message kind, a kind-specific
//! payload and an optional revision. [`Packet`] is the typed view of the same
//! message; [`codec`] turns envelopes into bytes and frames them on a stream.

use serde::{Deserialize, Serialize};

pub mod codec;

pub use codec::{decode, encode, read_frame, write_frame, CodecError, MAX_FRAME_LEN};

pub const WORLD_WIDTH: f32 = 800.0;
pub const WORLD_HEIGHT: f32 = 600.0;
pub const DEFAULT_ANIMATION: &str = "idle";
pub const MAX_ANIMATION_LEN: usize = 32;
pub const MAX_NAME_LEN: usize = 24;

/// Line a worker prints on stdout once its listener is bound.
pub const READY_MARKER: &str = "@@worker-ready";

pub const ENV_WORKER_ID: &str = "WORKER_ID";
pub const ENV_WORKER_PORT: &str = "WORKER_PORT";
pub const ENV_WORKER_MODE: &str = "WORKER_MODE";
pub const ENV_WORKER_HOST: &str = "WORKER_HOST";

/// Connection-scoped identity of an entity. Never derived from the player name.
pub type SessionId = u32;

/// Monotonic stamp on positional and animation updates.
pub type Revision = u64;

pub mod kind {
    pub const HELLO: &str = "hello";
    pub const WELCOME: &str = "welcome";
    pub const SNAPSHOT_LOAD: &str = "snapshot-load";
    pub const SPAWN: &str = "spawn";
    pub const MOVE: &str = "move";
    pub const ANIMATE: &str = "animate";
    pub const POSITION_UPDATE: &str = "position-update";
    pub const ANIMATION_UPDATE: &str = "animation-update";
    pub const DISCONNECT: &str = "disconnect";
    pub const LEAVE: &str = "leave";
}

/// Binary message frame: `{ kind, data, revision? }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: String,
    pub data: Vec<u8>,
    pub revision: Option<Revision>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Vec<u8>, revision: Option<Revision>) -> Self {
        Self {
            kind: kind.into(),
            data,
            revision,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EntitySnapshot {
    pub id: SessionId,
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub animation: String,
}

impl EntitySnapshot {
    pub fn new(id: SessionId, name: impl Into<String>, x: f32, y: f32) -> Self {
        Self {
            id,
            name: name.into(),
            x,
            y,
            animation: DEFAULT_ANIMATION.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    Hello {
        name: String,
    },
    Move {
        x: f32,
        y: f32,
    },
    Animate {
        animation: String,
    },
    Leave,

    Welcome {
        session_id: SessionId,
        worker_id: u32,
    },
    SnapshotLoad {
        entities: Vec<EntitySnapshot>,
        snapshot_revision: Option<Revision>,
    },
    Spawn {
        entity: EntitySnapshot,
    },
    PositionUpdate {
        entity_id: SessionId,
        x: f32,
        y: f32,
        revision: Option<Revision>,
    },
    AnimationUpdate {
        entity_id: SessionId,
        animation: String,
        revision: Option<Revision>,
    },
    Disconnect {
        entity_id: SessionId,
    },
}

impl Packet {
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Hello { .. } => kind::HELLO,
            Packet::Move { .. } => kind::MOVE,
            Packet::Animate { .. } => kind::ANIMATE,
            Packet::Leave => kind::LEAVE,
            Packet::Welcome { .. } => kind::WELCOME,
            Packet::SnapshotLoad { .. } => kind::SNAPSHOT_LOAD,
            Packet::Spawn { .. } => kind::SPAWN,
            Packet::PositionUpdate { .. } => kind::POSITION_UPDATE,
            Packet::AnimationUpdate { .. } => kind::ANIMATION_UPDATE,
            Packet::Disconnect { .. } => kind::DISCONNECT,
        }
    }

    /// Splits the packet into its envelope. The revision of update kinds moves
    /// to the envelope header, everything else is the bincode payload.
    pub fn into_envelope(self) -> Result<Envelope, CodecError> {
        let kind = self.kind();
        let (data, revision) = match self {
            Packet::Hello { name } => (bincode::serialize(&name)?, None),
            Packet::Move { x, y } => (bincode::serialize(&(x, y))?, None),
            Packet::Animate { animation } => (bincode::serialize(&animation)?, None),
            Packet::Leave => (Vec::new(), None),
            Packet::Welcome {
                session_id,
                worker_id,
            } => (bincode::serialize(&(session_id, worker_id))?, None),
            Packet::SnapshotLoad {
                entities,
                snapshot_revision,
            } => (bincode::serialize(&(entities, snapshot_revision))?, None),
            Packet::Spawn { entity } => (bincode::serialize(&entity)?, None),
            Packet::PositionUpdate {
                entity_id,
                x,
                y,
                revision,
            } => (bincode::serialize(&(entity_id, x, y))?, revision),
            Packet::AnimationUpdate {
                entity_id,
                animation,
                revision,
            } => (bincode::serialize(&(entity_id, animation))?, revision),
            Packet::Disconnect { entity_id } => (bincode::serialize(&entity_id)?, None),
        };

        Ok(Envelope::new(kind, data, revision))
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, CodecError> {
        let data = envelope.data.as_slice();
        let revision = envelope.revision;

        let packet = match envelope.kind.as_str() {
            kind::HELLO => Packet::Hello {
                name: bincode::deserialize(data)?,
            },
            kind::MOVE => {
                let (x, y) = bincode::deserialize(data)?;
                Packet::Move { x, y }
            }
            kind::ANIMATE => Packet::Animate {
                animation: bincode::deserialize(data)?,
            },
            kind::LEAVE => Packet::Leave,
            kind::WELCOME => {
                let (session_id, worker_id) = bincode::deserialize(data)?;
                Packet::Welcome {
                    session_id,
                    worker_id,
                }
            }
            kind::SNAPSHOT_LOAD => {
                let (entities, snapshot_revision) = bincode::deserialize(data)?;
                Packet::SnapshotLoad {
                    entities,
                    snapshot_revision,
                }
            }
            kind::SPAWN => Packet::Spawn {
                entity: bincode::deserialize(data)?,
            },
            kind::POSITION_UPDATE => {
                let (entity_id, x, y) = bincode::deserialize(data)?;
                Packet::PositionUpdate {
                    entity_id,
                    x,
                    y,
                    revision,
                }
            }
            kind::ANIMATION_UPDATE => {
                let (entity_id, animation) = bincode::deserialize(data)?;
                Packet::AnimationUpdate {
                    entity_id,
                    animation,
                    revision,
                }
            }
            kind::DISCONNECT => Packet::Disconnect {
                entity_id: bincode::deserialize(data)?,
            },
            other => return Err(CodecError::UnknownKind(other.to_string())),
        };

        Ok(packet)
    }

    pub fn encode(self) -> Result<Vec<u8>, CodecError> {
        encode(&self.into_envelope()?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Packet::from_envelope(&decode(bytes)?)
    }
}

pub fn clamp_to_world(x: f32, y: f32) -> (f32, f32) {
    (x.clamp(0.0, WORLD_WIDTH), y.clamp(0.0, WORLD_HEIGHT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_entity_snapshot_defaults_to_idle() {
        let entity = EntitySnapshot::new(7, "ada", 10.0, 20.0);
        assert_eq!(entity.id, 7);
        assert_eq!(entity.name, "ada");
        assert_eq!(entity.animation, DEFAULT_ANIMATION);
    }

    #[test]
    fn test_packet_kind_names() {
        assert_eq!(Packet::Leave.kind(), "leave");
        assert_eq!(
            Packet::SnapshotLoad {
                entities: vec![],
                snapshot_revision: None
            }
            .kind(),
            "snapshot-load"
        );
        assert_eq!(
            Packet::PositionUpdate {
                entity_id: 1,
                x: 0.0,
                y: 0.0,
                revision: Some(1)
            }
            .kind(),
            "position-update"
        );
    }

    #[test]
    fn test_update_revision_lives_in_envelope_header() {
        let packet = Packet::PositionUpdate {
            entity_id: 3,
            x: 1.5,
            y: 2.5,
            revision: Some(42),
        };

        let envelope = packet.into_envelope().unwrap();
        assert_eq!(envelope.kind, kind::POSITION_UPDATE);
        assert_eq!(envelope.revision, Some(42));

        match Packet::from_envelope(&envelope).unwrap() {
            Packet::PositionUpdate {
                entity_id,
                x,
                y,
                revision,
            } => {
                assert_eq!(entity_id, 3);
                assert_approx_eq!(x, 1.5);
                assert_approx_eq!(y, 2.5);
                assert_eq!(revision, Some(42));
            }
            _ => panic!("Wrong packet type after decoding"),
        }
    }

    #[test]
    fn test_snapshot_load_carries_snapshot_revision() {
        let packet = Packet::SnapshotLoad {
            entities: vec![EntitySnapshot::new(1, "a", 10.0, 10.0)],
            snapshot_revision: Some(5),
        };

        let envelope = packet.clone().into_envelope().unwrap();
        assert_eq!(envelope.revision, None);
        assert_eq!(Packet::from_envelope(&envelope).unwrap(), packet);
    }

    #[test]
    fn test_missing_revision_survives_decoding() {
        let envelope = Envelope::new(
            kind::ANIMATION_UPDATE,
            bincode::serialize(&(9u32, "run".to_string())).unwrap(),
            None,
        );

        match Packet::from_envelope(&envelope).unwrap() {
            Packet::AnimationUpdate { revision, .. } => assert_eq!(revision, None),
            _ => panic!("Wrong packet type after decoding"),
        }
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let envelope = Envelope::new("inventory-sync", vec![1, 2, 3], None);
        match Packet::from_envelope(&envelope) {
            Err(CodecError::UnknownKind(kind)) => assert_eq!(kind, "inventory-sync"),
            other => panic!("Expected unknown kind error, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let envelope = Envelope::new(kind::WELCOME, vec![1], None);
        assert!(matches!(
            Packet::from_envelope(&envelope),
            Err(CodecError::Serialization(_))
        ));
    }

    #[test]
    fn test_clamp_to_world() {
        assert_eq!(clamp_to_world(-5.0, 10.0), (0.0, 10.0));
        assert_eq!(clamp_to_world(900.0, 700.0), (WORLD_WIDTH, WORLD_HEIGHT));
    }
}
