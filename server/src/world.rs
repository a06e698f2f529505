use log::info;
use rand::Rng;
use shared::{
    clamp_to_world, EntitySnapshot, Revision, SessionId, MAX_ANIMATION_LEN, MAX_NAME_LEN,
    WORLD_HEIGHT, WORLD_WIDTH,
};
use std::collections::HashMap;

/// Authoritative entity state of one worker process.
///
/// Every accepted movement or animation change is stamped with the next
/// revision. Snapshots carry the latest revision issued, so a client can
/// tell which updates it has already seen folded into the snapshot.
#[derive(Debug, Default)]
pub struct WorldState {
    entities: HashMap<SessionId, EntitySnapshot>,
    revision: Revision,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entity(&mut self, id: SessionId, name: &str) -> EntitySnapshot {
        let mut rng = rand::thread_rng();
        let x = rng.gen_range(WORLD_WIDTH * 0.1..WORLD_WIDTH * 0.9);
        let y = rng.gen_range(WORLD_HEIGHT * 0.1..WORLD_HEIGHT * 0.9);

        let name = sanitize_name(name, id);
        let entity = EntitySnapshot::new(id, name, x, y);

        info!("Added entity {} ({}) at ({:.1}, {:.1})", id, entity.name, x, y);
        self.entities.insert(id, entity.clone());
        entity
    }

    pub fn remove_entity(&mut self, id: SessionId) -> Option<EntitySnapshot> {
        let removed = self.entities.remove(&id);
        if removed.is_some() {
            info!("Removed entity {}", id);
        }
        removed
    }

    /// Moves an entity, returning the revision and the clamped position.
    pub fn move_entity(&mut self, id: SessionId, x: f32, y: f32) -> Option<(Revision, f32, f32)> {
        if !x.is_finite() || !y.is_finite() || !self.entities.contains_key(&id) {
            return None;
        }

        let revision = self.next_revision();
        let entity = self.entities.get_mut(&id)?;
        let (x, y) = clamp_to_world(x, y);
        entity.x = x;
        entity.y = y;
        Some((revision, x, y))
    }

    pub fn animate_entity(&mut self, id: SessionId, animation: &str) -> Option<Revision> {
        if animation.is_empty() || animation.len() > MAX_ANIMATION_LEN {
            return None;
        }
        if !self.entities.contains_key(&id) {
            return None;
        }

        let revision = self.next_revision();
        let entity = self.entities.get_mut(&id)?;
        entity.animation = animation.to_string();
        Some(revision)
    }

    pub fn snapshot(&self) -> (Vec<EntitySnapshot>, Revision) {
        let mut entities: Vec<EntitySnapshot> = self.entities.values().cloned().collect();
        entities.sort_by_key(|entity| entity.id);
        (entities, self.revision)
    }

    pub fn get(&self, id: SessionId) -> Option<&EntitySnapshot> {
        self.entities.get(&id)
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn next_revision(&mut self) -> Revision {
        self.revision += 1;
        self.revision
    }
}

fn sanitize_name(name: &str, id: SessionId) -> String {
    let trimmed: String = name.trim().chars().take(MAX_NAME_LEN).collect();
    if trimmed.is_empty() {
        format!("player-{}", id)
    } else {
        trimmed
    }
}
