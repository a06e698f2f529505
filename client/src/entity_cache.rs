//! Live entities known to one client connection.
//!
//! The cache is the only owner of entity lifetime on the client. Entities are
//! created from snapshot and spawn messages, removed by disconnect messages,
//! and otherwise only have fields merged into them.

use log::debug;
use shared::{EntitySnapshot, SessionId, DEFAULT_ANIMATION};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: SessionId,
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub animation: String,
    /// Set on the entity controlled by this client.
    pub is_local: bool,
}

impl Entity {
    fn blank(id: SessionId) -> Self {
        Self {
            id,
            name: String::new(),
            x: 0.0,
            y: 0.0,
            animation: DEFAULT_ANIMATION.to_string(),
            is_local: false,
        }
    }

    fn merge(&mut self, fields: EntityFields) {
        if let Some(name) = fields.name {
            self.name = name;
        }
        if let Some((x, y)) = fields.position {
            self.x = x;
            self.y = y;
        }
        if let Some(animation) = fields.animation {
            self.animation = animation;
        }
    }
}

/// Partial entity state. `None` leaves the existing value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityFields {
    pub name: Option<String>,
    pub position: Option<(f32, f32)>,
    pub animation: Option<String>,
}

impl EntityFields {
    pub fn position(x: f32, y: f32) -> Self {
        Self {
            position: Some((x, y)),
            ..Self::default()
        }
    }

    pub fn animation(animation: impl Into<String>) -> Self {
        Self {
            animation: Some(animation.into()),
            ..Self::default()
        }
    }
}

impl From<EntitySnapshot> for EntityFields {
    fn from(snapshot: EntitySnapshot) -> Self {
        Self {
            name: Some(snapshot.name),
            position: Some((snapshot.x, snapshot.y)),
            animation: Some(snapshot.animation),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Created,
    Merged,
}

type CreatedCallback = Box<dyn FnOnce(&mut Entity) + Send>;

#[derive(Default)]
pub struct EntityCache {
    entities: HashMap<SessionId, Entity>,
    on_created: HashMap<SessionId, Vec<CreatedCallback>>,
}

impl std::fmt::Debug for EntityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCache")
            .field("entities", &self.entities)
            .field("waiting", &self.on_created.len())
            .finish()
    }
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `fields` into the entity, creating it if needed.
    pub fn upsert(&mut self, id: SessionId, fields: EntityFields) -> Upsert {
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.merge(fields);
            return Upsert::Merged;
        }

        let mut entity = Entity::blank(id);
        entity.merge(fields);
        if let Some(callbacks) = self.on_created.remove(&id) {
            for callback in callbacks {
                callback(&mut entity);
            }
        }
        self.entities.insert(id, entity);
        Upsert::Created
    }

    /// Writes an authoritative snapshot over whatever the cache holds for that id.
    pub fn materialize(&mut self, snapshot: EntitySnapshot) -> Upsert {
        let id = snapshot.id;
        self.upsert(id, snapshot.into())
    }

    /// Merges `fields` into an existing entity only. Returns false for unknown ids.
    pub fn update(&mut self, id: SessionId, fields: EntityFields) -> bool {
        match self.entities.get_mut(&id) {
            Some(entity) => {
                entity.merge(fields);
                true
            }
            None => {
                debug!("Dropping update for unknown entity {}", id);
                false
            }
        }
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Entity> {
        self.entities.remove(&id)
    }

    /// Runs `callback` once the entity exists: right away if it already does,
    /// otherwise when it is created.
    pub fn when_created<F>(&mut self, id: SessionId, callback: F)
    where
        F: FnOnce(&mut Entity) + Send + 'static,
    {
        match self.entities.get_mut(&id) {
            Some(entity) => callback(entity),
            None => self
                .on_created
                .entry(id)
                .or_default()
                .push(Box::new(callback)),
        }
    }

    pub fn get(&self, id: SessionId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn waiting_len(&self) -> usize {
        self.on_created.values().map(Vec::len).sum()
    }
}
