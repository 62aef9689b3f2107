//! Networked entities: replicated state, lifecycle, and sync strategy.
//!
//! A [`NetworkEntity`] is driven either by a [`LocalAdapter`] (simulated on
//! this peer) or by a [`RemoteAdapter`] (simulated elsewhere). The strategy
//! is fixed at construction and is the only writer of the transform.

use std::collections::BTreeMap;

use glam::{Quat, Vec3};
use tracing::debug;

use crate::ws::protocol::{ContinuousSample, EntityId, PlatformId};

use super::activity::ActivityFlags;
use super::inventory::Inventory;
use super::local::LocalAdapter;
use super::remote::RemoteAdapter;
use super::stats::{names, Getter, Setter, StatMap, StatRegistry, StatTarget, StatValue};
use super::world::PlatformTransform;

/// Where entities wait before their first transform arrives (off the playable area)
pub const HIDDEN_POSITION: Vec3 = Vec3::new(0.0, -1000.0, 0.0);

/// Team value for free-for-all matches
pub const NO_TEAM: i32 = -1;

pub type Platforms = BTreeMap<PlatformId, PlatformTransform>;

/// Replicated state of a player entity
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    pub name: String,
    pub team: i32,
    pub health: f32,
    pub shots_fired: i64,
    pub kills: i64,
    pub deaths: i64,
    pub position: Vec3,
    /// Root yaw
    pub rotation: Quat,
    /// Camera pitch
    pub pitch: f32,
    pub velocity: Vec3,
    pub weapon_index: i32,
    pub inventory: Inventory,
    /// Input locked (between rounds)
    pub frozen: bool,
    pub activities: ActivityFlags,
}

impl Default for EntityState {
    fn default() -> Self {
        Self {
            name: String::new(),
            team: NO_TEAM,
            health: 100.0,
            shots_fired: 0,
            kills: 0,
            deaths: 0,
            position: HIDDEN_POSITION,
            rotation: Quat::IDENTITY,
            pitch: 0.0,
            velocity: Vec3::ZERO,
            weapon_index: 0,
            inventory: Inventory::new(),
            frozen: false,
            activities: ActivityFlags::default(),
        }
    }
}

impl StatTarget for EntityState {
    fn suspend_refresh(&mut self) {
        self.inventory.suspend_refresh();
    }

    fn resume_refresh(&mut self) {
        self.inventory.resume_refresh();
    }
}

/// Stat table shared by every player entity
pub fn player_stats() -> StatRegistry<EntityState> {
    let accessors: [(&'static str, Getter<EntityState>, Setter<EntityState>); 10] = [
        (
            names::NAME,
            |s| StatValue::Text(s.name.clone()),
            |s, v| {
                if let Some(name) = v.as_text() {
                    s.name = name.to_string();
                }
            },
        ),
        (
            names::HEALTH,
            |s| StatValue::Float(s.health),
            |s, v| {
                if let Some(health) = v.as_float() {
                    s.health = health;
                }
            },
        ),
        (
            names::TEAM,
            |s| StatValue::Int(s.team as i64),
            |s, v| {
                if let Some(team) = v.as_int() {
                    s.team = team as i32;
                }
            },
        ),
        (
            names::SHOTS_FIRED,
            |s| StatValue::Int(s.shots_fired),
            |s, v| {
                if let Some(n) = v.as_int() {
                    s.shots_fired = n;
                }
            },
        ),
        (
            names::KILLS,
            |s| StatValue::Int(s.kills),
            |s, v| {
                if let Some(n) = v.as_int() {
                    s.kills = n;
                }
            },
        ),
        (
            names::DEATHS,
            |s| StatValue::Int(s.deaths),
            |s, v| {
                if let Some(n) = v.as_int() {
                    s.deaths = n;
                }
            },
        ),
        (
            names::POSITION,
            |s| StatValue::Vector(s.position),
            |s, v| {
                if let Some(p) = v.as_vector() {
                    s.position = p;
                }
            },
        ),
        (
            names::ROTATION,
            |s| StatValue::Rotation(s.rotation),
            |s, v| {
                if let Some(r) = v.as_rotation() {
                    s.rotation = r;
                }
            },
        ),
        (
            names::ITEMS,
            |s| StatValue::Items(s.inventory.contents().clone()),
            |s, v| {
                if let Some(items) = v.as_items() {
                    s.inventory.replace_with(items);
                }
            },
        ),
        (
            names::WEAPON,
            |s| StatValue::Int(s.weapon_index as i64),
            |s, v| {
                if let Some(w) = v.as_int() {
                    s.weapon_index = w as i32;
                }
            },
        ),
    ];

    let mut registry = StatRegistry::new();
    for (name, get, set) in accessors {
        // Duplicates are logged by the registry
        let _ = registry.register(name, get, set);
    }
    registry
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Spawning,
    Active,
    Dead,
    Respawning,
    Destroyed,
}

impl Lifecycle {
    pub fn can_transition(self, to: Lifecycle) -> bool {
        use Lifecycle::*;
        matches!(
            (self, to),
            (Uninitialized, Spawning)
                | (Spawning, Active)
                | (Spawning, Dead)
                | (Spawning, Respawning)
                | (Active, Dead)
                | (Active, Respawning)
                | (Dead, Respawning)
                | (Respawning, Active)
                | (Uninitialized | Spawning | Active | Dead | Respawning, Destroyed)
        )
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("entity {entity}: illegal transition {from:?} -> {to:?}")]
pub struct LifecycleError {
    pub entity: EntityId,
    pub from: Lifecycle,
    pub to: Lifecycle,
}

/// How the transform of an entity is driven
#[derive(Debug, Clone)]
pub enum SyncStrategy {
    Local(LocalAdapter),
    Remote(RemoteAdapter),
}

#[derive(Debug, Clone)]
pub struct NetworkEntity {
    pub id: EntityId,
    lifecycle: Lifecycle,
    pub state: EntityState,
    pub sync: SyncStrategy,
    nametag_hidden_until: Option<f64>,
}

impl NetworkEntity {
    /// Entity simulated on this peer; instantiated by [`spawn_local`](Self::spawn_local)
    pub fn local(id: EntityId, name: &str, team: i32) -> Self {
        Self {
            id,
            lifecycle: Lifecycle::Uninitialized,
            state: EntityState {
                name: name.to_string(),
                team,
                ..Default::default()
            },
            sync: SyncStrategy::Local(LocalAdapter::new()),
            nametag_hidden_until: None,
        }
    }

    /// Replica of an entity simulated elsewhere; stays hidden until its first sample
    pub fn remote(id: EntityId) -> Self {
        Self {
            id,
            lifecycle: Lifecycle::Spawning,
            state: EntityState::default(),
            sync: SyncStrategy::Remote(RemoteAdapter::new()),
            nametag_hidden_until: None,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn is_local(&self) -> bool {
        matches!(self.sync, SyncStrategy::Local(_))
    }

    pub fn is_alive(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }

    pub fn transition(&mut self, to: Lifecycle) -> Result<(), LifecycleError> {
        if !self.lifecycle.can_transition(to) {
            return Err(LifecycleError {
                entity: self.id,
                from: self.lifecycle,
                to,
            });
        }
        debug!(entity = %self.id, from = ?self.lifecycle, to = ?to, "Lifecycle transition");
        self.lifecycle = to;
        Ok(())
    }

    /// Finish local instantiation at the assigned spawn point
    pub fn spawn_local(&mut self, position: Vec3, rotation: Quat) -> Result<(), LifecycleError> {
        self.transition(Lifecycle::Spawning)?;
        self.state.position = position;
        self.state.rotation = rotation;
        self.transition(Lifecycle::Active)
    }

    pub fn local_parts(&mut self) -> Option<(&mut LocalAdapter, &mut EntityState)> {
        match &mut self.sync {
            SyncStrategy::Local(adapter) => Some((adapter, &mut self.state)),
            SyncStrategy::Remote(_) => None,
        }
    }

    pub fn remote_parts(&mut self) -> Option<(&mut RemoteAdapter, &mut EntityState)> {
        match &mut self.sync {
            SyncStrategy::Remote(adapter) => Some((adapter, &mut self.state)),
            SyncStrategy::Local(_) => None,
        }
    }

    /// Outgoing continuous sample (local entities only)
    pub fn serialize_out(&self, platforms: &Platforms) -> Option<ContinuousSample> {
        match &self.sync {
            SyncStrategy::Local(adapter) => Some(adapter.sample(&self.state, platforms)),
            SyncStrategy::Remote(_) => None,
        }
    }

    /// Incoming continuous sample (remote entities only)
    pub fn serialize_in(&mut self, sample: ContinuousSample) {
        if let SyncStrategy::Remote(adapter) = &mut self.sync {
            adapter.receive_sample(sample);
        }
    }

    /// Mirror an authoritative kill
    pub fn kill(&mut self) -> Result<(), LifecycleError> {
        self.transition(Lifecycle::Dead)?;
        self.state.health = 0.0;
        self.state.velocity = Vec3::ZERO;
        self.state.activities.reset();
        if let SyncStrategy::Remote(adapter) = &mut self.sync {
            adapter.clear_fire_queue();
        }
        Ok(())
    }

    /// Mirror an authoritative respawn: teleport, heal, and hide the nametag
    /// until `hide_nametag_until`
    pub fn respawn(
        &mut self,
        position: Vec3,
        rotation: Quat,
        health: f32,
        hide_nametag_until: f64,
    ) -> Result<(), LifecycleError> {
        self.transition(Lifecycle::Respawning)?;
        self.state.health = health;
        self.state.activities.reset();
        match &mut self.sync {
            SyncStrategy::Local(_) => {
                self.state.position = position;
                self.state.rotation = rotation;
                self.state.velocity = Vec3::ZERO;
            }
            SyncStrategy::Remote(adapter) => adapter.teleport(&mut self.state, position, rotation),
        }
        self.nametag_hidden_until = Some(hide_nametag_until);
        self.transition(Lifecycle::Active)
    }

    pub fn nametag_visible(&self, now: f64) -> bool {
        self.lifecycle == Lifecycle::Active
            && self.nametag_hidden_until.map_or(true, |until| now >= until)
    }
}

/// Non-player object that can be damaged and destroyed (crates, barrels)
#[derive(Debug, Clone, PartialEq)]
pub struct DamageableObject {
    pub id: EntityId,
    pub health: f32,
    pub max_health: f32,
    pub destroyed: bool,
}

/// All networked entities of one session
pub struct EntityTable {
    players: BTreeMap<EntityId, NetworkEntity>,
    objects: BTreeMap<EntityId, DamageableObject>,
    stats: StatRegistry<EntityState>,
}

impl EntityTable {
    pub fn new() -> Self {
        Self {
            players: BTreeMap::new(),
            objects: BTreeMap::new(),
            stats: player_stats(),
        }
    }

    pub fn stats(&self) -> &StatRegistry<EntityState> {
        &self.stats
    }

    pub fn get(&self, id: EntityId) -> Option<&NetworkEntity> {
        self.players.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut NetworkEntity> {
        self.players.get_mut(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.players.contains_key(&id)
    }

    /// Apply replicated stats to one player, skipping names `keep` rejects
    pub fn apply_stats(
        &mut self,
        id: EntityId,
        values: &StatMap,
        keep: impl Fn(&str) -> bool,
    ) -> bool {
        let Some(entity) = self.players.get_mut(&id) else {
            return false;
        };
        self.stats.apply_filtered(&mut entity.state, values, keep);
        true
    }

    pub fn insert(&mut self, entity: NetworkEntity) {
        self.players.insert(entity.id, entity);
    }

    /// Remove a player entity, marking it destroyed
    pub fn remove(&mut self, id: EntityId) -> Option<NetworkEntity> {
        let mut entity = self.players.remove(&id)?;
        let _ = entity.transition(Lifecycle::Destroyed);
        Some(entity)
    }

    pub fn players(&self) -> impl Iterator<Item = &NetworkEntity> {
        self.players.values()
    }

    pub fn players_mut(&mut self) -> impl Iterator<Item = &mut NetworkEntity> {
        self.players.values_mut()
    }

    pub fn player_ids(&self) -> Vec<EntityId> {
        self.players.keys().copied().collect()
    }

    /// Register the next non-player object; ids follow registration order
    pub fn add_object(&mut self, max_health: f32) -> EntityId {
        let id = EntityId::for_object(self.objects.len() as u32);
        self.objects.insert(
            id,
            DamageableObject {
                id,
                health: max_health,
                max_health,
                destroyed: false,
            },
        );
        id
    }

    pub fn object(&self, id: EntityId) -> Option<&DamageableObject> {
        self.objects.get(&id)
    }

    pub fn object_mut(&mut self, id: EntityId) -> Option<&mut DamageableObject> {
        self.objects.get_mut(&id)
    }

    pub fn objects(&self) -> impl Iterator<Item = &DamageableObject> {
        self.objects.values()
    }

    /// Players per team, counting only live (non-destroyed) entities
    pub fn team_population(&self, team_count: i32) -> Vec<usize> {
        let mut counts = vec![0; team_count.max(0) as usize];
        for entity in self.players.values() {
            if let Some(slot) = usize::try_from(entity.state.team)
                .ok()
                .and_then(|t| counts.get_mut(t))
            {
                *slot += 1;
            }
        }
        counts
    }

    pub fn clear(&mut self) {
        self.players.clear();
        self.objects.clear();
    }
}

impl Default for EntityTable {
    fn default() -> Self {
        Self::new()
    }
}
