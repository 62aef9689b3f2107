//! Authority manager: master role, match phase and clock, spawn allocation,
//! snapshot assembly.

use std::collections::{BTreeMap, BTreeSet};

use glam::{Quat, Vec3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::ws::protocol::{EntityId, GamePhase, PartialSnapshot, PeerId, PickupId, Snapshot};

use super::clock::MatchClock;
use super::entity::{EntityTable, NO_TEAM};
use super::schedule::TaskScheduler;
use super::stats::{names, StatMap, StatValue};

#[derive(Debug, Clone, PartialEq)]
pub struct SpawnPoint {
    pub position: Vec3,
    pub rotation: Quat,
    /// Team the point belongs to; `None` for shared points
    pub team: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pickup {
    pub id: PickupId,
    pub item: String,
    pub count: i32,
}

/// Level data the session needs once the scene is loaded
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Level {
    pub name: String,
    pub spawn_points: Vec<SpawnPoint>,
    pub pickups: Vec<Pickup>,
    /// Max health of each damageable object, in registration order
    pub objects: Vec<f32>,
}

impl Level {
    pub fn pickup(&self, id: PickupId) -> Option<&Pickup> {
        self.pickups.iter().find(|p| p.id == id)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthorityError {
    #[error("Only the authority may do this")]
    NotAuthority,

    #[error("Level is not loaded")]
    LevelNotLoaded,

    #[error("Level has no spawn points")]
    NoSpawnPoints,

    #[error("Unknown pickup {0}")]
    UnknownPickup(PickupId),

    #[error("Unknown entity {0}")]
    UnknownEntity(EntityId),
}

/// Result of a master update as seen by this peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleChange {
    /// Master unchanged; repeated notifications land here
    Unchanged,
    /// This peer became the authority
    Promoted,
    /// This peer lost the authority
    Demoted,
    /// Authority moved between two other peers
    MasterMoved,
}

pub struct AuthorityManager {
    local: PeerId,
    master: PeerId,
    phase: GamePhase,
    clock: MatchClock,
    level: Option<Level>,
    disabled_pickups: BTreeSet<PickupId>,
    scheduler: TaskScheduler,
    rng: ChaCha8Rng,
    promotions: u32,
}

impl AuthorityManager {
    pub fn new(local: PeerId, master: PeerId) -> Self {
        Self {
            local,
            master,
            phase: GamePhase::NotStarted,
            clock: MatchClock::default(),
            level: None,
            disabled_pickups: BTreeSet::new(),
            scheduler: TaskScheduler::new(),
            rng: ChaCha8Rng::seed_from_u64(local.0 as u64),
            promotions: 0,
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    pub fn master(&self) -> PeerId {
        self.master
    }

    pub fn is_authority(&self) -> bool {
        self.master == self.local
    }

    /// Whether messages reserved to the authority are accepted from `sender`
    pub fn accepts_from(&self, sender: PeerId) -> bool {
        sender == self.master
    }

    /// Times this peer took over from another authority
    pub fn promotions(&self) -> u32 {
        self.promotions
    }

    /// Record the current master.
    ///
    /// Idempotent: repeating the same master is `Unchanged`. Any change of
    /// this peer's role starts a new scheduler epoch.
    pub fn set_master(&mut self, master: PeerId) -> RoleChange {
        if master == self.master {
            return RoleChange::Unchanged;
        }
        let was_authority = self.is_authority();
        let previous = std::mem::replace(&mut self.master, master);

        let change = match (was_authority, self.is_authority()) {
            (false, true) => {
                self.promotions += 1;
                RoleChange::Promoted
            }
            (true, false) => RoleChange::Demoted,
            _ => RoleChange::MasterMoved,
        };
        if change != RoleChange::MasterMoved {
            self.scheduler.advance_epoch();
        }
        info!(
            local = %self.local,
            previous = %previous,
            master = %master,
            change = ?change,
            "Master changed"
        );
        change
    }

    pub fn phase(&self) -> GamePhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: GamePhase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, "Game phase");
            self.phase = phase;
        }
    }

    pub fn clock(&self) -> &MatchClock {
        &self.clock
    }

    pub fn reset_clock(&mut self, now: f64, duration: f64) {
        self.clock.reset(now, duration);
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut TaskScheduler {
        &mut self.scheduler
    }

    pub fn load_level(&mut self, level: Level) {
        info!(level = %level.name, spawns = level.spawn_points.len(), "Level loaded");
        self.level = Some(level);
    }

    pub fn level(&self) -> Option<&Level> {
        self.level.as_ref()
    }

    pub fn has_level(&self) -> bool {
        self.level.is_some()
    }

    pub fn disabled_pickups(&self) -> &BTreeSet<PickupId> {
        &self.disabled_pickups
    }

    pub fn is_pickup_enabled(&self, id: PickupId) -> bool {
        !self.disabled_pickups.contains(&id)
    }

    pub fn disable_pickup(&mut self, id: PickupId) -> bool {
        self.disabled_pickups.insert(id)
    }

    pub fn enable_pickup(&mut self, id: PickupId) -> bool {
        self.disabled_pickups.remove(&id)
    }

    /// Smallest team wins, ties go to the lowest index
    pub fn allocate_team(&self, population: &[usize]) -> i32 {
        population
            .iter()
            .enumerate()
            .min_by_key(|(team, count)| (**count, *team))
            .map_or(NO_TEAM, |(team, _)| team as i32)
    }

    /// Random spawn point, preferring the team's own points
    pub fn pick_spawn(&mut self, team: i32) -> Result<SpawnPoint, AuthorityError> {
        let level = self.level.as_ref().ok_or(AuthorityError::LevelNotLoaded)?;
        let tagged: Vec<&SpawnPoint> = level
            .spawn_points
            .iter()
            .filter(|p| team != NO_TEAM && p.team == Some(team))
            .collect();
        let candidates: Vec<&SpawnPoint> = if tagged.is_empty() {
            level.spawn_points.iter().collect()
        } else {
            tagged
        };
        if candidates.is_empty() {
            return Err(AuthorityError::NoSpawnPoints);
        }
        let index = self.rng.gen_range(0..candidates.len());
        Ok(candidates[index].clone())
    }

    /// Adopt the replicated phase, clock, and pickup state of a full snapshot
    pub fn apply_header(&mut self, now: f64, snapshot: &Snapshot) {
        self.set_phase(snapshot.phase);
        self.clock = MatchClock::from_replicated(now, snapshot.time_left, snapshot.duration);
        self.disabled_pickups = snapshot.disabled_pickups.clone();
    }

    /// Fresh full snapshot of every entity and damageable object
    pub fn assemble_snapshot(&self, now: f64, entities: &EntityTable) -> Snapshot {
        let mut per_entity: BTreeMap<EntityId, StatMap> = entities
            .players()
            .map(|e| (e.id, entities.stats().snapshot(&e.state)))
            .collect();
        for object in entities.objects() {
            per_entity.insert(object.id, object_stats(object.health));
        }

        Snapshot {
            phase: self.phase,
            time_left: self.clock.time_left(now),
            duration: self.clock.duration(),
            per_entity,
            disabled_pickups: self.disabled_pickups.clone(),
        }
    }

    /// Snapshot restricted to `ids` and `stat_names`; unknown ids are skipped
    pub fn partial_snapshot(
        &self,
        entities: &EntityTable,
        ids: &[EntityId],
        stat_names: &[&str],
    ) -> PartialSnapshot {
        let mut per_entity = BTreeMap::new();
        for id in ids {
            let stats = if let Some(entity) = entities.get(*id) {
                entities.stats().snapshot_subset(&entity.state, stat_names)
            } else if let Some(object) = entities.object(*id) {
                if stat_names.contains(&names::HEALTH) {
                    object_stats(object.health)
                } else {
                    StatMap::new()
                }
            } else {
                continue;
            };
            if !stats.is_empty() {
                per_entity.insert(*id, stats);
            }
        }
        PartialSnapshot { per_entity }
    }

    pub fn reset(&mut self) {
        self.phase = GamePhase::NotStarted;
        self.clock = MatchClock::default();
        self.level = None;
        self.disabled_pickups.clear();
        self.scheduler.clear();
    }
}

fn object_stats(health: f32) -> StatMap {
    let mut map = StatMap::new();
    map.insert(names::HEALTH.to_string(), StatValue::Float(health));
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::NetworkEntity;
    use crate::game::schedule::ScheduledTask;

    fn arena_level() -> Level {
        Level {
            name: "yard".into(),
            spawn_points: vec![
                SpawnPoint {
                    position: Vec3::new(-10.0, 0.0, 0.0),
                    rotation: Quat::IDENTITY,
                    team: Some(0),
                },
                SpawnPoint {
                    position: Vec3::new(10.0, 0.0, 0.0),
                    rotation: Quat::IDENTITY,
                    team: Some(1),
                },
            ],
            pickups: vec![Pickup {
                id: 1,
                item: "medkit".into(),
                count: 1,
            }],
            objects: vec![40.0],
        }
    }

    #[test]
    fn handover_is_idempotent() {
        let mut mgr = AuthorityManager::new(PeerId(2), PeerId(1));
        assert!(!mgr.is_authority());
        assert_eq!(mgr.set_master(PeerId(2)), RoleChange::Promoted);
        assert_eq!(mgr.set_master(PeerId(2)), RoleChange::Unchanged);
        assert_eq!(mgr.set_master(PeerId(2)), RoleChange::Unchanged);
        assert_eq!(mgr.promotions(), 1);
        assert_eq!(mgr.scheduler().epoch(), 1);
    }

    #[test]
    fn only_the_current_master_is_accepted() {
        let mut mgr = AuthorityManager::new(PeerId(3), PeerId(1));
        assert!(mgr.accepts_from(PeerId(1)));
        assert!(!mgr.accepts_from(PeerId(2)));
        assert_eq!(mgr.set_master(PeerId(2)), RoleChange::MasterMoved);
        assert!(!mgr.accepts_from(PeerId(1)));
        assert!(mgr.accepts_from(PeerId(2)));
    }

    #[test]
    fn demotion_invalidates_scheduled_tasks() {
        let mut mgr = AuthorityManager::new(PeerId(1), PeerId(1));
        mgr.scheduler_mut().schedule(5.0, ScheduledTask::RestartRound);
        assert_eq!(mgr.set_master(PeerId(4)), RoleChange::Demoted);
        assert!(mgr.scheduler().is_empty());
    }

    #[test]
    fn smallest_team_gets_the_joiner() {
        let mgr = AuthorityManager::new(PeerId(1), PeerId(1));
        assert_eq!(mgr.allocate_team(&[3, 1, 2]), 1);
        assert_eq!(mgr.allocate_team(&[2, 2]), 0);
        assert_eq!(mgr.allocate_team(&[]), NO_TEAM);
    }

    #[test]
    fn spawn_points_follow_team_tags() {
        let mut mgr = AuthorityManager::new(PeerId(1), PeerId(1));
        assert_eq!(mgr.pick_spawn(0), Err(AuthorityError::LevelNotLoaded));
        mgr.load_level(arena_level());
        for _ in 0..10 {
            assert_eq!(mgr.pick_spawn(1).unwrap().team, Some(1));
        }
        // Free-for-all and unknown teams fall back to any point
        assert!(mgr.pick_spawn(NO_TEAM).is_ok());
        assert!(mgr.pick_spawn(5).is_ok());

        mgr.load_level(Level::default());
        assert_eq!(mgr.pick_spawn(0), Err(AuthorityError::NoSpawnPoints));
    }

    #[test]
    fn snapshot_covers_players_objects_and_pickups() {
        let mut mgr = AuthorityManager::new(PeerId(1), PeerId(1));
        mgr.reset_clock(0.0, 60.0);
        mgr.set_phase(GamePhase::Playing);
        mgr.disable_pickup(1);

        let mut table = EntityTable::new();
        table.insert(NetworkEntity::local(EntityId(1), "one", 0));
        let crate_id = table.add_object(40.0);

        let snap = mgr.assemble_snapshot(15.0, &table);
        assert_eq!(snap.phase, GamePhase::Playing);
        assert!((snap.time_left - 45.0).abs() < 1e-9);
        assert!(snap.disabled_pickups.contains(&1));
        assert_eq!(
            snap.per_entity[&EntityId(1)][names::NAME],
            StatValue::Text("one".into())
        );
        assert_eq!(
            snap.per_entity[&crate_id][names::HEALTH],
            StatValue::Float(40.0)
        );

        let partial = mgr.partial_snapshot(
            &table,
            &[EntityId(1), EntityId(9), crate_id],
            &[names::KILLS],
        );
        assert_eq!(partial.per_entity.len(), 1);
        assert_eq!(partial.per_entity[&EntityId(1)].len(), 1);
    }

    #[test]
    fn replicated_header_is_adopted() {
        let mut mgr = AuthorityManager::new(PeerId(2), PeerId(1));
        let snap = Snapshot {
            phase: GamePhase::BetweenGames,
            time_left: 4.0,
            duration: 10.0,
            per_entity: BTreeMap::new(),
            disabled_pickups: [3].into_iter().collect(),
        };
        mgr.apply_header(100.0, &snap);
        assert_eq!(mgr.phase(), GamePhase::BetweenGames);
        assert!((mgr.clock().end_time() - 104.0).abs() < 1e-9);
        assert!(!mgr.is_pickup_enabled(3));
    }
}
