//! Combat system - weapons, deterministic spread, hit resolution

use glam::{EulerRot, Quat, Vec3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::util::time::seconds_to_ticks;
use crate::ws::protocol::EntityId;

use super::world::WorldQuery;

/// Local forward axis of an entity or muzzle
pub const FORWARD: Vec3 = Vec3::NEG_Z;

/// Weapon stats per weapon index
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeaponStats {
    pub name: &'static str,
    /// Damage per pellet
    pub damage: f32,
    pub pellets: u32,
    /// Half-angle of the spread cone (radians)
    pub spread: f32,
    pub range: f32,
    /// Minimum seconds between two shots
    pub fire_interval: f32,
    /// Seconds to bring this weapon up
    pub switch_time: f32,
}

impl WeaponStats {
    pub const COUNT: i32 = 4;

    pub fn for_index(index: i32) -> Option<Self> {
        let stats = match index {
            0 => Self {
                name: "pistol",
                damage: 20.0,
                pellets: 1,
                spread: 0.01,
                range: 60.0,
                fire_interval: 0.25,
                switch_time: 0.3,
            },
            1 => Self {
                name: "rifle",
                damage: 12.0,
                pellets: 1,
                spread: 0.025,
                range: 120.0,
                fire_interval: 0.1,
                switch_time: 0.5,
            },
            2 => Self {
                name: "shotgun",
                damage: 9.0,
                pellets: 8,
                spread: 0.09,
                range: 25.0,
                fire_interval: 0.8,
                switch_time: 0.6,
            },
            3 => Self {
                name: "sniper",
                damage: 80.0,
                pellets: 1,
                spread: 0.0,
                range: 300.0,
                fire_interval: 1.5,
                switch_time: 0.8,
            },
            _ => return None,
        };
        Some(stats)
    }

    /// Legal firing interval expressed in simulation ticks
    pub fn fire_interval_ticks(&self, tick_rate: u32) -> u32 {
        seconds_to_ticks(self.fire_interval, tick_rate)
    }
}

/// Fold the shooter and its shot counter into one RNG seed
pub fn shot_seed(shooter: EntityId, seed: i64) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325_u64;
    for part in [shooter.0 as i64 as u64, seed as u64] {
        hash ^= part;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// Pellet directions for one shot.
///
/// Every peer derives the same directions from (shooter, seed), so spread
/// never travels over the wire and cannot be tampered with.
pub fn shot_rays(shooter: EntityId, seed: i64, aim: Quat, stats: &WeaponStats) -> Vec<Vec3> {
    let mut rng = ChaCha8Rng::seed_from_u64(shot_seed(shooter, seed));
    (0..stats.pellets.max(1))
        .map(|_| {
            let yaw = rng.gen_range(-stats.spread..=stats.spread);
            let pitch = rng.gen_range(-stats.spread..=stats.spread);
            let deviation = Quat::from_euler(EulerRot::YXZ, yaw, pitch, 0.0);
            (aim * deviation * FORWARD).normalize()
        })
        .collect()
}

const SELF_HIT_MAX_NUDGES: u32 = 3;
const SELF_HIT_CLEARANCE: f32 = 0.05;

/// Move a shot origin forward along its aim until the first thing in the
/// way is not the shooter's own collider.
///
/// Under latency the replayed muzzle can sit inside the shooter's lagged
/// collider; without this the shot would stop on the shooter.
pub fn clear_owner_collider(
    world: &dyn WorldQuery,
    owner: EntityId,
    origin: Vec3,
    direction: Vec3,
    range: f32,
) -> Vec3 {
    let mut origin = origin;
    for _ in 0..SELF_HIT_MAX_NUDGES {
        match world.raycast(origin, direction, range) {
            Some(hit) if hit.entity == Some(owner) => {
                origin += direction * (hit.distance + SELF_HIT_CLEARANCE);
            }
            _ => break,
        }
    }
    origin
}

/// A pellet that struck another entity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShotHit {
    pub target: EntityId,
    pub damage: f32,
    pub point: Vec3,
}

/// Trace every pellet and collect entity hits (never the shooter)
pub fn resolve_hits(
    world: &dyn WorldQuery,
    shooter: EntityId,
    origin: Vec3,
    rays: &[Vec3],
    stats: &WeaponStats,
) -> Vec<ShotHit> {
    rays.iter()
        .filter_map(|dir| world.raycast(origin, *dir, stats.range))
        .filter_map(|hit| match hit.entity {
            Some(target) if target != shooter => Some(ShotHit {
                target,
                damage: stats.damage,
                point: hit.point,
            }),
            _ => None,
        })
        .collect()
}

/// Combat system for health bookkeeping
pub struct CombatSystem;

impl CombatSystem {
    /// Apply damage to health, returns (new_health, is_dead)
    pub fn apply_damage(current_health: f32, damage: f32) -> (f32, bool) {
        let new_health = (current_health - damage.max(0.0)).max(0.0);
        (new_health, new_health <= 0.0)
    }
}
