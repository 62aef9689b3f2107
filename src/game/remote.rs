//! Remote replica adapter.
//!
//! Drives the displayed transform of an entity simulated on another peer.
//! Each tick: follow the sample's reference frame, dead-reckon, blend toward
//! the latest sample, clamp drift and height, snap to ground, resync the
//! weapon, then release at most one queued shot.

use glam::{EulerRot, Quat, Vec2, Vec3};
use tracing::{debug, trace};

use crate::config::ReplicaConfig;
use crate::ws::protocol::{ContinuousSample, EntityId, FireEvent, PlatformId, NO_PLATFORM};

use super::activity::PendingSwitch;
use super::combat::{clear_owner_collider, shot_rays, WeaponStats, FORWARD};
use super::entity::{EntityState, Platforms};
use super::limiter::FireReplayQueue;
use super::world::{PlatformTransform, WorldQuery};

/// How far above the replica the ground probe starts
const PROBE_LIFT: f32 = 0.5;

/// Collaborators a replica needs for one tick
pub struct ReplicaEnv<'a> {
    pub config: &'a ReplicaConfig,
    pub platforms: &'a Platforms,
    pub world: &'a dyn WorldQuery,
    pub tick_rate: u32,
}

/// A remote shot released by the replay queue, ready for hit resolution
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayedShot {
    pub shooter: EntityId,
    pub weapon_index: i32,
    pub origin: Vec3,
    pub rays: Vec<Vec3>,
    pub seed: i64,
}

/// What happened during one replica tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteTick {
    /// The first sample placed the entity in the world
    pub first_sample: bool,
    /// Drift exceeded the deviation limit and the replica snapped
    pub snapped: bool,
    /// Weapon forced to resynchronize with the wire
    pub forced_switch: Option<i32>,
    pub shot: Option<ReplayedShot>,
}

#[derive(Debug, Clone, Default)]
pub struct RemoteAdapter {
    latest: Option<ContinuousSample>,
    platform: Option<PlatformId>,
    /// Pose of the platform the replica rode last tick
    platform_pose: Option<PlatformTransform>,
    positioned: bool,
    since_spawn: f32,
    fire_queue: FireReplayQueue,
    forced_switches: u32,
}

impl RemoteAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<&ContinuousSample> {
        self.latest.as_ref()
    }

    pub fn is_positioned(&self) -> bool {
        self.positioned
    }

    pub fn queued_shots(&self) -> usize {
        self.fire_queue.len()
    }

    pub fn forced_switches(&self) -> u32 {
        self.forced_switches
    }

    /// Latest sample wins
    pub fn receive_sample(&mut self, sample: ContinuousSample) {
        self.latest = Some(sample);
    }

    pub fn receive_fire(&mut self, event: FireEvent) {
        self.fire_queue.push(event);
    }

    pub fn clear_fire_queue(&mut self) {
        self.fire_queue.clear();
    }

    /// Place the replica at an authoritative position, as after a respawn.
    ///
    /// `rotation` lands verbatim; the held sample keeps only its yaw, which
    /// is all that later smoothing steers toward.
    pub fn teleport(&mut self, state: &mut EntityState, position: Vec3, rotation: Quat) {
        let yaw = rotation.to_euler(EulerRot::YXZ).0;
        self.latest = Some(ContinuousSample {
            platform_id: NO_PLATFORM,
            position,
            rotation: Vec2::new(0.0, yaw),
            velocity: Vec3::ZERO,
            input_vector: Vec2::ZERO,
            weapon_index: state.weapon_index,
        });
        self.platform = Some(NO_PLATFORM);
        self.platform_pose = None;
        self.positioned = true;
        self.since_spawn = 0.0;
        self.fire_queue.clear();

        state.position = position;
        state.rotation = rotation;
        state.pitch = 0.0;
        state.velocity = Vec3::ZERO;
    }

    pub fn tick(
        &mut self,
        id: EntityId,
        state: &mut EntityState,
        dt: f32,
        env: &ReplicaEnv<'_>,
    ) -> RemoteTick {
        let mut out = RemoteTick::default();
        let Some(sample) = self.latest else {
            return out;
        };
        self.since_spawn += dt;

        let frame = env.platforms.get(&sample.platform_id).copied();
        let (target, velocity, frame_rotation) = match frame {
            Some(p) => (p.to_world(sample.position), p.rotation * sample.velocity, p.rotation),
            None => (sample.position, sample.velocity, Quat::IDENTITY),
        };
        let target_yaw = frame_rotation * Quat::from_rotation_y(sample.rotation.y);

        if !self.positioned {
            self.positioned = true;
            self.platform = Some(sample.platform_id);
            self.platform_pose = frame;
            self.since_spawn = 0.0;
            state.position = target;
            state.rotation = target_yaw;
            state.pitch = sample.rotation.x;
            state.velocity = velocity;
            state.weapon_index = sample.weapon_index;
            out.first_sample = true;
            debug!(entity = %id, position = %target, "Replica placed by first sample");
            return out;
        }

        self.follow_platform(id, state, sample.platform_id, frame);
        out.snapped = self.blend_position(state, target, velocity, dt, env);
        if !out.snapped {
            self.clamp_height(state, target, velocity, dt, env);
        }

        let t = (env.config.lerp_rate * dt).min(1.0);
        state.rotation = state.rotation.slerp(target_yaw, t);
        state.pitch += (sample.rotation.x - state.pitch) * t;
        state.velocity = velocity;

        if let Some(weapon) = state.activities.advance_switch(dt) {
            state.weapon_index = weapon;
        }
        out.forced_switch = self.guard_weapon(id, state, sample.weapon_index);
        out.shot = self.replay_fire(id, state, env);
        out
    }

    /// Carry the display position with its platform; on a platform change
    /// the blend resumes from the current world position
    fn follow_platform(
        &mut self,
        id: EntityId,
        state: &mut EntityState,
        platform: PlatformId,
        frame: Option<PlatformTransform>,
    ) {
        if self.platform != Some(platform) {
            debug!(entity = %id, from = ?self.platform, to = platform, "Replica changed platform");
            self.platform = Some(platform);
            self.platform_pose = frame;
            return;
        }
        if let (Some(previous), Some(current)) = (self.platform_pose, frame) {
            state.position = current.to_world(previous.to_local(state.position));
        }
        self.platform_pose = frame;
    }

    /// Dead reckoning, deviation snap, then exponential smoothing.
    /// Returns true when the replica snapped.
    fn blend_position(
        &self,
        state: &mut EntityState,
        target: Vec3,
        velocity: Vec3,
        dt: f32,
        env: &ReplicaEnv<'_>,
    ) -> bool {
        if self.since_spawn >= env.config.extrapolation_warmup {
            state.position += velocity * dt;
        }

        let drift = (state.position - target) * Vec3::new(1.0, 0.0, 1.0);
        if drift.length() > env.config.max_horizontal_deviation {
            trace!(drift = drift.length(), "Replica drift beyond limit, snapping");
            state.position = target;
            return true;
        }

        let t = (env.config.lerp_rate * dt).min(1.0);
        state.position = state.position.lerp(target, t);
        false
    }

    fn clamp_height(
        &self,
        state: &mut EntityState,
        target: Vec3,
        velocity: Vec3,
        dt: f32,
        env: &ReplicaEnv<'_>,
    ) {
        let probe_from = state.position + Vec3::Y * PROBE_LIFT;
        let ground = env
            .world
            .ground_height(probe_from, env.config.ground_probe_distance + PROBE_LIFT);

        let floor = ground.unwrap_or(f32::NEG_INFINITY);
        // Ground wins when the sample itself lies below it
        let ceiling = (target.y + env.config.vertical_margin).max(floor);
        state.position.y = state.position.y.clamp(floor, ceiling);

        if let Some(ground) = ground {
            let falling = velocity.y < 0.0;
            if falling && state.position.y - ground <= env.config.ground_snap_threshold {
                let t = (env.config.ground_snap_rate * dt).min(1.0);
                state.position.y += (ground - state.position.y) * t;
            }
        }
    }

    /// Force a switch when the wire disagrees with the replayed weapon and no
    /// in-flight switch explains it
    fn guard_weapon(&mut self, id: EntityId, state: &mut EntityState, wire: i32) -> Option<i32> {
        if state.weapon_index == wire || state.activities.switch_target() == Some(wire) {
            return None;
        }
        let remaining = WeaponStats::for_index(wire)?.switch_time;
        state.activities.switch = Some(PendingSwitch {
            target: wire,
            remaining,
        });
        self.forced_switches += 1;
        debug!(
            entity = %id,
            local = state.weapon_index,
            wire,
            "Weapon desync, forcing switch"
        );
        Some(wire)
    }

    fn replay_fire(
        &mut self,
        id: EntityId,
        state: &mut EntityState,
        env: &ReplicaEnv<'_>,
    ) -> Option<ReplayedShot> {
        let tick_rate = env.tick_rate;
        let event = self.fire_queue.tick(
            state.weapon_index,
            state.activities.switching(),
            |weapon| {
                WeaponStats::for_index(weapon)
                    .map(|w| w.fire_interval_ticks(tick_rate))
                    .unwrap_or(1)
            },
        )?;
        let weapon = WeaponStats::for_index(event.weapon_index)?;

        let aim = event.rotation * FORWARD;
        let origin = clear_owner_collider(env.world, id, event.position, aim, weapon.range);
        state.shots_fired = state.shots_fired.max(event.seed + 1);

        Some(ReplayedShot {
            shooter: id,
            weapon_index: event.weapon_index,
            origin,
            rays: shot_rays(id, event.seed, event.rotation, &weapon),
            seed: event.seed,
        })
    }
}
