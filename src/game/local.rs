//! Local authority adapter: mirrors this peer's simulation into the outgoing stream

use glam::{EulerRot, Quat, Vec2, Vec3};
use tracing::debug;

use crate::ws::protocol::{
    Activity, ActivityEvent, ActivityPhase, ContinuousSample, FireEvent, PlatformId, NO_PLATFORM,
};

use super::activity::dispatch;
use super::combat::WeaponStats;
use super::entity::{EntityState, Platforms};

#[derive(Debug, Clone)]
pub struct LocalAdapter {
    platform: PlatformId,
    input_vector: Vec2,
    /// Next deterministic shot seed; never decreases, unlike the replicated stat
    next_seed: i64,
    cooldown_ticks: u32,
}

impl Default for LocalAdapter {
    fn default() -> Self {
        Self {
            platform: NO_PLATFORM,
            input_vector: Vec2::ZERO,
            next_seed: 0,
            cooldown_ticks: 0,
        }
    }
}

impl LocalAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn platform(&self) -> PlatformId {
        self.platform
    }

    pub fn attach_platform(&mut self, platform: PlatformId) {
        self.platform = platform;
    }

    pub fn detach_platform(&mut self) {
        self.platform = NO_PLATFORM;
    }

    pub fn set_input(&mut self, input: Vec2) {
        self.input_vector = input;
    }

    pub fn next_seed(&self) -> i64 {
        self.next_seed
    }

    /// Continuous sample for this network tick.
    ///
    /// Position is platform-relative while standing on a known platform.
    pub fn sample(&self, state: &EntityState, platforms: &Platforms) -> ContinuousSample {
        let (platform_id, position) = match platforms.get(&self.platform) {
            Some(platform) => (self.platform, platform.to_local(state.position)),
            None => (NO_PLATFORM, state.position),
        };
        let yaw = state.rotation.to_euler(EulerRot::YXZ).0;
        ContinuousSample {
            platform_id,
            position,
            rotation: Vec2::new(state.pitch, yaw),
            velocity: state.velocity,
            input_vector: self.input_vector,
            weapon_index: state.weapon_index,
        }
    }

    /// Apply a locally triggered activity and build the event to broadcast
    pub fn activity(
        &mut self,
        state: &mut EntityState,
        activity: Activity,
        phase: ActivityPhase,
        arg: Option<i32>,
    ) -> ActivityEvent {
        let event = ActivityEvent {
            activity,
            phase,
            arg,
        };
        dispatch(&mut state.activities, &event);
        event
    }

    /// Begin switching to `target`; `None` if the index is invalid or already selected
    pub fn switch_weapon(&mut self, state: &mut EntityState, target: i32) -> Option<ActivityEvent> {
        WeaponStats::for_index(target)?;
        let current = state.activities.switch_target().unwrap_or(state.weapon_index);
        if current == target {
            return None;
        }
        Some(self.activity(
            state,
            Activity::WeaponSwitch,
            ActivityPhase::Start,
            Some(target),
        ))
    }

    /// Fire the equipped weapon if the legal interval allows it
    pub fn try_fire(
        &mut self,
        state: &mut EntityState,
        muzzle: Vec3,
        aim: Quat,
        tick_rate: u32,
    ) -> Option<FireEvent> {
        if state.frozen || state.activities.switching() || self.cooldown_ticks > 0 {
            return None;
        }
        let weapon = WeaponStats::for_index(state.weapon_index)?;

        let seed = self.next_seed;
        self.next_seed += 1;
        state.shots_fired = state.shots_fired.max(self.next_seed);
        self.cooldown_ticks = weapon.fire_interval_ticks(tick_rate);
        debug!(weapon = weapon.name, seed, "Local shot");

        Some(FireEvent {
            weapon_index: state.weapon_index,
            position: muzzle,
            rotation: aim,
            seed,
        })
    }

    /// Advance one simulation tick; returns the new weapon when a switch completes
    pub fn tick(&mut self, state: &mut EntityState, dt: f32) -> Option<i32> {
        self.cooldown_ticks = self.cooldown_ticks.saturating_sub(1);
        let switched = state.activities.advance_switch(dt)?;
        state.weapon_index = switched;
        Some(switched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::world::PlatformTransform;

    #[test]
    fn sample_is_platform_relative_when_attached() {
        let mut platforms = Platforms::new();
        platforms.insert(
            4,
            PlatformTransform::new(Vec3::new(10.0, 0.0, 0.0), Quat::IDENTITY),
        );
        let state = EntityState {
            position: Vec3::new(12.0, 1.0, 0.0),
            rotation: Quat::from_rotation_y(0.5),
            pitch: -0.2,
            ..Default::default()
        };

        let mut adapter = LocalAdapter::new();
        let world = adapter.sample(&state, &platforms);
        assert_eq!(world.platform_id, NO_PLATFORM);
        assert_eq!(world.position, state.position);

        adapter.attach_platform(4);
        let local = adapter.sample(&state, &platforms);
        assert_eq!(local.platform_id, 4);
        assert!(local.position.distance(Vec3::new(2.0, 1.0, 0.0)) < 1e-5);
        assert!((local.rotation.x + 0.2).abs() < 1e-6);
        assert!((local.rotation.y - 0.5).abs() < 1e-5);
    }

    #[test]
    fn unknown_platform_falls_back_to_world_space() {
        let mut adapter = LocalAdapter::new();
        adapter.attach_platform(9);
        let state = EntityState::default();
        let sample = adapter.sample(&state, &Platforms::new());
        assert_eq!(sample.platform_id, NO_PLATFORM);
    }

    #[test]
    fn seeds_increase_and_fire_respects_interval() {
        let mut adapter = LocalAdapter::new();
        let mut state = EntityState::default();
        let first = adapter
            .try_fire(&mut state, Vec3::ZERO, Quat::IDENTITY, 30)
            .unwrap();
        assert_eq!(first.seed, 0);
        assert!(adapter
            .try_fire(&mut state, Vec3::ZERO, Quat::IDENTITY, 30)
            .is_none());

        // Pistol: 0.25 s at 30 Hz
        for _ in 0..8 {
            adapter.tick(&mut state, 1.0 / 30.0);
        }
        let second = adapter
            .try_fire(&mut state, Vec3::ZERO, Quat::IDENTITY, 30)
            .unwrap();
        assert_eq!(second.seed, 1);
        assert_eq!(state.shots_fired, 2);
    }

    #[test]
    fn no_fire_while_frozen_or_switching() {
        let mut adapter = LocalAdapter::new();
        let mut state = EntityState {
            frozen: true,
            ..Default::default()
        };
        assert!(adapter
            .try_fire(&mut state, Vec3::ZERO, Quat::IDENTITY, 30)
            .is_none());

        state.frozen = false;
        let event = adapter.switch_weapon(&mut state, 2).unwrap();
        assert_eq!(event.arg, Some(2));
        assert!(adapter
            .try_fire(&mut state, Vec3::ZERO, Quat::IDENTITY, 30)
            .is_none());
        assert_eq!(adapter.next_seed(), 0);
    }

    #[test]
    fn switch_completes_on_tick() {
        let mut adapter = LocalAdapter::new();
        let mut state = EntityState::default();
        assert!(adapter.switch_weapon(&mut state, 0).is_none());
        assert!(adapter.switch_weapon(&mut state, 7).is_none());
        adapter.switch_weapon(&mut state, 1).unwrap();
        assert_eq!(adapter.tick(&mut state, 1.0), Some(1));
        assert_eq!(state.weapon_index, 1);
    }
}
