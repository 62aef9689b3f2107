//! Discrete activity start/stop handling.
//!
//! Activities arrive as reliable ordered events and are dispatched through
//! [`ActivityHandler`] with a plain `match`, so every activity kind has
//! exactly one start and one stop path known at compile time.

use crate::ws::protocol::{Activity, ActivityEvent, ActivityPhase};

use super::combat::WeaponStats;

pub trait ActivityHandler {
    fn on_activity_start(&mut self, activity: Activity, arg: Option<i32>);
    fn on_activity_stop(&mut self, activity: Activity, arg: Option<i32>);
}

/// Route one event to the matching handler method
pub fn dispatch<H: ActivityHandler + ?Sized>(handler: &mut H, event: &ActivityEvent) {
    match event.phase {
        ActivityPhase::Start => handler.on_activity_start(event.activity, event.arg),
        ActivityPhase::Stop => handler.on_activity_stop(event.activity, event.arg),
    }
}

/// In-flight weapon switch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingSwitch {
    pub target: i32,
    pub remaining: f32,
}

/// Current activity flags of one entity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivityFlags {
    pub crouching: bool,
    pub running: bool,
    pub reloading: bool,
    pub zoomed: bool,
    pub climbing: bool,
    pub out_of_control: bool,
    pub attacking: bool,
    pub switch: Option<PendingSwitch>,
}

impl ActivityFlags {
    pub fn switching(&self) -> bool {
        self.switch.is_some()
    }

    pub fn switch_target(&self) -> Option<i32> {
        self.switch.map(|s| s.target)
    }

    pub fn cancel_switch(&mut self) {
        self.switch = None;
    }

    /// Count down the pending switch; returns the new weapon index once it completes
    pub fn advance_switch(&mut self, dt: f32) -> Option<i32> {
        let pending = self.switch.as_mut()?;
        pending.remaining -= dt;
        if pending.remaining > 0.0 {
            return None;
        }
        let target = pending.target;
        self.switch = None;
        Some(target)
    }

    /// Cleared on death and respawn
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl ActivityHandler for ActivityFlags {
    fn on_activity_start(&mut self, activity: Activity, arg: Option<i32>) {
        match activity {
            Activity::Crouch => self.crouching = true,
            Activity::Run => self.running = true,
            Activity::Reload => self.reloading = true,
            Activity::Zoom => self.zoomed = true,
            Activity::Climb => self.climbing = true,
            Activity::OutOfControl => self.out_of_control = true,
            Activity::Attack => self.attacking = true,
            Activity::WeaponSwitch => {
                if let Some(target) = arg {
                    let remaining = WeaponStats::for_index(target)
                        .map(|w| w.switch_time)
                        .unwrap_or(0.0);
                    self.switch = Some(PendingSwitch { target, remaining });
                }
            }
        }
    }

    fn on_activity_stop(&mut self, activity: Activity, _arg: Option<i32>) {
        match activity {
            Activity::Crouch => self.crouching = false,
            Activity::Run => self.running = false,
            Activity::Reload => self.reloading = false,
            Activity::Zoom => self.zoomed = false,
            Activity::Climb => self.climbing = false,
            Activity::OutOfControl => self.out_of_control = false,
            Activity::Attack => self.attacking = false,
            // Switches complete on their own timer
            Activity::WeaponSwitch => {}
        }
    }
}
