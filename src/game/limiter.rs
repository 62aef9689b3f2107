//! Fire-event replay queue.
//!
//! Remote fire events are never replayed as fast as they arrive. They are
//! queued in arrival order and released at most one per tick, no faster
//! than the weapon's legal interval, so a peer that sends a burst gains
//! nothing over one that fires at the legal rate.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::ws::protocol::FireEvent;

/// Upper bound on queued events; older events are discarded first
pub const FIRE_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct FireReplayQueue {
    pending: VecDeque<FireEvent>,
    cooldown_ticks: u32,
    dropped_stale: u64,
    dropped_overflow: u64,
}

impl FireReplayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: FireEvent) {
        if self.pending.len() >= FIRE_QUEUE_CAPACITY {
            self.pending.pop_front();
            self.dropped_overflow += 1;
            warn!(
                dropped = self.dropped_overflow,
                "Fire queue overflow, discarding oldest event"
            );
        }
        self.pending.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn dropped_stale(&self) -> u64 {
        self.dropped_stale
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.cooldown_ticks = 0;
    }

    /// Advance one simulation tick and release at most one event.
    ///
    /// Events queued for a weapon other than `current_weapon` are discarded.
    /// Nothing is released while a weapon switch is in progress.
    /// `interval_ticks` maps a weapon index to its legal firing interval.
    pub fn tick(
        &mut self,
        current_weapon: i32,
        switching: bool,
        interval_ticks: impl Fn(i32) -> u32,
    ) -> Option<FireEvent> {
        self.cooldown_ticks = self.cooldown_ticks.saturating_sub(1);
        if self.cooldown_ticks > 0 || switching {
            return None;
        }

        while let Some(front) = self.pending.front() {
            if front.weapon_index == current_weapon {
                break;
            }
            debug!(
                weapon = front.weapon_index,
                current_weapon, "Discarding fire event for a weapon no longer equipped"
            );
            self.pending.pop_front();
            self.dropped_stale += 1;
        }

        let event = self.pending.pop_front()?;
        self.cooldown_ticks = interval_ticks(event.weapon_index).max(1);
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    fn shot(weapon_index: i32, seed: i64) -> FireEvent {
        FireEvent {
            weapon_index,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            seed,
        }
    }

    fn replay_times(queue: &mut FireReplayQueue, ticks: u32, interval: u32) -> Vec<u32> {
        (0..ticks)
            .filter(|_| queue.tick(0, false, |_| interval).is_some())
            .collect()
    }

    #[test]
    fn burst_is_released_at_the_legal_interval() {
        for interval in [1_u32, 2, 3, 7] {
            let mut queue = FireReplayQueue::new();
            for seed in 0..40 {
                queue.push(shot(0, seed));
            }
            let fired = replay_times(&mut queue, 60, interval);

            for pair in fired.windows(2) {
                assert!(pair[1] - pair[0] >= interval, "interval {interval}: {fired:?}");
            }
            // Any window of `w` ticks holds at most ceil(w / interval) replays
            for w in 1..=20_u32 {
                let bound = w.div_ceil(interval) as usize;
                for start in 0..60_u32 {
                    let n = fired.iter().filter(|t| **t >= start && **t < start + w).count();
                    assert!(n <= bound, "window {w} at {start}: {n} > {bound}");
                }
            }
        }
    }

    #[test]
    fn events_replay_in_arrival_order() {
        let mut queue = FireReplayQueue::new();
        for seed in [5, 6, 7] {
            queue.push(shot(0, seed));
        }
        let seeds: Vec<i64> = (0..3)
            .filter_map(|_| queue.tick(0, false, |_| 1))
            .map(|e| e.seed)
            .collect();
        assert_eq!(seeds, vec![5, 6, 7]);
    }

    #[test]
    fn stale_weapon_events_are_dropped_not_replayed() {
        let mut queue = FireReplayQueue::new();
        queue.push(shot(1, 0));
        queue.push(shot(1, 1));
        queue.push(shot(2, 2));

        let released = queue.tick(2, false, |_| 1).unwrap();
        assert_eq!(released.seed, 2);
        assert_eq!(queue.dropped_stale(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn nothing_released_mid_switch() {
        let mut queue = FireReplayQueue::new();
        queue.push(shot(0, 0));
        assert!(queue.tick(0, true, |_| 1).is_none());
        assert_eq!(queue.len(), 1);
        assert!(queue.tick(0, false, |_| 1).is_some());
    }

    #[test]
    fn overflow_discards_oldest() {
        let mut queue = FireReplayQueue::new();
        for seed in 0..(FIRE_QUEUE_CAPACITY as i64 + 3) {
            queue.push(shot(0, seed));
        }
        assert_eq!(queue.len(), FIRE_QUEUE_CAPACITY);
        assert_eq!(queue.tick(0, false, |_| 1).unwrap().seed, 3);
    }
}
