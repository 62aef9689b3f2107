//! Time utilities for replication and the relay

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

/// Server start time for uptime tracking
static SERVER_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(Instant::now);
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Default simulation tick rate
pub const SIMULATION_TPS: u32 = 30;

/// Number of whole ticks covering `seconds` (never less than one)
pub fn seconds_to_ticks(seconds: f32, tick_rate: u32) -> u32 {
    ((seconds * tick_rate as f32).ceil() as u32).max(1)
}

/// Monotonic seconds source.
///
/// Match clocks, respawn timers and nametag grace windows all read from
/// this so that a paused simulation does not stretch them.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> f64;
}

/// Wall-clock monotonic time since construction
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn shared() -> Arc<dyn TimeSource> {
        Arc::new(Self::new())
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Hand-driven clock for tests and offline replays
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, seconds: f64) {
        *self.now.lock() += seconds;
    }

    pub fn set(&self, seconds: f64) {
        *self.now.lock() = seconds;
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(5.0);
        let view = clock.clone();
        clock.advance(1.5);
        assert_eq!(view.now(), 6.5);
        view.set(0.0);
        assert_eq!(clock.now(), 0.0);
    }

    #[test]
    fn seconds_to_ticks_rounds_up() {
        assert_eq!(seconds_to_ticks(0.1, 30), 3);
        assert_eq!(seconds_to_ticks(0.11, 30), 4);
        assert_eq!(seconds_to_ticks(0.0, 30), 1);
    }

    #[test]
    fn monotonic_clock_never_goes_backwards() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
