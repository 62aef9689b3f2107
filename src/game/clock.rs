//! Match clock

/// Round clock as `{end_time, duration}` on the monotonic time source.
///
/// A zero duration means the clock never runs out.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MatchClock {
    end_time: f64,
    duration: f64,
}

impl MatchClock {
    /// Start a fresh countdown of `duration` seconds at `now`
    pub fn started(now: f64, duration: f64) -> Self {
        Self {
            end_time: now + duration.max(0.0),
            duration: duration.max(0.0),
        }
    }

    /// Rebuild a clock from replicated `{time_left, duration}`
    pub fn from_replicated(now: f64, time_left: f64, duration: f64) -> Self {
        Self {
            end_time: now + time_left.max(0.0),
            duration: duration.max(0.0),
        }
    }

    pub fn reset(&mut self, now: f64, duration: f64) {
        *self = Self::started(now, duration);
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn end_time(&self) -> f64 {
        self.end_time
    }

    pub fn is_open_ended(&self) -> bool {
        self.duration == 0.0
    }

    pub fn is_running(&self, now: f64) -> bool {
        self.is_open_ended() || now < self.end_time
    }

    /// Seconds remaining; zero for open-ended or expired clocks
    pub fn time_left(&self, now: f64) -> f64 {
        if self.is_open_ended() {
            0.0
        } else {
            (self.end_time - now).max(0.0)
        }
    }
}
