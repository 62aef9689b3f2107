//! Rate limiting for inbound relay frames

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter type alias
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Create a rate limiter with the specified frames per second
pub fn create_limiter(per_second: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Default inbound frame budget per peer (samples at 30 Hz plus discrete events)
pub const PEER_FRAME_RATE_LIMIT: u32 = 120;

/// Per-peer rate limiter state
#[derive(Clone)]
pub struct PeerRateLimiter {
    frame_limiter: Arc<Limiter>,
}

impl PeerRateLimiter {
    pub fn new(per_second: u32) -> Self {
        Self {
            frame_limiter: create_limiter(per_second),
        }
    }

    /// Check if an inbound frame is allowed (returns true if allowed)
    pub fn check_frame(&self) -> bool {
        self.frame_limiter.check().is_ok()
    }
}

impl Default for PeerRateLimiter {
    fn default() -> Self {
        Self::new(PEER_FRAME_RATE_LIMIT)
    }
}
