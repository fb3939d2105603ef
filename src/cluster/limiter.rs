//! Token-bucket rate limiting for peer streams

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

struct LimiterState {
    tokens: f64,
    refreshed: Instant,
}

/// Token bucket: `rate` tokens per second with `burst` capacity, starting
/// full. Time comes from the Tokio clock so paused-clock tests can drive it.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    /// Create a limiter refilling at `rate` tokens per second
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            rate: rate.max(f64::MIN_POSITIVE),
            burst,
            state: Mutex::new(LimiterState {
                tokens: burst,
                refreshed: Instant::now(),
            }),
        }
    }

    /// Take a token if one is available right now
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available. Callers bound the wait with their
    /// operation deadline.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }

    fn refill(&self, state: &mut LimiterState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.refreshed).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.refreshed = now;
    }
}
