// =============================================================================
// Rate Limiters — token buckets for the exchange's published budgets
// =============================================================================
//
// Indodax enforces separate budgets:
//   - Public REST:    3 req/s.
//   - Private trade: 20 req/s.
//   - Private cancel: 30 req/s.
//
// Each budget is a token bucket that refills continuously. `acquire` blocks
// until a token is available or the engine is shutting down.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{EngineError, EngineResult};

/// Requests per second for anonymous public endpoints.
const PUBLIC_PER_SEC: f64 = 3.0;
/// Requests per second for signed trade-class calls.
const TRADE_PER_SEC: f64 = 20.0;
/// Requests per second for cancel calls.
const CANCEL_PER_SEC: f64 = 30.0;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A continuously-refilling token bucket. Capacity equals the per-second
/// rate, so at most one second of burst is ever accumulated.
pub struct TokenBucket {
    rate_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64) -> Self {
        Self {
            rate_per_sec,
            state: Mutex::new(BucketState {
                tokens: rate_per_sec,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, returning how long to wait if none is available yet.
    fn try_take(&self) -> Option<Duration> {
        let mut state = self.state.lock();

        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.rate_per_sec);
        state.last_refill = Instant::now();

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            None
        } else {
            let deficit = 1.0 - state.tokens;
            Some(Duration::from_secs_f64(deficit / self.rate_per_sec))
        }
    }

    /// Block until a token is available. Returns an error if the engine shuts
    /// down while waiting.
    pub async fn acquire(&self, cancel: &CancellationToken) -> EngineResult<()> {
        loop {
            match self.try_take() {
                None => return Ok(()),
                Some(wait) => {
                    trace!(wait_ms = wait.as_millis() as u64, "rate limiter backpressure");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(EngineError::Internal(
                                "cancelled while waiting for rate limit".into(),
                            ));
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }
}

/// The three exchange budgets, shared by every user of the client.
pub struct RateLimits {
    pub public: TokenBucket,
    pub trade: TokenBucket,
    pub cancel: TokenBucket,
}

impl RateLimits {
    pub fn new() -> Self {
        Self {
            public: TokenBucket::new(PUBLIC_PER_SEC),
            trade: TokenBucket::new(TRADE_PER_SEC),
            cancel: TokenBucket::new(CANCEL_PER_SEC),
        }
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
