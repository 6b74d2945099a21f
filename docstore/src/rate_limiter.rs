use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::client::Error;

pub const DEFAULT_INITIAL_OPS_PER_SEC: u32 = 500;
pub const DEFAULT_MAX_OPS_PER_SEC: u32 = 10_000;
pub const DEFAULT_RAMP_UP_INTERVAL: Duration = Duration::from_secs(300);

const RAMP_UP_FACTOR: f64 = 1.5;

/// Throughput throttling mode for the bulk writer.
#[derive(Clone, Debug)]
pub enum Throttling {
    Enabled {
        initial_ops_per_sec: u32,
        max_ops_per_sec: u32,
        ramp_up_interval: Duration,
    },
    Disabled,
}

impl Default for Throttling {
    fn default() -> Self {
        Throttling::Enabled {
            initial_ops_per_sec: DEFAULT_INITIAL_OPS_PER_SEC,
            max_ops_per_sec: DEFAULT_MAX_OPS_PER_SEC,
            ramp_up_interval: DEFAULT_RAMP_UP_INTERVAL,
        }
    }
}

/// Token bucket with a capacity that ramps up over time.
///
/// The cap starts at the configured initial rate and grows by 50% every
/// ramp-up interval until it reaches the maximum. Acquisitions larger than
/// the cap are granted from a full bucket and draw the balance negative, so
/// the long-run rate still holds.
pub struct RateLimiter {
    state: Option<Mutex<State>>,
}

#[derive(Debug)]
struct State {
    capacity: f64,
    max_capacity: f64,
    ramp_up_interval: Duration,
    tokens: f64,
    last_refill: Instant,
    ramp_start: Instant,
    ramp_steps: u32,
}

impl RateLimiter {
    pub fn new(throttling: Throttling) -> Result<Self, Error> {
        match throttling {
            Throttling::Disabled => Ok(Self { state: None }),
            Throttling::Enabled {
                initial_ops_per_sec,
                max_ops_per_sec,
                ramp_up_interval,
            } => {
                if initial_ops_per_sec < 1 {
                    return Err(Error::InvalidConfig(
                        "initial_ops_per_sec must be at least 1".to_string(),
                    ));
                }
                if max_ops_per_sec < initial_ops_per_sec {
                    return Err(Error::InvalidConfig(format!(
                        "max_ops_per_sec {max_ops_per_sec} is below initial_ops_per_sec {initial_ops_per_sec}"
                    )));
                }
                if ramp_up_interval.is_zero() {
                    return Err(Error::InvalidConfig("ramp_up_interval must be positive".to_string()));
                }
                let now = Instant::now();
                Ok(Self {
                    state: Some(Mutex::new(State {
                        capacity: initial_ops_per_sec as f64,
                        max_capacity: max_ops_per_sec as f64,
                        ramp_up_interval,
                        tokens: initial_ops_per_sec as f64,
                        last_refill: now,
                        ramp_start: now,
                        ramp_steps: 0,
                    })),
                })
            }
        }
    }

    /// Attempts to take `n` tokens. Returns `None` when granted, or the
    /// duration after which the tokens will be available. Callers are served
    /// first-come-first-served because the state is locked per call.
    pub fn try_acquire(&self, n: usize) -> Option<Duration> {
        let state = self.state.as_ref()?;
        let mut state = state.lock();
        let now = Instant::now();
        state.advance(now);

        let requested = n as f64;
        // A full bucket is the most that can ever be held, so oversized
        // requests are granted from a full bucket and overdraw the balance.
        let needed = requested.min(state.capacity);
        if state.tokens >= needed {
            state.tokens -= requested;
            return None;
        }
        Some(Duration::from_secs_f64((needed - state.tokens) / state.capacity))
    }

    /// Waits until `n` tokens are granted.
    pub async fn acquire(&self, n: usize) {
        while let Some(wait) = self.try_acquire(n) {
            tokio::time::sleep(wait).await;
        }
    }

    /// The current ops/sec cap, `None` when throttling is disabled.
    pub fn capacity(&self) -> Option<u32> {
        let state = self.state.as_ref()?;
        let mut state = state.lock();
        let now = Instant::now();
        state.advance(now);
        Some(state.capacity as u32)
    }
}

impl State {
    fn advance(&mut self, now: Instant) {
        // apply any ramp-up steps that elapsed since the last call
        let elapsed_steps = (now.duration_since(self.ramp_start).as_millis()
            / self.ramp_up_interval.as_millis().max(1)) as u32;
        while self.ramp_steps < elapsed_steps && self.capacity < self.max_capacity {
            self.capacity = (self.capacity * RAMP_UP_FACTOR).floor().min(self.max_capacity);
            self.ramp_steps += 1;
        }
        self.ramp_steps = elapsed_steps;

        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.capacity).min(self.capacity);
        self.last_refill = now;
    }
}
