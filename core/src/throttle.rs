use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;

const MAX_SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct ThrottleState {
    start: Instant,
    bytes: u64,
    limit_bytes_per_sec: u64,
}

impl ThrottleState {
    fn reserve_sleep(&mut self, bytes: u64) -> Duration {
        self.bytes = self.bytes.saturating_add(bytes);
        if self.limit_bytes_per_sec == 0 {
            return Duration::ZERO;
        }
        let expected = self.bytes as f64 / self.limit_bytes_per_sec as f64;
        let elapsed = self.start.elapsed().as_secs_f64();
        if expected > elapsed {
            Duration::from_secs_f64(expected - elapsed)
        } else {
            Duration::ZERO
        }
    }
}

/// Byte-rate limit shared by every worker of a job.
#[derive(Debug, Clone, Default)]
pub struct Throttle {
    state: Option<Arc<Mutex<ThrottleState>>>,
}

impl Throttle {
    pub fn new(limit_bytes_per_sec: Option<u64>) -> Self {
        let state = limit_bytes_per_sec.filter(|limit| *limit > 0).map(|limit| {
            Arc::new(Mutex::new(ThrottleState {
                start: Instant::now(),
                bytes: 0,
                limit_bytes_per_sec: limit,
            }))
        });
        Self { state }
    }

    pub fn is_limited(&self) -> bool {
        self.state.is_some()
    }

    /// Accounts `bytes` and sleeps until the average rate is back under the
    /// limit, waking early when `cancel` fires.
    pub fn throttle(&self, bytes: u64, cancel: &CancelToken) {
        let Some(state) = &self.state else {
            return;
        };
        let mut remaining = match state.lock() {
            Ok(mut guard) => guard.reserve_sleep(bytes),
            Err(_) => return,
        };
        while !remaining.is_zero() && !cancel.is_cancelled() {
            let slice = remaining.min(MAX_SLEEP_SLICE);
            thread::sleep(slice);
            remaining -= slice;
        }
    }
}
