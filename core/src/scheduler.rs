use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Idle,
    Running,
    Draining,
    Stopped,
}

impl PoolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolState::Idle => "idle",
            PoolState::Running => "running",
            PoolState::Draining => "draining",
            PoolState::Stopped => "stopped",
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PoolState::Idle => 0,
            PoolState::Running => 1,
            PoolState::Draining => 2,
            PoolState::Stopped => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => PoolState::Idle,
            1 => PoolState::Running,
            2 => PoolState::Draining,
            _ => PoolState::Stopped,
        }
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pool lifecycle readable from any thread.
#[derive(Debug)]
pub struct StateCell {
    value: AtomicU8,
}

impl StateCell {
    pub fn new(state: PoolState) -> Self {
        Self {
            value: AtomicU8::new(state.as_u8()),
        }
    }

    pub fn get(&self) -> PoolState {
        PoolState::from_u8(self.value.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: PoolState) {
        self.value.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Moves `from -> to` only when currently in `from`.
    pub fn transition(&self, from: PoolState, to: PoolState) -> bool {
        self.value
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    pub max_active: usize,
}

impl Scheduler {
    pub fn new(max_active: usize) -> Self {
        Self {
            max_active: max_active.max(1),
        }
    }

    /// Workers worth spawning for `queued` tasks with `active` already running.
    pub fn slots_to_fill(&self, active_count: usize, queued: usize) -> usize {
        self.max_active.saturating_sub(active_count).min(queued)
    }
}
