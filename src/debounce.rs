use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Source of monotonic time, injectable so tests can move the clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Result of asking the debouncer whether a build may start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The build may start. `epoch` counts accepted builds since startup.
    Accepted { epoch: u64 },
    /// A build was accepted less than the window ago.
    TooEarly { retry_after: Duration },
}

#[derive(Debug, Default)]
struct DebounceState {
    last_accepted: Option<Instant>,
    epoch: u64,
}

/// Process-wide debounce gate for build starts.
///
/// The check and the update of the last accepted time happen under one lock,
/// so two concurrent deliveries can never both pass inside the same window.
pub struct Debouncer {
    window: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<DebounceState>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self::with_clock(window, Arc::new(SystemClock))
    }

    pub fn with_clock(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            window,
            clock,
            state: Mutex::new(DebounceState::default()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admits a build if at least `window` has elapsed since the last admitted
    /// one, recording the new start time on success.
    pub fn try_admit(&self) -> Admission {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(last) = state.last_accepted {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.window {
                return Admission::TooEarly {
                    retry_after: self.window - elapsed,
                };
            }
        }

        state.last_accepted = Some(now);
        state.epoch += 1;
        Admission::Accepted { epoch: state.epoch }
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}
