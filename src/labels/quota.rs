//! Fixed-window request budget shared by every label worker.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::info;

use crate::clock::{sleep_unless_stopped, Clock};

#[derive(Debug, Default)]
struct Window {
    started: Option<Instant>,
    used: u32,
    /// Start of the last window already counted as a pause.
    paused: Option<Instant>,
}

pub struct QuotaLimiter {
    per_window: u32,
    window: Duration,
    state: Mutex<Window>,
    pauses: AtomicU32,
}

impl QuotaLimiter {
    pub fn new(per_window: u32, window: Duration) -> Self {
        Self {
            per_window: per_window.max(1),
            window,
            state: Mutex::new(Window::default()),
            pauses: AtomicU32::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Window> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Roll the window over if it has expired.
    fn refresh(&self, state: &mut Window, now: Instant) {
        match state.started {
            Some(start) if now.duration_since(start) < self.window => {}
            _ => {
                state.started = Some(now);
                state.used = 0;
            }
        }
    }

    /// Take one request slot, blocking until the window resets when the
    /// budget is spent. Returns false if `stop` was raised while waiting.
    pub fn acquire(&self, clock: &dyn Clock, stop: &AtomicBool) -> bool {
        loop {
            let wait = {
                let mut state = self.lock();
                let now = clock.now();
                self.refresh(&mut state, now);
                if state.used < self.per_window {
                    state.used += 1;
                    return true;
                }
                let start = state.started.unwrap_or(now);
                if state.paused != Some(start) {
                    state.paused = Some(start);
                    self.pauses.fetch_add(1, Ordering::SeqCst);
                    info!(
                        used = state.used,
                        window_secs = self.window.as_secs(),
                        "Label quota exhausted, pausing until window resets"
                    );
                }
                self.window.saturating_sub(now.duration_since(start))
            };

            if !sleep_unless_stopped(clock, wait.max(Duration::from_millis(1)), stop) {
                return false;
            }
        }
    }

    /// The service reported its quota exhausted before the local budget
    /// ran out; treat the current window as spent.
    pub fn exhaust(&self, clock: &dyn Clock) {
        let mut state = self.lock();
        let now = clock.now();
        self.refresh(&mut state, now);
        state.used = self.per_window;
    }

    /// How many distinct windows ran dry.
    pub fn pauses(&self) -> u32 {
        self.pauses.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_budget_then_pause_then_resume() {
        let clock = ManualClock::new();
        let stop = AtomicBool::new(false);
        let quota = QuotaLimiter::new(5, Duration::from_secs(60));

        for _ in 0..5 {
            assert!(quota.acquire(&clock, &stop));
        }
        assert!(clock.sleeps().is_empty());
        assert_eq!(quota.pauses(), 0);

        assert!(quota.acquire(&clock, &stop));
        assert_eq!(quota.pauses(), 1);
        assert_eq!(clock.total_slept(), Duration::from_secs(60));
    }

    #[test]
    fn test_exhaust_forces_wait() {
        let clock = ManualClock::new();
        let stop = AtomicBool::new(false);
        let quota = QuotaLimiter::new(5, Duration::from_secs(10));
        assert!(quota.acquire(&clock, &stop));
        quota.exhaust(&clock);
        assert!(quota.acquire(&clock, &stop));
        assert_eq!(clock.total_slept(), Duration::from_secs(10));
        assert_eq!(quota.pauses(), 1);
    }

    #[test]
    fn test_stop_while_paused() {
        let clock = ManualClock::new();
        let stop = AtomicBool::new(false);
        let quota = QuotaLimiter::new(1, Duration::from_secs(10));
        assert!(quota.acquire(&clock, &stop));
        stop.store(true, Ordering::SeqCst);
        assert!(!quota.acquire(&clock, &stop));
    }
}
