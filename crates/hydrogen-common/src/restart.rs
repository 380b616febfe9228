//! Sliding-window restart bookkeeping for supervised drivers.
//!
//! Every unexpected exit is timestamped. Exits older than the window are
//! forgotten, which is the only way the counter resets on its own; an
//! operator `stop` or `start` clears it explicitly via [`RestartWindow::reset`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// What to do after an unexpected exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart the driver; `attempt` counts exits still inside the window.
    Restart {
        /// 1-based attempt number within the current window.
        attempt: u32,
    },
    /// The driver exceeded its budget and must stay stopped.
    GiveUp {
        /// Number of exits inside the window, including this one.
        exits: u32,
    },
}

impl RestartDecision {
    /// Returns true if the driver should be restarted.
    pub fn should_restart(&self) -> bool {
        matches!(self, RestartDecision::Restart { .. })
    }
}

/// Tracks unexpected exits within a sliding time window.
///
/// With `max_restarts = N`, exits 1 through N inside one window each yield
/// [`RestartDecision::Restart`]; exit N+1 yields [`RestartDecision::GiveUp`].
#[derive(Debug, Clone)]
pub struct RestartWindow {
    max_restarts: u32,
    window: Duration,
    exits: VecDeque<Instant>,
}

impl RestartWindow {
    /// Creates a new tracker.
    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts,
            window,
            exits: VecDeque::new(),
        }
    }

    /// Returns the configured restart budget.
    pub fn max_restarts(&self) -> u32 {
        self.max_restarts
    }

    /// Returns the observation window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Records an unexpected exit happening now.
    pub fn record_exit(&mut self) -> RestartDecision {
        self.record_exit_at(Instant::now())
    }

    /// Records an unexpected exit at the given instant.
    pub fn record_exit_at(&mut self, now: Instant) -> RestartDecision {
        self.prune(now);
        self.exits.push_back(now);

        let exits = self.exits.len() as u32;
        if exits <= self.max_restarts {
            RestartDecision::Restart { attempt: exits }
        } else {
            RestartDecision::GiveUp { exits }
        }
    }

    /// Returns how many exits fall inside the window ending at `now`.
    pub fn exits_in_window(&mut self, now: Instant) -> u32 {
        self.prune(now);
        self.exits.len() as u32
    }

    /// Forgets all recorded exits.
    pub fn reset(&mut self) {
        self.exits.clear();
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.exits.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.exits.pop_front();
            } else {
                break;
            }
        }
    }
}
