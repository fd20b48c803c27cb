//! Crash-loop detection for the active slave.

use std::collections::VecDeque;
use tokio::time::Instant;

use crate::config::CrashLimit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CrashVerdict {
    /// Respawn; `attempt` counts crashes inside the current window.
    Respawn { attempt: usize },
    /// Too many crashes inside the window.
    GiveUp { crashes: usize },
}

/// Sliding window of recent crash times.
#[derive(Debug)]
pub(crate) struct CrashTracker {
    limit: CrashLimit,
    recent: VecDeque<Instant>,
}

impl CrashTracker {
    pub fn new(limit: CrashLimit) -> Self {
        Self {
            limit,
            recent: VecDeque::with_capacity(limit.max_restarts + 1),
        }
    }

    pub fn record(&mut self, at: Instant) -> CrashVerdict {
        while let Some(&oldest) = self.recent.front() {
            if at.duration_since(oldest) > self.limit.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        self.recent.push_back(at);

        let crashes = self.recent.len();
        if crashes > self.limit.max_restarts {
            CrashVerdict::GiveUp { crashes }
        } else {
            CrashVerdict::Respawn { attempt: crashes }
        }
    }
}
