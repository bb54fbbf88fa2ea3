//! Fixed-window request limiter keyed by `node/service/action`.
//!
//! Every key owns its own window; the check-and-increment for a key runs
//! under that key's shard lock, so concurrent calls for one key are counted
//! exactly and calls for different keys rarely contend.

use std::time::Instant;

use dashmap::DashMap;

use super::spec::{SpecError, WindowSpec};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone, Copy)]
struct LimiterWindow {
    started: Instant,
    count: u64,
}

impl LimiterWindow {
    fn admit(&mut self, now: Instant, spec: WindowSpec) -> bool {
        if self.count == 0 || now.duration_since(self.started) >= spec.window {
            self.started = now;
            self.count = 1;
            return true;
        }
        self.count += 1;
        self.count <= spec.count
    }
}

/// Process-wide limiter state. Windows are created on first use and kept for
/// the lifetime of the limiter.
#[derive(Debug, Default)]
pub struct RateLimiter<C = SystemClock> {
    windows: DashMap<String, LimiterWindow>,
    clock: C,
}

impl RateLimiter<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Parses a limiter spec such as `"1/100"` (100 calls per second).
    pub fn analyze(spec: &str) -> Result<WindowSpec, SpecError> {
        WindowSpec::parse(spec)
    }
}

impl<C: Clock> RateLimiter<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
        }
    }

    /// Counts one call against `key` and reports whether it fits the window.
    ///
    /// A missing or elapsed window restarts at this call with a count of 1.
    pub fn inspect(&self, key: &str, spec: WindowSpec) -> bool {
        let now = self.clock.now();
        if let Some(mut window) = self.windows.get_mut(key) {
            return window.admit(now, spec);
        }
        self.windows
            .entry(key.to_owned())
            .or_insert(LimiterWindow {
                started: now,
                count: 0,
            })
            .admit(now, spec)
    }

    /// Number of keys ever seen.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}
