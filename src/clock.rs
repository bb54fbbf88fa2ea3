//! Time source for the limiter and fusing windows.
//!
//! Production code uses [`SystemClock`]. Unit tests use `MockClock` to move
//! time explicitly.

use std::time::Instant;

/// Source of the current instant.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// System clock implementation using `Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[cfg(test)]
pub use mock::MockClock;

#[cfg(test)]
mod mock {
    use super::Clock;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    /// Clock whose time only moves when told to.
    ///
    /// All clones share the same underlying instant, so a clone handed to a
    /// limiter can be advanced from the test body.
    #[derive(Debug, Clone)]
    pub struct MockClock {
        current_time: Arc<Mutex<Instant>>,
    }

    impl MockClock {
        pub fn new(start: Instant) -> Self {
            Self {
                current_time: Arc::new(Mutex::new(start)),
            }
        }

        pub fn advance(&self, duration: Duration) {
            let mut time = self
                .current_time
                .lock()
                .expect("MockClock mutex poisoned");
            *time += duration;
        }
    }

    impl Default for MockClock {
        fn default() -> Self {
            Self::new(Instant::now())
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> Instant {
            *self
                .current_time
                .lock()
                .expect("MockClock mutex poisoned")
        }
    }
}
