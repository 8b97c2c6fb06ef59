//! Blocking waits of the control loop

use std::time::{Duration, Instant};

/// The two intentional blocking points of a cycle go through this seam
pub trait Sleeper {
    /// Block for `duration` and return how long the wait actually took
    fn sleep(&mut self, duration: Duration) -> Duration;
}

/// Sleeps the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) -> Duration {
        let start = Instant::now();
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
        start.elapsed()
    }
}
