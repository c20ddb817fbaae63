//! High-resolution timer for frame pacing.

use std::time::{Duration, Instant};

/// Smoothing factor for the exponentially averaged delta.
const DELTA_SMOOTHING: f32 = 0.1;

/// High-resolution timer for measuring elapsed and per-frame time.
///
/// In addition to the raw delta between ticks, the timer maintains an
/// exponentially smoothed delta that absorbs single-frame spikes (shader
/// warm-up, page faults), which is what pacing decisions should use.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    last_tick: Instant,
    smoothed_delta: f32,
    ticks: u64,
}

impl Timer {
    /// Create a new timer, starting from now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
            smoothed_delta: 0.0,
            ticks: 0,
        }
    }

    /// Get the total elapsed time since the timer was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Get the elapsed time in seconds since the timer was created.
    pub fn elapsed_secs(&self) -> f32 {
        self.elapsed().as_secs_f32()
    }

    /// Get the time elapsed since the last call to `tick()` and fold it
    /// into the smoothed delta.
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let delta = now - self.last_tick;
        self.last_tick = now;

        let secs = delta.as_secs_f32();
        if self.ticks == 0 {
            self.smoothed_delta = secs;
        } else {
            self.smoothed_delta += (secs - self.smoothed_delta) * DELTA_SMOOTHING;
        }
        self.ticks += 1;

        delta
    }

    /// Get the delta time in seconds since the last tick.
    pub fn delta_secs(&mut self) -> f32 {
        self.tick().as_secs_f32()
    }

    /// Get the exponentially smoothed delta in seconds.
    ///
    /// Returns 0.0 before the first tick.
    pub fn smoothed_delta_secs(&self) -> f32 {
        self.smoothed_delta
    }

    /// Number of times `tick()` has been called.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Reset the timer to the current time.
    pub fn reset(&mut self) {
        let now = Instant::now();
        self.start = now;
        self.last_tick = now;
        self.smoothed_delta = 0.0;
        self.ticks = 0;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_advances() {
        let mut timer = Timer::new();
        std::thread::sleep(Duration::from_millis(2));
        let delta = timer.tick();
        assert!(delta >= Duration::from_millis(2));
        assert_eq!(timer.ticks(), 1);
    }

    #[test]
    fn test_first_tick_seeds_smoothed_delta() {
        let mut timer = Timer::new();
        std::thread::sleep(Duration::from_millis(2));
        let delta = timer.delta_secs();
        assert_eq!(timer.smoothed_delta_secs(), delta);
    }

    #[test]
    fn test_smoothed_delta_follows_raw_delta() {
        let mut timer = Timer::new();
        timer.tick();
        let before = timer.smoothed_delta_secs();
        std::thread::sleep(Duration::from_millis(5));
        timer.tick();
        // One 5ms tick after a near-zero seed must pull the average up.
        assert!(timer.smoothed_delta_secs() > before);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut timer = Timer::new();
        std::thread::sleep(Duration::from_millis(1));
        timer.tick();
        timer.reset();
        assert_eq!(timer.ticks(), 0);
        assert_eq!(timer.smoothed_delta_secs(), 0.0);
    }
}
