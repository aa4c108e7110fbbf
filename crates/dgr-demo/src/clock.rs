use std::time::{Duration, Instant};

/// Frame timing snapshot.
#[derive(Debug, Copy, Clone)]
pub struct FrameTime {
    /// Time elapsed since the previous tick, in seconds.
    pub dt: f32,

    /// Monotonic timestamp taken at the tick.
    pub now: Instant,

    /// Monotonic frame counter.
    pub frame_index: u64,
}

/// Fixed-rate frame clock for a headless render loop.
///
/// `tick()` sleeps until the next frame slot and reports the clamped delta.
/// Only the master's delta matters for the replicated scene; slaves tick to
/// keep their own pacing.
#[derive(Debug, Clone)]
pub struct FrameClock {
    last: Instant,
    next_deadline: Instant,
    interval: Duration,
    frame_index: u64,
    dt_max: Duration,
}

impl FrameClock {
    /// Creates a clock targeting `fps` frames per second.
    pub fn new(fps: f64) -> Self {
        debug_assert!(fps > 0.0);
        let now = Instant::now();
        let interval = Duration::from_secs_f64(1.0 / fps);
        Self {
            last: now,
            next_deadline: now + interval,
            interval,
            frame_index: 0,
            dt_max: Duration::from_millis(250),
        }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits for the next frame slot and returns its `FrameTime`.
    pub fn tick(&mut self) -> FrameTime {
        let now = Instant::now();
        if let Some(remaining) = self.next_deadline.checked_duration_since(now) {
            std::thread::sleep(remaining);
        }

        let now = Instant::now();
        // A long stall (debugger, suspended terminal) restarts pacing instead of
        // replaying missed frames back to back.
        self.next_deadline = if now > self.next_deadline + self.interval {
            now + self.interval
        } else {
            self.next_deadline + self.interval
        };

        let dt = now.saturating_duration_since(self.last).min(self.dt_max);
        self.last = now;

        let ft = FrameTime {
            dt: dt.as_secs_f32(),
            now,
            frame_index: self.frame_index,
        };
        self.frame_index = self.frame_index.wrapping_add(1);
        ft
    }
}
