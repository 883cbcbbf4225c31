use std::time::Instant;

pub trait TimeSource: Send {
    fn now_us(&mut self) -> i64;
}

/// Microseconds since the source was created.
pub struct MonotonicTime {
    origin: Instant,
}

impl MonotonicTime {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTime {
    fn now_us(&mut self) -> i64 {
        self.origin.elapsed().as_micros() as i64
    }
}

/// Per-pipeline presentation clock. Timestamps handed out by
/// [`PresentationClock::output_timestamp`] never go backwards: when the raw
/// source reads below the last emitted value, the result is the last emitted
/// value plus whatever time the source reports as elapsed since its previous
/// reading.
pub struct PresentationClock {
    source: Box<dyn TimeSource>,
    prev_output_us: i64,
    last_raw_us: Option<i64>,
}

impl PresentationClock {
    pub fn new(source: Box<dyn TimeSource>) -> Self {
        Self {
            source,
            prev_output_us: 0,
            last_raw_us: None,
        }
    }

    pub fn monotonic() -> Self {
        Self::new(Box::new(MonotonicTime::new()))
    }

    fn sample(&mut self) -> i64 {
        let raw = self.source.now_us();
        let elapsed = self
            .last_raw_us
            .map(|last| (raw - last).max(0))
            .unwrap_or(0);
        self.last_raw_us = Some(raw);
        if raw < self.prev_output_us {
            log::trace!(
                "clock regression: raw {}us < previous {}us",
                raw,
                self.prev_output_us
            );
            self.prev_output_us + elapsed
        } else {
            raw
        }
    }

    /// Timestamp for a raw unit going into the encoder.
    pub fn input_timestamp(&mut self) -> i64 {
        self.sample()
    }

    /// Timestamp for a compressed unit leaving the pipeline.
    pub fn output_timestamp(&mut self) -> i64 {
        let pts = self.sample();
        self.prev_output_us = pts;
        pts
    }

    pub fn last_output_us(&self) -> i64 {
        self.prev_output_us
    }
}
