//! Transfer progress and block pacing bookkeeping.

use std::time::Duration;

use tokio::time::Instant;

/// One progress report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Percentage with two decimals.
    pub percentage: f64,
    pub remaining_seconds: Option<u64>,
}

/// Rate-limited progress computation for one transfer.
#[derive(Debug)]
pub struct ProgressTracker {
    total: u32,
    started: Instant,
    last_report: Instant,
    interval: Duration,
}

impl ProgressTracker {
    pub fn new(total: u32, interval: Duration, now: Instant) -> Self {
        Self {
            total,
            started: now,
            last_report: now,
            interval,
        }
    }

    /// Record that the device has `bytes` of the image.
    ///
    /// Returns a report at most once per `interval`; the first one comes
    /// only after a full interval since the transfer started.
    pub fn record(&mut self, bytes: u32, now: Instant) -> Option<Progress> {
        if now.duration_since(self.last_report) < self.interval {
            return None;
        }
        self.last_report = now;
        Some(self.compute(bytes, now))
    }

    fn compute(&self, bytes: u32, now: Instant) -> Progress {
        let bytes = bytes.min(self.total);
        let percentage = if self.total == 0 {
            100.0
        } else {
            (f64::from(bytes) / f64::from(self.total) * 10000.0).round() / 100.0
        };

        let elapsed = now.duration_since(self.started).as_secs_f64();
        let rate = f64::from(bytes) / elapsed;
        let remaining = f64::from(self.total - bytes) / rate;
        let remaining_seconds = (remaining.is_finite() && remaining >= 0.0)
            .then(|| remaining.round() as u64);

        Progress {
            percentage,
            remaining_seconds,
        }
    }
}

/// Minimum spacing between consecutive block responses.
#[derive(Debug)]
pub struct BlockPacer {
    floor: Duration,
    last: Option<Instant>,
}

impl BlockPacer {
    pub fn new(floor: Duration) -> Self {
        Self { floor, last: None }
    }

    /// Earliest instant the next block response may start.
    pub fn next_slot(&self, now: Instant) -> Instant {
        match self.last {
            Some(last) => (last + self.floor).max(now),
            None => now,
        }
    }

    /// Stamp the start of a block response transmission.
    pub fn mark(&mut self, at: Instant) {
        self.last = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_no_report_before_first_interval() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new(1000, Duration::from_secs(30), start);

        assert!(tracker.record(64, start).is_none());
        assert!(tracker.record(500, start + Duration::from_secs(29)).is_none());

        let progress = tracker.record(500, start + Duration::from_secs(30)).unwrap();
        assert_eq!(progress.percentage, 50.0);
        assert_eq!(progress.remaining_seconds, Some(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_rate_limited() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new(3000, Duration::from_secs(30), start);

        assert!(tracker.record(100, start + Duration::from_secs(31)).is_some());
        assert!(tracker.record(200, start + Duration::from_secs(45)).is_none());
        assert!(tracker.record(300, start + Duration::from_secs(61)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_percentage_two_decimals() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new(3, Duration::from_secs(30), start);
        let progress = tracker.record(1, start + Duration::from_secs(30)).unwrap();
        assert_eq!(progress.percentage, 33.33);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_unknown_without_bytes() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new(1000, Duration::from_secs(30), start);
        let progress = tracker.record(0, start + Duration::from_secs(30)).unwrap();
        assert_eq!(progress.percentage, 0.0);
        assert_eq!(progress.remaining_seconds, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer() {
        let start = Instant::now();
        let mut pacer = BlockPacer::new(Duration::from_millis(250));
        assert_eq!(pacer.next_slot(start), start);

        pacer.mark(start);
        assert_eq!(
            pacer.next_slot(start + Duration::from_millis(100)),
            start + Duration::from_millis(250)
        );
        let late = start + Duration::from_secs(1);
        assert_eq!(pacer.next_slot(late), late);
    }
}
