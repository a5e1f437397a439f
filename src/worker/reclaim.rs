use std::time::{Duration, Instant};

/// Debounces memory reclamation.
///
/// A pass becomes due once something asked for one and `interval` has
/// elapsed since the previous pass. `force` makes it due immediately.
#[derive(Debug, Clone)]
pub struct ReclaimTimer {
    interval: Duration,
    last_pass: Option<Instant>,
    needed: bool,
}

impl ReclaimTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_pass: None,
            needed: false,
        }
    }

    /// Starts the debounce window at `now`, as if a pass just ran
    pub fn started_at(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_pass: Some(now),
            needed: false,
        }
    }

    pub fn mark_needed(&mut self) {
        self.needed = true;
    }

    /// Needed and due regardless of the last pass
    pub fn force(&mut self) {
        self.needed = true;
        self.last_pass = None;
    }

    pub fn is_needed(&self) -> bool {
        self.needed
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.needed && self.time_until_due(now) == Some(Duration::ZERO)
    }

    /// `None` when no pass is needed
    pub fn time_until_due(&self, now: Instant) -> Option<Duration> {
        if !self.needed {
            return None;
        }
        Some(match self.last_pass {
            Some(last) => self
                .interval
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        })
    }

    /// How long the worker may block waiting for work
    pub fn next_wait(&self, now: Instant, max_idle: Duration) -> Duration {
        self.time_until_due(now)
            .map_or(max_idle, |remaining| remaining.min(max_idle))
    }

    pub fn record_pass(&mut self, now: Instant) {
        self.last_pass = Some(now);
        self.needed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEN: Duration = Duration::from_secs(10);
    const IDLE: Duration = Duration::from_secs(1000);

    #[test]
    fn test_not_needed_waits_max_idle() {
        let now = Instant::now();
        let timer = ReclaimTimer::started_at(TEN, now);
        assert!(!timer.is_due(now + TEN * 2));
        assert_eq!(timer.next_wait(now, IDLE), IDLE);
    }

    #[test]
    fn test_debounce_arithmetic() {
        let now = Instant::now();
        let mut timer = ReclaimTimer::started_at(TEN, now);
        timer.mark_needed();

        let later = now + Duration::from_secs(3);
        assert!(!timer.is_due(later));
        assert_eq!(timer.next_wait(later, IDLE), Duration::from_secs(7));
        assert_eq!(
            timer.next_wait(later, Duration::from_secs(2)),
            Duration::from_secs(2)
        );

        let due = now + TEN;
        assert!(timer.is_due(due));
        assert_eq!(timer.next_wait(due, IDLE), Duration::ZERO);

        timer.record_pass(due);
        assert!(!timer.is_needed());
        assert_eq!(timer.next_wait(due, IDLE), IDLE);
    }

    #[test]
    fn test_force_is_due_immediately() {
        let now = Instant::now();
        let mut timer = ReclaimTimer::started_at(TEN, now);
        timer.force();
        assert!(timer.is_due(now));
        assert_eq!(timer.next_wait(now, IDLE), Duration::ZERO);
    }
}
