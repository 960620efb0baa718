use std::time::Duration;

use tokio::time::Instant;

/// Coalesces bursts of change notifications.
///
/// Each new batch pushes the flush back by the quiet period, but never past
/// the maximum postponement measured from the first unflushed batch.
#[derive(Debug)]
pub(crate) struct Debouncer {
    quiet: Duration,
    max_wait: Duration,
    first: Option<Instant>,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(quiet: Duration, max_wait: Duration) -> Self {
        Self {
            quiet,
            max_wait,
            first: None,
            deadline: None,
        }
    }

    pub fn poke(&mut self, now: Instant) {
        let first = *self.first.get_or_insert(now);
        let limit = first + self.max_wait;
        self.deadline = Some((now + self.quiet).min(limit).max(now));
    }

    /// Try again after `wait`, keeping the postponement window.
    pub fn retry(&mut self, now: Instant, wait: Duration) {
        self.deadline = Some(now + wait);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    pub fn reset(&mut self) {
        self.first = None;
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUIET: Duration = Duration::from_millis(500);
    const MAX: Duration = Duration::from_millis(5000);

    #[test]
    fn test_each_batch_postpones() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(QUIET, MAX);

        debouncer.poke(start);
        assert_eq!(debouncer.deadline(), Some(start + QUIET));

        let later = start + Duration::from_millis(300);
        debouncer.poke(later);
        assert_eq!(debouncer.deadline(), Some(later + QUIET));
        assert!(!debouncer.is_due(later + Duration::from_millis(499)));
        assert!(debouncer.is_due(later + QUIET));
    }

    #[test]
    fn test_postponement_is_bounded() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(QUIET, MAX);
        debouncer.poke(start);

        let near_limit = start + Duration::from_millis(4800);
        debouncer.poke(near_limit);
        assert_eq!(debouncer.deadline(), Some(start + MAX));

        let past_limit = start + Duration::from_millis(6000);
        debouncer.poke(past_limit);
        assert_eq!(debouncer.deadline(), Some(past_limit));
    }

    #[test]
    fn test_reset_starts_a_new_window() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(QUIET, MAX);
        debouncer.poke(start);
        debouncer.reset();
        assert_eq!(debouncer.deadline(), None);

        let later = start + Duration::from_secs(10);
        debouncer.poke(later);
        assert_eq!(debouncer.deadline(), Some(later + QUIET));
    }
}
