//! Exponential backoff with jitter for retry loops.

use std::time::Duration;

use rand::Rng;

/// Doubling backoff between a base and a cap, with proportional jitter
/// so a fleet of instances retrying against the same catalog does not
/// synchronize.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.2,
            current: base,
        }
    }

    /// The standard retry curve for catalog transport errors.
    pub fn for_catalog() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(30))
    }

    /// Next delay to sleep; doubles the internal state up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.jittered(self.current);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Back to the base delay after a success.
    pub fn reset(&mut self) {
        self.current = self.base;
    }

    fn jittered(&self, d: Duration) -> Duration {
        let spread = d.as_secs_f64() * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread.max(f64::MIN_POSITIVE));
        Duration::from_secs_f64((d.as_secs_f64() + offset).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_to_the_cap() {
        let mut b = Backoff::new(Duration::from_millis(50), Duration::from_millis(300));
        let mut raw = Vec::new();
        for _ in 0..5 {
            b.next_delay();
            raw.push(b.current);
        }
        assert_eq!(
            raw,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
                Duration::from_millis(300),
                Duration::from_millis(300),
            ]
        );
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..100 {
            let d = b.next_delay();
            b.reset();
            assert!(d >= Duration::from_millis(790), "{d:?}");
            assert!(d <= Duration::from_millis(1210), "{d:?}");
        }
    }

    #[test]
    fn reset_returns_to_base() {
        let mut b = Backoff::for_catalog();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert!(b.next_delay() <= Duration::from_millis(61));
    }
}
