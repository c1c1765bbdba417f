use rand::Rng;
use std::time::Duration;

/// Randomized exponential backoff for printer reconnect attempts.
///
/// The n-th delay is drawn from `[window / 2, window]` where
/// `window = base * 2^min(n, cap)`.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    cap: u32,
    attempts: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, cap: u32) -> Self {
        Self {
            base,
            cap,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Upper bound of the next delay.
    pub fn window(&self) -> Duration {
        let exp = self.attempts.min(self.cap).min(31);
        self.base.saturating_mul(1u32 << exp)
    }

    /// Delay before the next attempt; counts the attempt.
    pub fn next_delay(&mut self) -> Duration {
        let window_ms = self.window().as_millis().min(u64::MAX as u128) as u64;
        self.attempts = self.attempts.saturating_add(1);
        if window_ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(window_ms / 2..=window_ms))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_doubles_until_cap() {
        let mut backoff = ReconnectBackoff::new(Duration::from_millis(100), 3);
        let windows: Vec<_> = (0..6)
            .map(|_| {
                let w = backoff.window();
                backoff.next_delay();
                w.as_millis()
            })
            .collect();
        assert_eq!(windows, vec![100, 200, 400, 800, 800, 800]);
    }

    #[test]
    fn test_delay_within_window() {
        let mut backoff = ReconnectBackoff::new(Duration::from_millis(100), 4);
        for _ in 0..20 {
            let window = backoff.window();
            let delay = backoff.next_delay();
            assert!(delay <= window);
            assert!(delay >= window / 2);
        }
    }

    #[test]
    fn test_reset() {
        let mut backoff = ReconnectBackoff::default();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempts(), 2);
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.window(), Duration::from_secs(1));
    }
}
