//! Stream availability tracking
//!
//! A stream is available while its capture endpoint has shown activity
//! within the keepalive window.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

pub struct Keepalive {
    window: Duration,
    started: Instant,
    last_seen: Mutex<Option<Instant>>,
}

impl Keepalive {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            started: Instant::now(),
            last_seen: Mutex::new(None),
        }
    }

    /// Restart the countdown
    pub fn touch(&self) {
        *self.last_seen.lock() = Some(Instant::now());
    }

    pub fn is_available(&self) -> bool {
        self.last_seen
            .lock()
            .is_some_and(|seen| seen.elapsed() < self.window)
    }

    /// Time since the stream started, or zero when unavailable
    pub fn uptime(&self) -> Duration {
        if self.is_available() {
            self.started.elapsed()
        } else {
            Duration::ZERO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_until_touched() {
        let keepalive = Keepalive::new(Duration::from_secs(15));
        assert!(!keepalive.is_available());
        assert_eq!(keepalive.uptime(), Duration::ZERO);
        keepalive.touch();
        assert!(keepalive.is_available());
    }

    #[test]
    fn test_expires_after_window() {
        let keepalive = Keepalive::new(Duration::from_millis(20));
        keepalive.touch();
        std::thread::sleep(Duration::from_millis(40));
        assert!(!keepalive.is_available());
        keepalive.touch();
        assert!(keepalive.is_available());
    }
}
