use std::ops::Add;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use crate::time::system_time_to_micros;

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;

    fn now_micros(&self) -> i64 {
        system_time_to_micros(self.now())
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// MockClock only moves when told to.
#[derive(Debug)]
pub struct MockClock {
    now: RwLock<SystemTime>,
}

impl Clock for MockClock {
    fn now(&self) -> SystemTime {
        *self.now.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl MockClock {
    pub fn with_time(time: SystemTime) -> Self {
        Self {
            now: RwLock::new(time),
        }
    }

    pub fn new() -> Self {
        Self::with_time(SystemTime::now())
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.write().unwrap_or_else(|e| e.into_inner());
        *now = now.add(duration);
    }

    pub fn set_time(&self, time: SystemTime) {
        *self.now.write().unwrap_or_else(|e| e.into_inner()) = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use crate::clock::{Clock, MockClock};

    #[test]
    fn test_mock_clock_advance() {
        let clock = MockClock::with_time(UNIX_EPOCH + Duration::from_secs(10));
        assert_eq!(clock.now_micros(), 10_000_000);

        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now_micros(), 11_500_000);
    }
}
