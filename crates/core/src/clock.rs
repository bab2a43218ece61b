use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Source of "now" for everything that compares against persisted timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> { Utc::now() }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self { Self { now: Mutex::new(at) } }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: std::time::Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += chrono::Duration::milliseconds(by.as_millis() as i64);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> { *self.now.lock().unwrap_or_else(|e| e.into_inner()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(std::time::Duration::from_secs(90));
        assert_eq!((clock.now() - start).num_seconds(), 90);
    }
}
