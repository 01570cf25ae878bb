use std::fmt::Debug;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn at_unix(secs: u64) -> Self {
        Self::new(UNIX_EPOCH + Duration::from_secs(secs))
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, at: SystemTime) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Latest instant handed out by this module, 2106-02-07. Representable on
/// every platform `SystemTime` supports.
pub fn far_future() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(u64::from(u32::MAX))
}

/// `at + by`, saturating at [`far_future`].
pub fn saturating_add(at: SystemTime, by: Duration) -> SystemTime {
    match at.checked_add(by) {
        Some(later) if later <= far_future() => later,
        _ => far_future().max(at),
    }
}

/// Converts a unix-seconds float (as carried by pushed documents) into a
/// `SystemTime`. Zero, negative and NaN map to the epoch; anything past
/// [`far_future`] saturates there.
pub fn from_unix_f64(secs: f64) -> SystemTime {
    if secs.is_nan() || secs <= 0.0 {
        return UNIX_EPOCH;
    }
    match Duration::try_from_secs_f64(secs) {
        Ok(since_epoch) => saturating_add(UNIX_EPOCH, since_epoch),
        Err(_) => far_future(),
    }
}

pub fn to_unix_f64(at: SystemTime) -> f64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_floats_clamp_instead_of_overflowing() {
        assert_eq!(from_unix_f64(0.0), UNIX_EPOCH);
        assert_eq!(from_unix_f64(-5.0), UNIX_EPOCH);
        assert_eq!(from_unix_f64(f64::NAN), UNIX_EPOCH);
        assert_eq!(
            from_unix_f64(1_700_000_000.5),
            UNIX_EPOCH + Duration::from_millis(1_700_000_000_500)
        );
        assert_eq!(from_unix_f64(1e19), far_future());
        assert_eq!(from_unix_f64(1e300), far_future());
        assert_eq!(from_unix_f64(f64::INFINITY), far_future());
    }

    #[test]
    fn saturating_add_caps_huge_durations() {
        let start = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(
            saturating_add(start, Duration::from_secs(60)),
            start + Duration::from_secs(60)
        );
        assert_eq!(saturating_add(start, Duration::from_secs(u64::MAX)), far_future());
        assert_eq!(saturating_add(start, Duration::MAX), far_future());
    }
}
