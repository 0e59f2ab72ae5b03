//! Daily fire-time arithmetic and the cancellable wait used by the
//! background loop.

use chrono::{Duration as ChronoDuration, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

use crate::types::{EngineError, EngineResult};

/// Upper bound on how long the loop sleeps before re-checking for a stop.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Local wall-clock time of the daily decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTime {
    pub hour: u32,
    pub minute: u32,
}

impl Default for ScheduleTime {
    /// 16:05, just after the US cash close.
    fn default() -> Self {
        Self { hour: 16, minute: 5 }
    }
}

impl ScheduleTime {
    pub fn new(hour: u32, minute: u32) -> EngineResult<Self> {
        if hour > 23 || minute > 59 {
            return Err(EngineError::Configuration(format!(
                "Invalid schedule time {hour:02}:{minute:02}; hour must be 0-23 and minute 0-59"
            )));
        }
        Ok(Self { hour, minute })
    }
}

impl fmt::Display for ScheduleTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Source of local wall-clock time for the scheduler.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> NaiveDateTime;
}

/// The machine's local time.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Settable clock for driving the scheduler in tests.
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct ManualClock {
    now: std::sync::Mutex<NaiveDateTime>,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new(now: NaiveDateTime) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    pub(crate) fn set(&self, now: NaiveDateTime) {
        *self.now.lock().unwrap() = now;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap()
    }
}

/// Next fire instant after `now`: today at `at`, or tomorrow when that has
/// already passed (an instant equal to `now` counts as passed).
pub fn next_fire(now: NaiveDateTime, at: ScheduleTime) -> NaiveDateTime {
    let today = now
        .date()
        .and_hms_opt(at.hour, at.minute, 0)
        .unwrap_or_else(|| now.date().and_time(chrono::NaiveTime::MIN));
    if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}

/// Sleep until `clock` reaches `target`, in slices of at most
/// `POLL_INTERVAL`. Returns `false` as soon as `cancel` reads `true` or its
/// sender is gone, `true` once the target is reached.
pub async fn wait_until(
    target: NaiveDateTime,
    clock: &dyn Clock,
    cancel: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        if *cancel.borrow() {
            return false;
        }
        let now = clock.now();
        if now >= target {
            return true;
        }
        let remaining = (target - now).to_std().unwrap_or(Duration::ZERO);
        let step = remaining.min(POLL_INTERVAL);

        tokio::select! {
            _ = tokio::time::sleep(step) => {}
            changed = cancel.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::time::Instant;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_fires_later_today() {
        let next = next_fire(at(9, 30, 0), ScheduleTime::default());
        assert_eq!(next, at(16, 5, 0));
    }

    #[test]
    fn test_rolls_to_tomorrow_when_passed() {
        let next = next_fire(at(16, 5, 1), ScheduleTime::default());
        assert_eq!(next, at(16, 5, 0) + ChronoDuration::days(1));
    }

    #[test]
    fn test_exact_instant_rolls_forward() {
        let next = next_fire(at(16, 5, 0), ScheduleTime::default());
        assert_eq!(next.date(), NaiveDate::from_ymd_opt(2024, 3, 16).unwrap());
    }

    #[test]
    fn test_month_end_rollover() {
        let now = NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_opt(23, 0, 0)
            .unwrap();
        let next = next_fire(now, ScheduleTime::new(6, 0).unwrap());
        assert_eq!(next, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(6, 0, 0).unwrap());
    }

    #[test]
    fn test_schedule_validation() {
        assert!(ScheduleTime::new(23, 59).is_ok());
        assert!(matches!(ScheduleTime::new(24, 0), Err(EngineError::Configuration(_))));
        assert!(ScheduleTime::new(12, 60).is_err());
        assert_eq!(ScheduleTime::new(7, 3).unwrap().to_string(), "07:03");
    }

    #[tokio::test]
    async fn test_wait_reaches_target() {
        let (_tx, mut rx) = watch::channel(false);
        let target = Local::now().naive_local() + ChronoDuration::milliseconds(300);
        assert!(wait_until(target, &LocalClock, &mut rx).await);
        assert!(Local::now().naive_local() >= target);
    }

    #[tokio::test]
    async fn test_wait_observes_cancel_promptly() {
        let (tx, mut rx) = watch::channel(false);
        let target = Local::now().naive_local() + ChronoDuration::hours(6);
        let started = Instant::now();

        let waiter = tokio::spawn(async move { wait_until(target, &LocalClock, &mut rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let reached = waiter.await.unwrap();
        assert!(!reached);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_wait_stops_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let target = Local::now().naive_local() + ChronoDuration::hours(6);
        assert!(!wait_until(target, &LocalClock, &mut rx).await);
    }

    #[tokio::test]
    async fn test_wait_follows_injected_clock() {
        let (_tx, mut rx) = watch::channel(false);
        let clock = std::sync::Arc::new(ManualClock::new(at(16, 0, 0)));
        let target = at(16, 5, 0);

        let waiter = {
            let clock = clock.clone();
            tokio::spawn(async move { wait_until(target, clock.as_ref(), &mut rx).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        clock.set(target);
        let started = Instant::now();
        assert!(waiter.await.unwrap());
        assert!(started.elapsed() <= POLL_INTERVAL + Duration::from_millis(500));
    }
}
