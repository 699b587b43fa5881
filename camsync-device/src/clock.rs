use chrono::{DateTime, Utc};

/// The shared wall clock the alignment boundary is measured against.
///
/// Devices are expected to be time-synchronized externally (NTP or similar);
/// nothing here corrects skew between devices.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// System time shifted by a fixed offset.
#[derive(Debug, Clone, Copy)]
pub struct OffsetClock {
    offset: chrono::Duration,
}

impl OffsetClock {
    pub fn new(offset: chrono::Duration) -> Self {
        Self { offset }
    }

    /// A clock that reads `at` right now and advances in real time from there.
    pub fn reading(at: DateTime<Utc>) -> Self {
        Self::new(at - Utc::now())
    }
}

impl Clock for OffsetClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.offset
    }
}

/// Wall clock driven by tokio's clock.
///
/// Reads `origin` when created and advances with `tokio::time::Instant`, so
/// under a paused runtime (`start_paused = true`) it moves only as virtual
/// time does.
#[derive(Debug, Clone, Copy)]
pub struct VirtualClock {
    origin: DateTime<Utc>,
    start: tokio::time::Instant,
}

impl VirtualClock {
    pub fn starting_at(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            start: tokio::time::Instant::now(),
        }
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.start.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.origin + elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn virtual_clock_follows_paused_time() {
        let origin = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 59).unwrap();
        let clock = VirtualClock::starting_at(origin);
        assert_eq!(clock.now(), origin);

        tokio::time::sleep(Duration::from_millis(1_050)).await;
        assert_eq!(
            clock.now(),
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 1, 0).unwrap() + chrono::Duration::milliseconds(50)
        );
    }

    #[test]
    fn offset_clock_reads_requested_instant() {
        let at = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let clock = OffsetClock::reading(at);
        let drift = (clock.now() - at).num_milliseconds();
        assert!((0..1_000).contains(&drift), "drift {drift}ms");
    }
}
