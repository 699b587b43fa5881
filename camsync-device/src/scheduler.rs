//! Wall-clock alignment barrier.
//!
//! An armed device does not start recording when the trigger arrives. It
//! polls the shared clock until the clock enters the alignment window at the
//! top of a minute and releases there, so relay transit time drops out of
//! the start-time skew between devices.

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_TOLERANCE: Duration = Duration::from_millis(100);
/// Two full boundaries plus slack.
pub const DEFAULT_MAX_ARM_WAIT: Duration = Duration::from_secs(125);
pub const MIN_TOLERANCE: Duration = Duration::from_millis(1);
const MINUTE: Duration = Duration::from_secs(60);

/// `[hh:mm:00.000, hh:mm:00.000 + tolerance)` for every minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentWindow {
    tolerance: Duration,
}

impl AlignmentWindow {
    pub fn new(tolerance: Duration) -> Self {
        Self { tolerance }
    }

    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t.second() == 0 && u128::from(t.nanosecond()) < self.tolerance.as_nanos()
    }

    /// Start of the minute containing `t`.
    pub fn boundary_of(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        t - ChronoDuration::seconds(i64::from(t.second()))
            - ChronoDuration::nanoseconds(i64::from(t.nanosecond()))
    }

    /// First boundary strictly after `t`.
    pub fn next_boundary(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        self.boundary_of(t) + ChronoDuration::minutes(1)
    }

    /// Whole seconds until the next boundary, rounded up; 0 inside the window.
    pub fn seconds_remaining(&self, t: DateTime<Utc>) -> u32 {
        if self.contains(t) {
            return 0;
        }
        let millis = (self.next_boundary(t) - t).num_milliseconds().max(0);
        ((millis + 999) / 1000) as u32
    }
}

impl Default for AlignmentWindow {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE)
    }
}

/// The boundary an armed device is currently waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedTrigger {
    pub armed_at: DateTime<Utc>,
    pub target: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmOutcome {
    /// Released inside the window. `missed` counts boundaries that went by
    /// without a tick landing in their window.
    Released { at: DateTime<Utc>, missed: u32 },
    Cancelled,
    /// Gave up after waiting `waited` without reaching a window.
    Expired { waited: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub tolerance: Duration,
    pub max_arm_wait: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            tolerance: DEFAULT_TOLERANCE,
            max_arm_wait: DEFAULT_MAX_ARM_WAIT,
        }
    }
}

impl SchedulerSettings {
    /// Replaces values under which an armed wait could never release.
    ///
    /// The poll interval must stay below the tolerance, otherwise ticks can
    /// step over every window. `max_arm_wait` must cover a full minute plus
    /// the tolerance so at least one window opens before expiry.
    pub fn validated(self) -> Self {
        let mut settings = self;
        if settings.tolerance < MIN_TOLERANCE || settings.tolerance >= MINUTE {
            warn!(
                "alignment tolerance {:?} out of range, using {:?}",
                settings.tolerance, DEFAULT_TOLERANCE
            );
            settings.tolerance = DEFAULT_TOLERANCE;
        }
        if settings.poll_interval.is_zero() || settings.poll_interval >= settings.tolerance {
            let poll = if DEFAULT_POLL_INTERVAL < settings.tolerance {
                DEFAULT_POLL_INTERVAL
            } else {
                settings.tolerance / 2
            };
            warn!(
                "poll interval {:?} would skip the {:?} alignment window, using {:?}",
                settings.poll_interval, settings.tolerance, poll
            );
            settings.poll_interval = poll;
        }
        if settings.max_arm_wait < MINUTE + settings.tolerance {
            warn!(
                "max arm wait {:?} can expire before a boundary, using {:?}",
                settings.max_arm_wait, DEFAULT_MAX_ARM_WAIT
            );
            settings.max_arm_wait = DEFAULT_MAX_ARM_WAIT;
        }
        settings
    }
}

pub struct SyncScheduler {
    clock: Arc<dyn Clock>,
    window: AlignmentWindow,
    poll_interval: Duration,
    max_arm_wait: Duration,
    countdown: watch::Sender<Option<u32>>,
}

impl SyncScheduler {
    pub fn new(clock: Arc<dyn Clock>, settings: SchedulerSettings) -> Self {
        let (countdown, _) = watch::channel(None);
        Self {
            clock,
            window: AlignmentWindow::new(settings.tolerance),
            poll_interval: settings.poll_interval,
            max_arm_wait: settings.max_arm_wait,
            countdown,
        }
    }

    pub fn window(&self) -> AlignmentWindow {
        self.window
    }

    /// Seconds to the boundary while armed, `None` otherwise. For display
    /// only; release is decided from the clock on every tick.
    pub fn countdown(&self) -> watch::Receiver<Option<u32>> {
        self.countdown.subscribe()
    }

    pub fn arm(&self) -> ArmedTrigger {
        let armed_at = self.clock.now();
        let target = if self.window.contains(armed_at) {
            self.window.boundary_of(armed_at)
        } else {
            self.window.next_boundary(armed_at)
        };
        ArmedTrigger { armed_at, target }
    }

    /// Polls the clock until it is inside the alignment window.
    ///
    /// Returns `Released` at most once per call and stops polling right
    /// away. A tick that lands past the window moves the target to the next
    /// boundary instead of releasing late. Cancelling `cancel` ends the wait
    /// without a release.
    pub async fn wait_for_release(&self, cancel: &CancellationToken) -> ArmOutcome {
        let mut armed = self.arm();
        info!(
            "Armed at {}, waiting for {}",
            armed.armed_at.format("%H:%M:%S%.3f"),
            armed.target.format("%H:%M:%S")
        );

        let started = Instant::now();
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut missed = 0;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("alignment wait cancelled");
                    break ArmOutcome::Cancelled;
                }
                _ = ticker.tick() => {}
            }

            let now = self.clock.now();
            if self.window.contains(now) {
                info!("Released at {}", now.format("%H:%M:%S%.3f"));
                break ArmOutcome::Released { at: now, missed };
            }

            if now >= armed.target {
                missed += 1;
                armed.target = self.window.next_boundary(now);
                warn!(
                    "alignment window missed (tick at {}), waiting for {}",
                    now.format("%H:%M:%S%.3f"),
                    armed.target.format("%H:%M:%S")
                );
            }

            let waited = started.elapsed();
            if waited >= self.max_arm_wait {
                warn!("no alignment window reached after {:?}, disarming", waited);
                break ArmOutcome::Expired { waited };
            }

            let remaining = self.window.seconds_remaining(now);
            self.countdown.send_if_modified(|current| {
                let changed = *current != Some(remaining);
                *current = Some(remaining);
                changed
            });
        };

        self.countdown.send_replace(None);
        outcome
    }
}
