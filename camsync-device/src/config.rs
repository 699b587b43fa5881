use std::path::PathBuf;
use std::time::Duration;

use crate::scheduler::{SchedulerSettings, DEFAULT_MAX_ARM_WAIT, DEFAULT_POLL_INTERVAL, DEFAULT_TOLERANCE};
use crate::session::{
    default_output_dir, SessionSettings, DEFAULT_EXTENSION, DEFAULT_FINALIZE_TIMEOUT,
    DEFAULT_MAX_DURATION,
};

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:9090/ws";

/// Everything a device needs to take part in a synchronized recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub relay_url: String,
    pub output_dir: PathBuf,
    pub extension: String,
    pub max_duration: Duration,
    pub finalize_timeout: Duration,
    pub tolerance: Duration,
    pub poll_interval: Duration,
    pub max_arm_wait: Duration,
    /// Master sends the bare `SEND_TO_SLAVES` command instead of a
    /// structured trigger.
    pub legacy_trigger: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            output_dir: default_output_dir(),
            extension: DEFAULT_EXTENSION.to_string(),
            max_duration: DEFAULT_MAX_DURATION,
            finalize_timeout: DEFAULT_FINALIZE_TIMEOUT,
            tolerance: DEFAULT_TOLERANCE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_arm_wait: DEFAULT_MAX_ARM_WAIT,
            legacy_trigger: false,
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

impl DeviceConfig {
    /// Defaults overridden by `CAMSYNC_*` environment variables. Values that
    /// do not parse are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("CAMSYNC_RELAY_URL") {
            config.relay_url = url;
        }
        if let Some(dir) = std::env::var_os("CAMSYNC_OUTPUT_DIR").filter(|d| !d.is_empty()) {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(d) = env_millis("CAMSYNC_MAX_DURATION_MS") {
            config.max_duration = d;
        }
        if let Some(d) = env_millis("CAMSYNC_TOLERANCE_MS") {
            config.tolerance = d;
        }
        if let Some(d) = env_millis("CAMSYNC_POLL_INTERVAL_MS") {
            config.poll_interval = d;
        }
        if let Some(d) = env_millis("CAMSYNC_MAX_ARM_WAIT_MS") {
            config.max_arm_wait = d;
        }
        if let Some(legacy) = env_flag("CAMSYNC_LEGACY_TRIGGER") {
            config.legacy_trigger = legacy;
        }
        config
    }

    /// Scheduler timing, with combinations that could never release
    /// replaced (see [`SchedulerSettings::validated`]).
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            poll_interval: self.poll_interval,
            tolerance: self.tolerance,
            max_arm_wait: self.max_arm_wait,
        }
        .validated()
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            output_dir: self.output_dir.clone(),
            extension: self.extension.clone(),
            max_duration: self.max_duration,
            finalize_timeout: self.finalize_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::scheduler::{ArmOutcome, SyncScheduler};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn defaults_match_recording_contract() {
        let config = DeviceConfig::default();
        assert_eq!(config.max_duration, Duration::from_millis(120_000));
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.tolerance, Duration::from_millis(100));
        assert_eq!(config.extension, "mp4");
        assert!(config.output_dir.ends_with("camsync"));
        assert_eq!(config.scheduler_settings(), SchedulerSettings::default());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_poll_interval_still_releases_at_the_boundary() {
        let config = DeviceConfig {
            poll_interval: Duration::from_millis(150),
            max_arm_wait: Duration::from_secs(20),
            ..DeviceConfig::default()
        };
        let settings = config.scheduler_settings();
        assert!(settings.poll_interval < settings.tolerance);
        assert_eq!(settings.max_arm_wait, DEFAULT_MAX_ARM_WAIT);

        let origin = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 59).unwrap()
            + chrono::Duration::milliseconds(960);
        let scheduler = SyncScheduler::new(Arc::new(VirtualClock::starting_at(origin)), settings);
        match scheduler.wait_for_release(&CancellationToken::new()).await {
            ArmOutcome::Released { at, missed } => {
                assert_eq!(missed, 0);
                assert!(scheduler.window().contains(at), "released at {at}");
            }
            other => panic!("expected a release, got {other:?}"),
        }
    }

    // the only test in the crate that touches these variables
    #[test]
    fn env_overrides_defaults() {
        std::env::set_var("CAMSYNC_RELAY_URL", "ws://relay.example:9000/ws");
        std::env::set_var("CAMSYNC_MAX_DURATION_MS", "5000");
        std::env::set_var("CAMSYNC_TOLERANCE_MS", "not a number");
        std::env::set_var("CAMSYNC_LEGACY_TRIGGER", "true");

        let config = DeviceConfig::from_env();
        assert_eq!(config.relay_url, "ws://relay.example:9000/ws");
        assert_eq!(config.max_duration, Duration::from_secs(5));
        assert_eq!(config.tolerance, DEFAULT_TOLERANCE);
        assert!(config.legacy_trigger);
        assert_eq!(config.session_settings().max_duration, Duration::from_secs(5));

        for var in [
            "CAMSYNC_RELAY_URL",
            "CAMSYNC_MAX_DURATION_MS",
            "CAMSYNC_TOLERANCE_MS",
            "CAMSYNC_LEGACY_TRIGGER",
        ] {
            std::env::remove_var(var);
        }
    }
}
