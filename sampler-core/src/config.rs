//! Scheduling configuration.

/// Tunable timing knobs for the scheduler. Defaults match the deployed
/// instrument and are safe for the host emulator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Seconds before a task's schedule at which the controller stays awake
    /// and arms a delayed start instead of sleeping.
    pub wake_window_secs: i64,
    /// Seconds before a task's schedule at which the wakeup alarm fires, so
    /// the instrument is booted inside the wake window.
    pub pre_alarm_margin_secs: i64,
    /// Minimum lead time a new schedule must have, in seconds.
    pub min_lead_secs: i64,
    /// Interval between detail log records while a procedure runs.
    pub detail_log_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wake_window_secs: 10,
            pre_alarm_margin_secs: 8,
            min_lead_secs: 3,
            detail_log_interval_ms: 5000,
        }
    }
}
