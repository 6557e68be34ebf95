//! Rejects events that predate the moment this process started watching a
//! channel, so a reconnect never replays days of history as fresh turns.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::util::now_ms;

/// Per-channel processing baseline with a realtime tolerance window.
///
/// The baseline is set once, at first-seen-event time, to either a supplied
/// origin timestamp or wall-clock now. Anything older than
/// `tolerance_secs` before the baseline is backlog.
pub struct BacklogFilter {
    baselines: Mutex<HashMap<String, i64>>,
    tolerance_ms: i64,
}

impl BacklogFilter {
    pub fn new(tolerance_secs: u64) -> Self {
        Self {
            baselines: Mutex::new(HashMap::new()),
            tolerance_ms: tolerance_secs as i64 * 1000,
        }
    }

    /// Pin a channel's baseline explicitly (e.g. from a session record's
    /// connect time). No-op if one is already set.
    pub fn set_baseline(&self, channel_id: &str, origin_ms: i64) {
        self.baselines
            .lock()
            .entry(channel_id.to_string())
            .or_insert(origin_ms);
    }

    /// Whether an event timestamped `event_ts_secs` predates the channel's
    /// baseline by more than the tolerance. First call for a channel
    /// establishes the baseline at wall-clock now.
    pub fn is_backlog(&self, channel_id: &str, event_ts_secs: i64) -> bool {
        self.is_backlog_at(channel_id, event_ts_secs, now_ms())
    }

    pub(crate) fn is_backlog_at(&self, channel_id: &str, event_ts_secs: i64, now: i64) -> bool {
        let baseline = *self
            .baselines
            .lock()
            .entry(channel_id.to_string())
            .or_insert(now);
        event_ts_secs * 1000 < baseline - self.tolerance_ms
    }

    /// Wall-clock staleness, independent of the baseline: long-lived
    /// baselines still must not answer events older than the tolerance.
    pub fn is_stale(&self, event_ts_secs: i64) -> bool {
        self.is_stale_at(event_ts_secs, now_ms())
    }

    pub(crate) fn is_stale_at(&self, event_ts_secs: i64, now: i64) -> bool {
        event_ts_secs * 1000 < now - self.tolerance_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn first_event_sets_baseline_to_now() {
        let filter = BacklogFilter::new(120);
        // Event 300s older than the freshly-set baseline.
        assert!(filter.is_backlog_at("ch1", NOW / 1000 - 300, NOW));
        // Event 60s old: inside the tolerance.
        assert!(!filter.is_backlog_at("ch1", NOW / 1000 - 60, NOW));
    }

    #[test]
    fn baseline_is_sticky() {
        let filter = BacklogFilter::new(120);
        filter.set_baseline("ch1", NOW);
        // Later calls do not move the baseline forward.
        let much_later = NOW + 3_600_000;
        assert!(!filter.is_backlog_at("ch1", NOW / 1000 - 60, much_later));
    }

    #[test]
    fn explicit_baseline_wins_over_first_event() {
        let filter = BacklogFilter::new(120);
        filter.set_baseline("ch1", NOW - 600_000);
        // 500s before now but only 100s older than the supplied origin.
        assert!(!filter.is_backlog_at("ch1", NOW / 1000 - 500, NOW));
        // set_baseline again is a no-op.
        filter.set_baseline("ch1", NOW);
        assert!(!filter.is_backlog_at("ch1", NOW / 1000 - 500, NOW));
    }

    #[test]
    fn channels_are_independent() {
        let filter = BacklogFilter::new(120);
        filter.set_baseline("ch1", NOW - 10_000_000);
        assert!(!filter.is_backlog_at("ch1", NOW / 1000 - 9_000, NOW));
        assert!(filter.is_backlog_at("ch2", NOW / 1000 - 9_000, NOW));
    }

    #[test]
    fn wall_clock_staleness() {
        let filter = BacklogFilter::new(120);
        assert!(filter.is_stale_at(NOW / 1000 - 121, NOW));
        assert!(!filter.is_stale_at(NOW / 1000 - 119, NOW));
    }
}
