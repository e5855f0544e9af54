//! Poll schedule used to observe an instance after it was started.

use std::time::Duration;

use crate::WatchRange;

/// Default number of intervals a watch range is split into.
pub const DEFAULT_WATCH_INTERVALS: u32 = 10;

/// Upper bound on the number of intervals. Larger requests are clamped, which
/// keeps a schedule at most this many waits long whatever the range.
pub const MAX_WATCH_INTERVALS: u32 = 1000;

/// Smallest step between two polls.
const MIN_STEP_MS: u64 = 1000;

/// Splits `[min, max]` into a sequence of waits.
///
/// The first wait is `min`; it is followed by `floor((max - min) / step)`
/// waits of `step = max(1000, (max - min) / (intervals - 1))` milliseconds.
/// Observation is front-loaded and polling never gets finer than one second.
///
/// The schedule is a ceiling: a caller stops early once it sees the state it
/// is waiting for. The `get_state` round trips come on top of these waits.
pub fn watch_schedule(range: WatchRange, intervals: u32) -> Vec<Duration> {
    let delta = range.max_ms() - range.min_ms();
    let intervals = intervals.min(MAX_WATCH_INTERVALS);
    let divisions = u64::from(intervals.saturating_sub(1).max(1));
    let step = (delta / divisions).max(MIN_STEP_MS);
    let repeats = delta / step;

    let mut schedule = Vec::with_capacity(repeats as usize + 1);
    schedule.push(range.min());
    schedule.extend((0..repeats).map(|_| Duration::from_millis(step)));
    schedule
}
