//! Sub-millisecond sleeping for loop cadences and source pacing.

use std::time::{Duration, Instant};

/// How much of the requested duration is left to a busy-wait. OS sleeps
/// routinely overshoot by a scheduler quantum, the final stretch is spun on
/// the monotonic clock instead.
const SPIN_MARGIN: Duration = Duration::from_millis(1);

/// Sleep for `duration` with sub-millisecond accuracy.
///
/// The bulk of the wait is delegated to [`std::thread::sleep`], keeping the
/// last [`SPIN_MARGIN`] as a spin on [`Instant`]. A zero duration returns
/// immediately.
pub fn precise_sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    let deadline = Instant::now() + duration;
    if let Some(coarse) = duration.checked_sub(SPIN_MARGIN) {
        if !coarse.is_zero() {
            std::thread::sleep(coarse);
        }
    }
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}
