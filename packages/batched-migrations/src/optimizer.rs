//! Adaptive batch sizing.
//!
//! A batch that finishes well within its interval leaves database capacity
//! unused. When recent batches use less than [`TARGET_EFFICIENCY`] of the
//! interval, later batches grow towards [`TARGET_RATIO`] of it, by at most
//! [`MAX_MULTIPLIER`] per step and never beyond `max_batch_size`. Sizes
//! never shrink: a batch already handed out keeps its range.

use std::time::Duration;

/// Below this share of the interval, batches grow.
pub const TARGET_EFFICIENCY: f64 = 0.9;

/// Share of the interval a grown batch aims for.
pub const TARGET_RATIO: f64 = 0.95;

pub const MAX_MULTIPLIER: f64 = 1.2;

/// How many of the most recent timings are considered.
pub const TIMING_WINDOW: usize = 20;

/// Mean duration of the last [`TIMING_WINDOW`] batches divided by the
/// interval. `None` without timings.
pub fn efficiency(recent: &[Duration], interval: Duration) -> Option<f64> {
    if recent.is_empty() || interval.is_zero() {
        return None;
    }

    let window = &recent[recent.len().saturating_sub(TIMING_WINDOW)..];
    let mean = window.iter().map(Duration::as_secs_f64).sum::<f64>() / window.len() as f64;

    Some(mean / interval.as_secs_f64())
}

/// The batch size to use for the next batch.
pub fn next_batch_size(
    current: i64,
    max_batch_size: Option<i64>,
    recent: &[Duration],
    interval: Duration,
) -> i64 {
    let Some(max) = max_batch_size else {
        return current;
    };
    if current >= max {
        return current;
    }
    let Some(efficiency) = efficiency(recent, interval) else {
        return current;
    };
    if efficiency >= TARGET_EFFICIENCY {
        return current;
    }

    let multiplier = if efficiency <= 0.0 {
        MAX_MULTIPLIER
    } else {
        (TARGET_RATIO / efficiency).min(MAX_MULTIPLIER)
    };
    let grown = (current as f64 * multiplier).round() as i64;

    grown.clamp(current, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(120);

    #[test]
    fn fast_batches_grow_by_at_most_twenty_percent() {
        let recent = [Duration::from_secs(10); 5];
        assert_eq!(next_batch_size(1000, Some(10_000), &recent, INTERVAL), 1200);
    }

    #[test]
    fn growth_aims_at_the_target_ratio() {
        // 0.85 efficiency: 0.95 / 0.85 ~= 1.1176
        let recent = [Duration::from_secs(102)];
        assert_eq!(next_batch_size(1000, Some(10_000), &recent, INTERVAL), 1118);
    }

    #[test]
    fn growth_is_capped_at_max_batch_size() {
        let recent = [Duration::from_secs(1)];
        assert_eq!(next_batch_size(1000, Some(1100), &recent, INTERVAL), 1100);
    }

    #[test]
    fn slow_batches_never_shrink() {
        let recent = [Duration::from_secs(300)];
        assert_eq!(next_batch_size(1000, Some(5000), &recent, INTERVAL), 1000);
    }

    #[test]
    fn no_growth_without_max_or_timings() {
        let recent = [Duration::from_secs(1)];
        assert_eq!(next_batch_size(1000, None, &recent, INTERVAL), 1000);
        assert_eq!(next_batch_size(1000, Some(5000), &[], INTERVAL), 1000);
    }

    #[test]
    fn efficiency_uses_recent_window() {
        let mut recent = vec![Duration::from_secs(600); 5];
        recent.extend([Duration::from_secs(60); TIMING_WINDOW]);

        let e = efficiency(&recent, INTERVAL).unwrap();
        assert!((e - 0.5).abs() < 1e-9);
    }
}
