//! Process-wide monotonic timestamp generation.
//!
//! `MICROSECONDS` resolution is backed by a single counter shared by every
//! caller in the process, guarded by a dedicated mutex. This is
//! deliberately not per-instance state: the monotonicity guarantee in
//! [`create_timestamp`]'s contract holds across every caller in the
//! process, not just within one `Cluster`.

use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// The unit of the ordering token produced by [`create_timestamp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Whole seconds since the Unix epoch.
    Seconds,
    /// Whole milliseconds since the Unix epoch.
    Milliseconds,
    /// Strictly increasing microsecond-scale counter, seeded from wall clock.
    Microseconds,
}

fn wall_clock_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as i64
}

fn last_time() -> &'static Mutex<i64> {
    static LAST_TIME: OnceLock<Mutex<i64>> = OnceLock::new();
    LAST_TIME.get_or_init(|| Mutex::new(wall_clock_millis() * 1000))
}

/// Produces an ordering token at the given [`Resolution`].
///
/// For `Microseconds`, two calls `A` then `B` with a happens-before
/// relationship are guaranteed `result(B) > result(A)`, even if the wall
/// clock is stationary or moves backward between them. No ordering
/// guarantee is made across resolutions or across processes.
pub fn create_timestamp(resolution: Resolution) -> i64 {
    match resolution {
        Resolution::Seconds => wall_clock_millis() / 1000,
        Resolution::Milliseconds => wall_clock_millis(),
        Resolution::Microseconds => {
            let candidate = wall_clock_millis() * 1000;
            let mut last = last_time().lock().expect("timestamp mutex poisoned");
            if candidate > *last {
                *last = candidate;
            } else {
                *last += 1;
            }
            *last
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn microseconds_strictly_increase_under_repeated_calls() {
        let mut prev = create_timestamp(Resolution::Microseconds);
        for _ in 0..1_000 {
            let next = create_timestamp(Resolution::Microseconds);
            assert!(next > prev, "{} did not exceed {}", next, prev);
            prev = next;
        }
    }

    #[test]
    fn microseconds_increase_across_threads() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| {
                let mut values = Vec::with_capacity(200);
                for _ in 0..200 {
                    values.push(create_timestamp(Resolution::Microseconds));
                }
                values
            }))
            .collect();

        let mut all: Vec<i64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total, "microsecond timestamps collided across threads");
    }

    #[test]
    fn seconds_and_millis_track_wall_clock() {
        let millis = create_timestamp(Resolution::Milliseconds);
        let secs = create_timestamp(Resolution::Seconds);
        assert!((millis / 1000 - secs).abs() <= 1);
    }
}
