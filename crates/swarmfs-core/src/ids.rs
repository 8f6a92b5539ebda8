//! Collision-resistant identifiers and retry jitter.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;

static SEQ: AtomicU64 = AtomicU64::new(0);

fn fallback_seed() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    #[allow(clippy::cast_possible_truncation)]
    let low = nanos as u64;
    low ^ (u64::from(std::process::id()) << 32) ^ SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Random hex suffix (12 chars). Falls back to a pid/clock/counter mix when
/// the OS entropy source is unavailable.
#[must_use]
pub fn unique_suffix() -> String {
    let mut buf = [0u8; 6];
    if getrandom::getrandom(&mut buf).is_err() {
        buf.copy_from_slice(&fallback_seed().to_le_bytes()[..6]);
    }
    hex::encode(buf)
}

/// Identifier for a new mailbox message: sortable timestamp + random suffix.
#[must_use]
pub fn new_message_id() -> String {
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%dT%H%M%S%6fZ"),
        unique_suffix()
    )
}

/// Per-process, per-call sequence number, used for temp file names.
#[must_use]
pub fn next_seq() -> u64 {
    SEQ.fetch_add(1, Ordering::Relaxed)
}

thread_local! {
    static RNG: Cell<u64> = Cell::new({
        let mut seed = [0u8; 8];
        if getrandom::getrandom(&mut seed).is_err() {
            seed = fallback_seed().to_le_bytes();
        }
        u64::from_le_bytes(seed) | 1
    });
}

/// Thread-local xorshift64 draw in `0..range`.
fn next_below(range: u64) -> u64 {
    if range == 0 {
        return 0;
    }
    RNG.with(|cell| {
        let mut s = cell.get();
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        cell.set(s);
        s % range
    })
}

/// Uniform jitter in `[min, max]`. Seeds differ per thread and per process,
/// so agents that woke on the same tick spread their retries out.
#[must_use]
pub fn jitter_between(min: Duration, max: Duration) -> Duration {
    let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
    let lo_ms = u64::try_from(lo.as_millis()).unwrap_or(u64::MAX);
    let hi_ms = u64::try_from(hi.as_millis()).unwrap_or(u64::MAX);
    let span = hi_ms.saturating_sub(lo_ms).saturating_add(1);
    Duration::from_millis(lo_ms.saturating_add(next_below(span)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn suffixes_do_not_collide() {
        let seen: HashSet<String> = (0..1000).map(|_| unique_suffix()).collect();
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn message_ids_are_unique_and_sortable_prefix() {
        let a = new_message_id();
        let b = new_message_id();
        assert_ne!(a, b);
        assert!(a.contains('T'));
        assert_eq!(a.len(), b.len());
    }

    #[test]
    fn jitter_stays_in_window() {
        let min = Duration::from_millis(50);
        let max = Duration::from_millis(250);
        for _ in 0..500 {
            let j = jitter_between(min, max);
            assert!(j >= min && j <= max, "{j:?} out of window");
        }
    }

    #[test]
    fn jitter_handles_degenerate_windows() {
        let d = Duration::from_millis(10);
        assert_eq!(jitter_between(d, d), d);
        let j = jitter_between(Duration::from_millis(20), Duration::from_millis(10));
        assert!(j >= Duration::from_millis(10) && j <= Duration::from_millis(20));
    }
}
