//! Small helpers shared across the engine: time conversion, alignment and
//! log flood suppression.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Milliseconds since the unix epoch, the timestamp unit of chunk frames.
pub fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Round `value` up to the next multiple of `align`, which must be a power
/// of two.
#[inline]
pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// A gate limiting each `(kind, region)` error class to one log line per
/// window, so a corrupted region cannot flood the log under sustained reads.
pub struct LogGate {
    window: Duration,
    seen: Mutex<HashMap<(&'static str, (i32, i32)), Instant>>,
}

impl LogGate {

    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Return true if the caller should emit the log line for this error
    /// kind and region, and arm the window for subsequent calls.
    pub fn should_log(&self, kind: &'static str, rx: i32, rz: i32) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        match seen.get(&(kind, (rx, rz))) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                seen.insert((kind, (rx, rz)), now);
                true
            }
        }
    }

}

impl Default for LogGate {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn align() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(8193, 4096), 12288);
        assert_eq!(align_up(8192, 256), 8192);
    }

    #[test]
    fn gate_suppresses_repeats() {
        let gate = LogGate::new(Duration::from_secs(60));
        assert!(gate.should_log("decompress", 0, 0));
        assert!(!gate.should_log("decompress", 0, 0));
        // A different region or a different kind has its own window.
        assert!(gate.should_log("decompress", 1, 0));
        assert!(gate.should_log("io", 0, 0));
    }

    #[test]
    fn gate_reopens_after_window() {
        let gate = LogGate::new(Duration::from_millis(0));
        assert!(gate.should_log("io", 0, 0));
        assert!(gate.should_log("io", 0, 0));
    }

}
