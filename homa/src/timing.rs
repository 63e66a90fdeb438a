//! Monotonic time source for the protocol timers.
//!
//! Timeout logic takes explicit microsecond timestamps so tests can drive
//! time by hand; production callers feed it [`monotonic_micros`].

use std::sync::OnceLock;
use std::time::Instant;

/// Microseconds since an arbitrary process-local epoch.
#[inline]
pub fn monotonic_micros() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic() {
        let a = monotonic_micros();
        let b = monotonic_micros();
        assert!(b >= a);
    }
}
