/*! Thin platform layer.
 *
 *  Locks and condition variables come from `parking_lot` (non-recursive
 *  mutexes, RAII guards released on every exit path), threads from `std`,
 *  and thread-local slots from `thread_local!` at their use sites. The one
 *  thing the standard library does not hand us directly is a monotonic
 *  clock readable as seconds.
 */

use std::time::Instant;

use once_cell::sync::Lazy;

pub use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic high-resolution timestamp in seconds since the first call site
/// in this process touched the clock.
#[inline]
pub fn now() -> f64 {
    EPOCH.elapsed().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic() {
        let a = now();
        let b = now();
        assert!(b >= a);
        assert!(a >= 0.0);
    }
}
