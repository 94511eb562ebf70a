/// Returns the CLOCK_MONOTONIC timestamp in ns.
///
/// Frame timestamps published through the exchange come from this clock so
/// that consumers can compare them without worrying about wall-clock steps.
#[inline(never)]
pub fn mono_time_ns() -> u64 {
    use libc::{clock_gettime, timespec, CLOCK_MONOTONIC};
    unsafe {
        let mut ts = timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        clock_gettime(CLOCK_MONOTONIC, &mut ts);
        (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_time_ns_returns_positive() {
        let t = mono_time_ns();
        assert!(t > 0, "mono_time_ns should return a positive timestamp");
    }

    #[test]
    fn mono_time_ns_is_monotonic_non_decreasing() {
        // Not strictly guaranteed to be strictly increasing for back-to-back
        // calls, but it should not go backwards.
        let t1 = mono_time_ns();
        let t2 = mono_time_ns();
        assert!(
            t2 >= t1,
            "mono_time_ns should be monotonic: t2={} < t1={}",
            t2,
            t1
        );
    }

    #[test]
    fn mono_time_ns_increases_over_sleep() {
        use std::thread;
        use std::time::Duration;

        let t1 = mono_time_ns();
        thread::sleep(Duration::from_millis(5));
        let t2 = mono_time_ns();

        assert!(
            t2 > t1,
            "mono_time_ns should increase over time: t2={} <= t1={}",
            t2,
            t1
        );
    }
}
