//! Monotonic timing primitives for the task runtime.
//!
//! Two tools built on the steady monotonic clock:
//!
//! - [`Stopwatch`] measures elapsed intervals and re-arms itself on every
//!   read, which is what the task loop wants for per-wake durations.
//! - [`PeriodicLoop`] holds an *absolute* wake time and sleeps to it with
//!   `clock_nanosleep(TIMER_ABSTIME)`. Relative sleeps accumulate phase
//!   error under jitter; absolute sleeps do not.

use std::time::Instant;

pub(crate) const NS_PER_SEC: i64 = 1_000_000_000;

/// Elapsed-time measurement against the monotonic clock.
///
/// Every `elapsed_*` read returns the time since the previous read (or
/// [`Stopwatch::start`]) and resets the origin to now.
#[derive(Debug)]
pub struct Stopwatch {
    origin: Instant,
}

impl Stopwatch {
    /// Create a stopwatch already running.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Restart the measurement origin.
    pub fn start(&mut self) {
        self.origin = Instant::now();
    }

    /// Nanoseconds since the last read, resetting the origin.
    pub fn elapsed_ns(&mut self) -> i64 {
        let now = Instant::now();
        let ns = now.duration_since(self.origin).as_nanos() as i64;
        self.origin = now;
        ns
    }

    /// Milliseconds since the last read, resetting the origin.
    pub fn elapsed_ms(&mut self) -> f64 {
        self.elapsed_ns() as f64 / 1.0e6
    }

    /// Seconds since the last read, resetting the origin.
    pub fn elapsed_secs(&mut self) -> f64 {
        self.elapsed_ns() as f64 / 1.0e9
    }
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Current monotonic time in milliseconds (time since an arbitrary epoch,
/// typically boot). Useful for timestamping samples across threads.
pub fn monotonic_now_ms() -> f64 {
    let (sec, nsec) = monotonic_now();
    (sec as f64) * 1.0e3 + (nsec as f64) / 1.0e6
}

pub(crate) fn monotonic_now() -> (i64, i64) {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid, writable timespec and CLOCK_MONOTONIC is a
    // supported clock id on every target we build for.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    debug_assert_eq!(rc, 0, "clock_gettime(CLOCK_MONOTONIC) cannot fail");
    (ts.tv_sec as i64, ts.tv_nsec as i64)
}

/// Sleep until an absolute monotonic instant.
#[cfg(target_os = "linux")]
pub(crate) fn sleep_until(sec: i64, nsec: i64) {
    let ts = libc::timespec {
        tv_sec: sec as libc::time_t,
        tv_nsec: nsec as libc::c_long,
    };
    loop {
        // SAFETY: ts is a valid timespec; TIMER_ABSTIME with CLOCK_MONOTONIC
        // sleeps to an absolute instant. A target already in the past
        // returns immediately.
        let rc = unsafe {
            libc::clock_nanosleep(libc::CLOCK_MONOTONIC, libc::TIMER_ABSTIME, &ts, std::ptr::null_mut())
        };
        if rc != libc::EINTR {
            break;
        }
    }
}

/// Portable fallback: convert the absolute target to a relative interval.
/// Loses the drift-free property; only used where `clock_nanosleep` is
/// unavailable.
#[cfg(not(target_os = "linux"))]
pub(crate) fn sleep_until(sec: i64, nsec: i64) {
    let (now_s, now_ns) = monotonic_now();
    let remaining_ns = (sec - now_s) * NS_PER_SEC + (nsec - now_ns);
    if remaining_ns > 0 {
        std::thread::sleep(std::time::Duration::from_nanos(remaining_ns as u64));
    }
}

/// Absolute-time periodic cadence.
///
/// Carries the next wake instant `W` and the period `P`. `sleep_until_next`
/// sleeps to `W` and advances `W += P`, so a tick that overruns slightly is
/// followed by a short sleep rather than a shifted phase. A task that
/// detects a *long* overrun calls [`PeriodicLoop::reset`] to resynchronize
/// instead of bursting through the backlog.
#[derive(Debug)]
pub struct PeriodicLoop {
    wake_sec: i64,
    wake_nsec: i64,
    period_ns: i64,
    period_ms: f64,
}

impl PeriodicLoop {
    pub fn new() -> Self {
        let (sec, nsec) = monotonic_now();
        Self {
            wake_sec: sec,
            wake_nsec: nsec,
            period_ns: 0,
            period_ms: 0.0,
        }
    }

    /// Set the loop period in seconds and schedule the first wake one
    /// period from now.
    pub fn set_period(&mut self, period_secs: f64) {
        self.period_ms = period_secs * 1.0e3;
        self.period_ns = (period_secs * 1.0e9) as i64;
        self.reset();
        self.advance();
    }

    /// Current period in milliseconds.
    pub fn period_ms(&self) -> f64 {
        self.period_ms
    }

    /// Re-anchor the wake time to now, discarding any accumulated backlog.
    pub fn reset(&mut self) {
        let (sec, nsec) = monotonic_now();
        self.wake_sec = sec;
        self.wake_nsec = nsec;
    }

    /// Sleep until the scheduled wake instant, then schedule the next one.
    pub fn sleep_until_next(&mut self) {
        let (sec, nsec) = self.take_wake();
        sleep_until(sec, nsec);
    }

    /// Consume the current wake target and advance the schedule.
    ///
    /// Split out from [`PeriodicLoop::sleep_until_next`] so callers can
    /// perform the blocking sleep outside any lock that guards this struct.
    pub(crate) fn take_wake(&mut self) -> (i64, i64) {
        let target = (self.wake_sec, self.wake_nsec);
        self.advance();
        target
    }

    fn advance(&mut self) {
        self.wake_nsec += self.period_ns;
        if self.wake_nsec >= NS_PER_SEC {
            self.wake_sec += self.wake_nsec / NS_PER_SEC;
            self.wake_nsec %= NS_PER_SEC;
        }
    }
}

impl Default for PeriodicLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopwatch_resets_on_read() {
        let mut sw = Stopwatch::new();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let first = sw.elapsed_ms();
        let second = sw.elapsed_ms();
        assert!(first >= 4.0, "first read {first} ms too small");
        assert!(second < first, "second read should measure a fresh origin");
    }

    #[test]
    fn periodic_loop_advances_by_whole_periods() {
        let mut pl = PeriodicLoop::new();
        pl.set_period(0.5);
        let (s1, n1) = pl.take_wake();
        let (s2, n2) = pl.take_wake();
        let delta = (s2 - s1) * NS_PER_SEC + (n2 - n1);
        assert_eq!(delta, 500_000_000);
        assert!(n1 < NS_PER_SEC && n2 < NS_PER_SEC, "nanoseconds must stay normalized");
    }

    #[test]
    fn periodic_loop_holds_cadence() {
        let mut pl = PeriodicLoop::new();
        pl.set_period(0.01);
        let start = Instant::now();
        for _ in 0..5 {
            pl.sleep_until_next();
        }
        let elapsed = start.elapsed().as_millis();
        // Five 10 ms ticks: allow generous jitter but reject gross drift.
        assert!((40..200).contains(&elapsed), "elapsed {elapsed} ms out of range");
    }

    #[test]
    fn monotonic_now_is_monotone() {
        let a = monotonic_now_ms();
        let b = monotonic_now_ms();
        assert!(b >= a);
    }
}
