//! Three interchangeable wake-up sources for task threads.
//!
//! A task loop calls [`SleepStrategy::sleep`] once per wake and never
//! inspects which concrete strategy it holds:
//!
//! - [`InternalTimerSleep`]: self-clocked absolute-time periodic loop.
//! - [`ExternalTimerSleep`]: counts ticks posted by an external ticker
//!   process on a named semaphore; missed ticks coalesce.
//! - [`TriggerSleep`]: one wake per post; event-driven tasks.
//!
//! `resume` is the cross-thread nudge used by stop/destroy: it guarantees
//! a pending `sleep` returns promptly (for the internal clock it only
//! resets the cadence: a blocked absolute sleep of one period is already
//! bounded).

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::TimerType;
use crate::error::OcmResult;
use crate::ipc::{NamedSemaphore, SharedBuffer};
use crate::scheduling::timer::{self, PeriodicLoop};

/// Common surface of the three wake-up sources.
pub trait SleepStrategy: Send + Sync {
    /// Block until the next wake. `hint_ms` is the caller's last run
    /// duration; a strategy may use it to detect overruns.
    fn sleep(&self, hint_ms: f64);

    /// Reconfigure the period in seconds. No-op for trigger strategies.
    fn set_period(&self, _period_secs: f64) {}

    /// Current period in milliseconds; 0 when not periodic.
    fn period_ms(&self) -> f64 {
        0.0
    }

    /// Wake or re-arm the strategy from another thread.
    fn resume(&self);
}

/// Self-clocked periodic wake-up on the monotonic clock.
pub struct InternalTimerSleep {
    clock: Mutex<PeriodicLoop>,
}

impl InternalTimerSleep {
    pub fn new() -> Self {
        let mut clock = PeriodicLoop::new();
        clock.set_period(0.01);
        Self {
            clock: Mutex::new(clock),
        }
    }
}

impl Default for InternalTimerSleep {
    fn default() -> Self {
        Self::new()
    }
}

impl SleepStrategy for InternalTimerSleep {
    fn sleep(&self, hint_ms: f64) {
        // Take the absolute target under the lock, sleep outside it, so a
        // concurrent resume() is never blocked behind the sleeper.
        let (sec, nsec) = self.clock.lock().take_wake();
        timer::sleep_until(sec, nsec);
        if hint_ms > self.period_ms() {
            // The caller overran a whole period: resynchronize instead of
            // bursting through the accumulated backlog.
            self.clock.lock().reset();
        }
    }

    fn set_period(&self, period_secs: f64) {
        self.clock.lock().set_period(period_secs);
    }

    fn period_ms(&self) -> f64 {
        self.clock.lock().period_ms()
    }

    fn resume(&self) {
        self.clock.lock().reset();
    }
}

/// Wake-up driven by an external periodic ticker.
///
/// The ticker posts a well-known semaphore every `dt` milliseconds; `dt`
/// itself is read once from a one-byte shared buffer published by the
/// ticker. A period of `p` seconds then means `p * 1000 / dt` semaphore
/// waits per wake. The wait counter resets on every wake, so ticks missed
/// during an overrun coalesce instead of queueing.
pub struct ExternalTimerSleep {
    sem: NamedSemaphore,
    dt_ms: u8,
    interval_target: AtomicI32,
    interval_count: AtomicI32,
    // Keeps the ticker's dt region mapped for the lifetime of the task.
    _shm: SharedBuffer,
}

impl ExternalTimerSleep {
    pub fn open(sem_name: &str, shm_name: &str) -> OcmResult<Self> {
        let sem = NamedSemaphore::open(sem_name, 0)?;
        let shm = SharedBuffer::attach(shm_name, false, std::mem::size_of::<u8>())?;
        let dt_ms = {
            let guard = shm.lock()?;
            guard[0]
        }
        .max(1);
        Ok(Self {
            sem,
            dt_ms,
            interval_target: AtomicI32::new(0),
            interval_count: AtomicI32::new(0),
            _shm: shm,
        })
    }
}

impl SleepStrategy for ExternalTimerSleep {
    fn sleep(&self, hint_ms: f64) {
        while self.interval_count.load(Ordering::Acquire) < self.interval_target.load(Ordering::Acquire)
            && hint_ms < self.period_ms()
        {
            if let Err(err) = self.sem.wait() {
                log::error!("[Sleep] external tick wait failed: {err}");
                break;
            }
            self.interval_count.fetch_add(1, Ordering::AcqRel);
        }
        self.interval_count.store(0, Ordering::Release);
    }

    fn set_period(&self, period_secs: f64) {
        let target = (period_secs * 1000.0 / f64::from(self.dt_ms)) as i32;
        self.interval_target.store(target, Ordering::Release);
        self.interval_count.store(0, Ordering::Release);
    }

    fn period_ms(&self) -> f64 {
        f64::from(self.interval_target.load(Ordering::Acquire)) * f64::from(self.dt_ms)
    }

    fn resume(&self) {
        // Target 0 makes any pending or future sleep return immediately;
        // the post releases a wait already in flight.
        self.interval_target.store(0, Ordering::Release);
        if let Err(err) = self.sem.post() {
            log::error!("[Sleep] external tick resume failed: {err}");
        }
    }
}

/// One wake per semaphore post.
pub struct TriggerSleep {
    sem: NamedSemaphore,
}

impl TriggerSleep {
    pub fn open(sem_name: &str) -> OcmResult<Self> {
        Ok(Self {
            sem: NamedSemaphore::open(sem_name, 0)?,
        })
    }
}

impl SleepStrategy for TriggerSleep {
    fn sleep(&self, _hint_ms: f64) {
        if let Err(err) = self.sem.wait() {
            log::error!("[Sleep] trigger wait failed: {err}");
        }
    }

    fn resume(&self) {
        if let Err(err) = self.sem.post() {
            log::error!("[Sleep] trigger resume failed: {err}");
        }
    }
}

/// Build the strategy a task of the given timer type needs.
///
/// External and trigger tasks rendezvous with their ticker through
/// resources named after the task itself.
pub fn for_timer(timer_type: TimerType, task_name: &str) -> OcmResult<Arc<dyn SleepStrategy>> {
    Ok(match timer_type {
        TimerType::Internal => Arc::new(InternalTimerSleep::new()),
        TimerType::External => Arc::new(ExternalTimerSleep::open(task_name, task_name)?),
        TimerType::Trigger => Arc::new(TriggerSleep::open(task_name)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn unique_name(prefix: &str) -> String {
        format!(
            "{}_{}_{}",
            prefix,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        )
    }

    #[test]
    fn internal_sleep_waits_roughly_one_period() {
        let sleep = InternalTimerSleep::new();
        sleep.set_period(0.02);
        let start = Instant::now();
        sleep.sleep(0.0);
        let elapsed = start.elapsed().as_millis();
        assert!((10..200).contains(&elapsed), "elapsed {elapsed} ms");
        assert!((sleep.period_ms() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn trigger_sleep_wakes_on_resume() {
        let name = unique_name("trig");
        let sleep = Arc::new(TriggerSleep::open(&name).unwrap());

        let sleeper = {
            let sleep = Arc::clone(&sleep);
            std::thread::spawn(move || {
                sleep.sleep(0.0);
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        sleep.resume();
        sleeper.join().unwrap();
    }

    #[test]
    fn external_sleep_counts_ticks_to_target() {
        let name = unique_name("ext");
        // The ticker publishes dt = 1 ms before any task attaches.
        let dt_region = SharedBuffer::attach(&name, false, 1).unwrap();
        dt_region.lock().unwrap()[0] = 1;

        let sleep = Arc::new(ExternalTimerSleep::open(&name, &name).unwrap());
        sleep.set_period(0.003);
        assert!((sleep.period_ms() - 3.0).abs() < 1e-9);

        let sleeper = {
            let sleep = Arc::clone(&sleep);
            std::thread::spawn(move || {
                sleep.sleep(0.0);
            })
        };
        // Three dt ticks complete one period.
        for _ in 0..3 {
            sleep.sem.post().unwrap();
        }
        sleeper.join().unwrap();
        dt_region.destroy().unwrap();
    }

    #[test]
    fn external_resume_returns_pending_sleep_immediately() {
        let name = unique_name("ext_resume");
        let dt_region = SharedBuffer::attach(&name, false, 1).unwrap();
        dt_region.lock().unwrap()[0] = 10;

        let sleep = Arc::new(ExternalTimerSleep::open(&name, &name).unwrap());
        sleep.set_period(10.0); // far more ticks than the test will post

        let sleeper = {
            let sleep = Arc::clone(&sleep);
            std::thread::spawn(move || {
                sleep.sleep(0.0);
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        sleep.resume();
        sleeper.join().unwrap();
        dt_region.destroy().unwrap();
    }
}
