//! Named POSIX counting semaphore.
//!
//! The cross-process synchronization primitive under both the topic layer
//! (ready-frame counting) and the shared-buffer lock. Open-or-create
//! semantics: the first process to open a name creates it with the given
//! initial count, later opens attach to the same kernel object.

use std::ffi::CString;

use crate::error::{OcmError, OcmResult};
use crate::ipc::prefixed;

/// Handle on a named POSIX semaphore.
///
/// Dropping the handle closes it without removing the name; only
/// [`NamedSemaphore::destroy`] unlinks the kernel object.
#[derive(Debug)]
pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: String,
}

// SAFETY: sem_t operations are thread-safe by POSIX; the raw pointer is an
// opaque kernel handle, not thread-local state.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Open (or create with `initial` permits) the semaphore `name`.
    pub fn open(name: &str, initial: u32) -> OcmResult<Self> {
        let full = prefixed(name);
        let cname = CString::new(full.clone())
            .map_err(|_| OcmError::InvalidInput(format!("semaphore name '{name}' contains NUL")))?;

        // SAFETY: cname is a valid null-terminated string; O_CREAT with a
        // mode and initial value is the documented open-or-create form.
        let sem = unsafe { libc::sem_open(cname.as_ptr(), libc::O_CREAT, 0o644 as libc::c_uint, initial) };
        if sem == libc::SEM_FAILED {
            return Err(OcmError::last_os(format!("sem_open('{full}') failed")));
        }
        Ok(Self { sem, name: full })
    }

    /// Increment the count, waking one waiter if any.
    pub fn post(&self) -> OcmResult<()> {
        // SAFETY: self.sem is a valid handle from sem_open.
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(OcmError::last_os(format!("sem_post('{}') failed", self.name)));
        }
        Ok(())
    }

    /// Increment the count `n` times.
    pub fn post_n(&self, n: u32) -> OcmResult<()> {
        for _ in 0..n {
            self.post()?;
        }
        Ok(())
    }

    /// Post only when the current count is zero.
    ///
    /// This bounds the pending count at 1: however many posts were dropped
    /// while a subscriber was away, it sees exactly "one ready". The check
    /// and post are not a single atomic step, so the bound holds only under
    /// the topic contract of a single publisher per semaphore.
    pub fn post_if_zero(&self) -> OcmResult<()> {
        if self.value()? == 0 {
            self.post()?;
        }
        Ok(())
    }

    /// Block until the count is positive, then decrement it.
    pub fn wait(&self) -> OcmResult<()> {
        loop {
            // SAFETY: self.sem is a valid handle from sem_open.
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(OcmError::Resource(format!(
                    "sem_wait('{}') failed: {err}",
                    self.name
                )));
            }
        }
    }

    /// Decrement without blocking. Returns `false` when the count is zero.
    pub fn try_wait(&self) -> bool {
        // SAFETY: self.sem is a valid handle from sem_open.
        unsafe { libc::sem_trywait(self.sem) == 0 }
    }

    /// Wait up to `timeout_ms`. Returns `false` on timeout: a timeout is
    /// an expected outcome here, not an error.
    pub fn wait_timeout(&self, timeout_ms: u64) -> OcmResult<bool> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // sem_timedwait takes an absolute CLOCK_REALTIME deadline.
        // SAFETY: ts is a valid writable timespec.
        if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) } != 0 {
            return Err(OcmError::last_os("clock_gettime(CLOCK_REALTIME) failed"));
        }
        ts.tv_sec += (timeout_ms / 1000) as libc::time_t;
        ts.tv_nsec += ((timeout_ms % 1000) * 1_000_000) as libc::c_long;
        ts.tv_sec += ts.tv_nsec / 1_000_000_000;
        ts.tv_nsec %= 1_000_000_000;

        loop {
            // SAFETY: self.sem is valid; ts is a fully-normalized timespec.
            if unsafe { libc::sem_timedwait(self.sem, &ts) } == 0 {
                return Ok(true);
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ETIMEDOUT) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => {
                    return Err(OcmError::Resource(format!(
                        "sem_timedwait('{}') failed: {err}",
                        self.name
                    )))
                }
            }
        }
    }

    /// Current count. Debug/diagnostic use.
    pub fn value(&self) -> OcmResult<i32> {
        let mut value: libc::c_int = 0;
        // SAFETY: self.sem is valid; value is a writable out-parameter.
        if unsafe { libc::sem_getvalue(self.sem, &mut value) } != 0 {
            return Err(OcmError::last_os(format!(
                "sem_getvalue('{}') failed",
                self.name
            )));
        }
        Ok(value)
    }

    /// Close and unlink the semaphore. A name already removed by a peer is
    /// not an error.
    pub fn destroy(self) -> OcmResult<()> {
        // Take ownership of the fields; the handle is closed exactly once,
        // here, and Drop is skipped.
        let mut this = std::mem::ManuallyDrop::new(self);
        let sem = this.sem;
        let name = std::mem::take(&mut this.name);

        // SAFETY: sem is a valid handle from sem_open, not closed before.
        if unsafe { libc::sem_close(sem) } != 0 {
            return Err(OcmError::last_os(format!("sem_close('{name}') failed")));
        }
        let cname = CString::new(name.clone())
            .map_err(|_| OcmError::InvalidInput("semaphore name contains NUL".into()))?;
        // SAFETY: cname is a valid null-terminated string.
        if unsafe { libc::sem_unlink(cname.as_ptr()) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(OcmError::Resource(format!("sem_unlink('{name}') failed: {err}")));
            }
        }
        Ok(())
    }

    /// OS-visible (prefixed) name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: self.sem is a valid handle not yet closed (destroy()
        // bypasses Drop via ManuallyDrop).
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn post_and_wait_round_trip() {
        let name = unique_name("sem_basic");
        let sem = NamedSemaphore::open(&name, 0).unwrap();
        assert_eq!(sem.value().unwrap(), 0);
        sem.post().unwrap();
        assert_eq!(sem.value().unwrap(), 1);
        sem.wait().unwrap();
        assert_eq!(sem.value().unwrap(), 0);
        sem.destroy().unwrap();
    }

    #[test]
    fn try_wait_does_not_block() {
        let name = unique_name("sem_try");
        let sem = NamedSemaphore::open(&name, 0).unwrap();
        assert!(!sem.try_wait());
        sem.post().unwrap();
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        sem.destroy().unwrap();
    }

    #[test]
    fn post_if_zero_bounds_pending_at_one() {
        let name = unique_name("sem_zero");
        let sem = NamedSemaphore::open(&name, 0).unwrap();
        for _ in 0..5 {
            sem.post_if_zero().unwrap();
        }
        assert_eq!(sem.value().unwrap(), 1);
        sem.destroy().unwrap();
    }

    #[test]
    fn wait_timeout_reports_timeout_as_false() {
        let name = unique_name("sem_timeout");
        let sem = NamedSemaphore::open(&name, 0).unwrap();
        let start = std::time::Instant::now();
        assert!(!sem.wait_timeout(50).unwrap());
        assert!(start.elapsed().as_millis() >= 40);

        sem.post().unwrap();
        assert!(sem.wait_timeout(50).unwrap());
        sem.destroy().unwrap();
    }

    #[test]
    fn second_open_attaches_to_same_object() {
        let name = unique_name("sem_shared");
        let a = NamedSemaphore::open(&name, 0).unwrap();
        let b = NamedSemaphore::open(&name, 7).unwrap();
        // b attached to the existing object: initial value 7 ignored.
        a.post().unwrap();
        assert_eq!(b.value().unwrap(), 1);
        drop(b);
        a.destroy().unwrap();
    }

    #[test]
    fn post_n_adds_n_permits() {
        let name = unique_name("sem_post_n");
        let sem = NamedSemaphore::open(&name, 0).unwrap();
        sem.post_n(3).unwrap();
        assert_eq!(sem.value().unwrap(), 3);
        sem.destroy().unwrap();
    }
}
