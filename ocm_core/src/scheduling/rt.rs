//! OS-level real-time thread attributes.
//!
//! Thin wrappers over the Linux scheduling syscalls: thread naming, RT
//! priority/policy, CPU affinity, and memory locking. Everything returns a
//! result; the task runtime logs and continues when RT privileges are
//! missing or the global enable flags are off, so a development machine
//! without CAP_SYS_NICE still runs the full task graph (without the RT
//! guarantees).
//!
//! A `tid` of `0` always means the calling thread.

use crate::error::{OcmError, OcmResult};

/// Scheduling policy for [`set_thread_priority`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    /// Default time-sharing scheduler.
    Other,
    /// Real-time FIFO; runs until blocked or preempted by higher priority.
    Fifo,
    /// Real-time round-robin with a time slice.
    RoundRobin,
    /// Batch workloads; mildly disfavored by the scheduler.
    Batch,
    /// Only runs when the CPU is otherwise idle.
    Idle,
    /// Earliest-deadline-first; requires `sched_setattr` parameters and is
    /// accepted here for completeness of the policy set.
    Deadline,
}

// SCHED_DEADLINE predates its libc constant on some of our toolchains.
#[cfg(target_os = "linux")]
const SCHED_DEADLINE_RAW: libc::c_int = 6;

#[cfg(target_os = "linux")]
impl SchedPolicy {
    fn as_raw(self) -> libc::c_int {
        match self {
            SchedPolicy::Other => libc::SCHED_OTHER,
            SchedPolicy::Fifo => libc::SCHED_FIFO,
            SchedPolicy::RoundRobin => libc::SCHED_RR,
            SchedPolicy::Batch => libc::SCHED_BATCH,
            SchedPolicy::Idle => libc::SCHED_IDLE,
            SchedPolicy::Deadline => SCHED_DEADLINE_RAW,
        }
    }
}

/// Set the calling thread's name, best-effort.
///
/// The kernel caps thread names at 15 characters plus the terminator;
/// longer names are truncated. Failures are ignored: the name only
/// matters for `top`/`htop` style inspection.
#[cfg(target_os = "linux")]
pub fn set_thread_name(name: &str) {
    let truncated: String = name.chars().take(15).collect();
    if let Ok(cname) = std::ffi::CString::new(truncated) {
        // SAFETY: PR_SET_NAME reads a valid null-terminated string.
        unsafe {
            libc::prctl(
                libc::PR_SET_NAME,
                cname.as_ptr() as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_thread_name(_name: &str) {}

/// Set scheduling policy and priority for a thread.
///
/// Requires CAP_SYS_NICE or root for the real-time policies.
#[cfg(target_os = "linux")]
pub fn set_thread_priority(tid: libc::pid_t, priority: i32, policy: SchedPolicy) -> OcmResult<()> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: param is fully initialized and policy maps to a valid
    // scheduler constant; tid 0 targets the calling thread.
    let rc = unsafe { libc::sched_setscheduler(tid, policy.as_raw(), &param) };
    if rc == 0 {
        Ok(())
    } else {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            Err(OcmError::resource(format!(
                "RT policy {policy:?} needs CAP_SYS_NICE or root: {err}"
            )))
        } else {
            Err(OcmError::resource(format!("sched_setscheduler failed: {err}")))
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_thread_priority(_tid: i32, _priority: i32, _policy: SchedPolicy) -> OcmResult<()> {
    Err(OcmError::resource("RT scheduling only supported on Linux"))
}

/// Pin a thread to a set of CPU cores.
///
/// The list is deduplicated. Any out-of-range index rejects the whole call
/// before the mask is applied: a partially-applied affinity is worse than
/// none. An empty list is a no-op (inherit the parent mask).
#[cfg(target_os = "linux")]
pub fn set_thread_cpu_affinity(tid: libc::pid_t, cpus: &[usize]) -> OcmResult<()> {
    if cpus.is_empty() {
        return Ok(());
    }

    // SAFETY: sysconf with a valid name constant has no preconditions.
    let num_cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if num_cpus < 1 {
        return Err(OcmError::last_os("sysconf(_SC_NPROCESSORS_ONLN) failed"));
    }

    let unique: std::collections::BTreeSet<usize> = cpus.iter().copied().collect();

    // SAFETY: cpu_set_t is plain data; zeroed is its empty state.
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    for &cpu in &unique {
        if cpu >= num_cpus as usize {
            return Err(OcmError::InvalidInput(format!(
                "CPU index {cpu} out of range (0..{num_cpus})"
            )));
        }
        // SAFETY: cpu < num_cpus <= CPU_SETSIZE on any supported kernel.
        unsafe { libc::CPU_SET(cpu, &mut set) };
    }

    // SAFETY: set is initialized above and sized per cpu_set_t.
    let rc = unsafe { libc::sched_setaffinity(tid, std::mem::size_of::<libc::cpu_set_t>(), &set) };
    if rc == 0 {
        Ok(())
    } else {
        Err(OcmError::last_os(format!("sched_setaffinity({cpus:?}) failed")))
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_thread_cpu_affinity(_tid: i32, _cpus: &[usize]) -> OcmResult<()> {
    Err(OcmError::resource("CPU affinity only supported on Linux"))
}

/// Lock all current and future pages into RAM and freeze the allocator's
/// interaction with the kernel.
///
/// Beyond `mlockall`, trimming is disabled so freed memory is never
/// returned to the kernel mid-flight, and the mmap threshold is zeroed so
/// large allocations stay on the (already locked) heap. On partial failure
/// the earlier steps are unwound. Requires CAP_IPC_LOCK or root.
#[cfg(target_os = "linux")]
pub fn lock_memory() -> OcmResult<()> {
    // SAFETY: MCL_CURRENT | MCL_FUTURE are valid mlockall flags.
    if unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            return Err(OcmError::resource(format!(
                "mlockall needs CAP_IPC_LOCK or root: {err}"
            )));
        }
        return Err(OcmError::resource(format!("mlockall failed: {err}")));
    }

    // mallopt returns nonzero on success.
    // SAFETY: mallopt with valid parameter constants has no preconditions.
    if unsafe { libc::mallopt(libc::M_TRIM_THRESHOLD, -1) } == 0 {
        // SAFETY: munlockall undoes the lock taken above.
        unsafe { libc::munlockall() };
        return Err(OcmError::resource("mallopt(M_TRIM_THRESHOLD) failed"));
    }
    // SAFETY: as above.
    if unsafe { libc::mallopt(libc::M_MMAP_MAX, 0) } == 0 {
        // SAFETY: restore the default trim threshold, then unlock.
        unsafe {
            libc::mallopt(libc::M_TRIM_THRESHOLD, 128 * 1024);
            libc::munlockall();
        }
        return Err(OcmError::resource("mallopt(M_MMAP_MAX) failed"));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn lock_memory() -> OcmResult<()> {
    Err(OcmError::resource("memory locking only supported on Linux"))
}

/// [`lock_memory`] plus prefaulting of `max_bytes` of heap.
///
/// Touches a page-aligned scratch allocation of the process's expected
/// dynamic-memory high-water mark, then frees it. The pages stay in the
/// page table, so later allocations of up to `max_bytes` fault nothing.
#[cfg(target_os = "linux")]
pub fn lock_and_prefault(max_bytes: usize) -> OcmResult<()> {
    lock_memory()?;

    // SAFETY: sysconf with a valid name constant has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    let mut buf: *mut libc::c_void = std::ptr::null_mut();
    // SAFETY: buf is a valid out-pointer; page_size is a power of two and a
    // multiple of sizeof(void*).
    let rc = unsafe { libc::posix_memalign(&mut buf, page_size, max_bytes) };
    if rc != 0 || buf.is_null() {
        return Err(OcmError::resource(format!(
            "posix_memalign({max_bytes}) failed: {}",
            std::io::Error::from_raw_os_error(rc)
        )));
    }
    // SAFETY: buf points to max_bytes of writable memory allocated above.
    unsafe {
        std::ptr::write_bytes(buf as *mut u8, 0, max_bytes);
        libc::free(buf);
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn lock_and_prefault(_max_bytes: usize) -> OcmResult<()> {
    Err(OcmError::resource("memory locking only supported on Linux"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_name_accepts_long_names() {
        // Truncated to the kernel's 15-char cap, never an error.
        set_thread_name("a_name_much_longer_than_the_kernel_allows");
        set_thread_name("short");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn affinity_rejects_out_of_range_cpu() {
        let err = set_thread_cpu_affinity(0, &[100_000]).unwrap_err();
        assert!(matches!(err, OcmError::InvalidInput(_)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn affinity_empty_list_is_noop() {
        set_thread_cpu_affinity(0, &[]).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn affinity_deduplicates_and_applies_cpu_zero() {
        // CPU 0 always exists; duplicates must not double-count or error.
        set_thread_cpu_affinity(0, &[0, 0, 0]).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn idle_policy_applies_without_privileges() {
        // SCHED_IDLE lowers privileges and is always permitted for self.
        set_thread_priority(0, 0, SchedPolicy::Idle).unwrap();
        // Restore the default policy for following tests in this process.
        let _ = set_thread_priority(0, 0, SchedPolicy::Other);
    }
}
