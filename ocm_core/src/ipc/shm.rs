//! Named shared-memory buffer with a paired lock semaphore.
//!
//! A buffer is a fixed-size byte region backed by a tmpfs file under
//! `/dev/shm`, mapped into every attaching process. Access goes through a
//! named semaphore (`<name>_shm`, initial count 1) used as a cross-process
//! mutex; [`SharedBuffer::lock`] hands out an RAII guard so the lock is
//! released on every exit path, panics included.
//!
//! The region is zero-filled exactly once, by whichever process wins the
//! create race. Later attachers either verify the existing size
//! (`check_size`) or adopt it.

use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{OcmError, OcmResult};
use crate::ipc::{prefixed, NamedSemaphore};

#[cfg(target_os = "linux")]
const SHM_DIR: &str = "/dev/shm";
#[cfg(not(target_os = "linux"))]
const SHM_DIR: &str = "/tmp";

/// A named, fixed-size shared byte region plus its lock semaphore.
#[derive(Debug)]
pub struct SharedBuffer {
    map: UnsafeCell<MmapMut>,
    lock: NamedSemaphore,
    path: PathBuf,
    size: usize,
    owner: bool,
    _file: File,
}

// SAFETY: the mapped region is shared memory whose mutation is serialized
// by the paired semaphore; the UnsafeCell only exists so a guard can hand
// out &mut [u8] from a shared handle.
unsafe impl Send for SharedBuffer {}
unsafe impl Sync for SharedBuffer {}

impl SharedBuffer {
    /// Open or create the buffer `name`.
    ///
    /// On the create path the file is sized to `size` and zeroed. On the
    /// open path, `check_size` demands the existing region match `size`
    /// exactly; otherwise the existing size is adopted and `size` is
    /// ignored.
    pub fn attach(name: &str, check_size: bool, size: usize) -> OcmResult<Self> {
        let lock = NamedSemaphore::open(&format!("{name}_shm"), 1)?;
        let path = PathBuf::from(SHM_DIR).join(prefixed(name));

        let (file, actual_size, owner) = if path.exists() {
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            let existing = file.metadata()?.len() as usize;
            if check_size && existing != size {
                return Err(OcmError::Resource(format!(
                    "shared buffer '{name}' size mismatch: expected {size}, found {existing}"
                )));
            }
            (file, existing, false)
        } else {
            if size == 0 {
                return Err(OcmError::InvalidInput(format!(
                    "shared buffer '{name}' created with zero size"
                )));
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            file.set_len(size as u64)?;
            (file, size, true)
        };

        if actual_size == 0 {
            return Err(OcmError::Resource(format!(
                "shared buffer '{name}' has zero size on disk"
            )));
        }

        // SAFETY: file is open read-write and at least actual_size long.
        let mut map = unsafe { MmapOptions::new().len(actual_size).map_mut(&file)? };
        if owner {
            map.fill(0);
        }

        Ok(Self {
            map: UnsafeCell::new(map),
            lock,
            path,
            size: actual_size,
            owner,
            _file: file,
        })
    }

    /// Acquire the buffer lock, blocking until it is free.
    ///
    /// The returned guard is the only access to the bytes; it releases the
    /// lock when dropped.
    pub fn lock(&self) -> OcmResult<BufferGuard<'_>> {
        self.lock.wait()?;
        Ok(BufferGuard { buf: self })
    }

    /// Region size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this handle created (and zero-filled) the region.
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Unmap and close without removing the named region.
    pub fn detach(self) {
        drop(self);
    }

    /// Unmap, close, and remove both the region and its lock semaphore
    /// from the system.
    pub fn destroy(self) -> OcmResult<()> {
        let Self { map, lock, path, _file, .. } = self;
        drop(map);
        drop(_file);
        if let Err(err) = std::fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(err.into());
            }
        }
        lock.destroy()
    }
}

/// RAII lock over a [`SharedBuffer`]; derefs to the mapped bytes.
#[derive(Debug)]
pub struct BufferGuard<'a> {
    buf: &'a SharedBuffer,
}

impl Deref for BufferGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the guard holds the cross-process lock, so no other
        // locked accessor aliases the region for the guard's lifetime.
        unsafe { &*self.buf.map.get() }
    }
}

impl DerefMut for BufferGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in Deref; the lock gives exclusive access.
        unsafe { &mut *self.buf.map.get() }
    }
}

impl Drop for BufferGuard<'_> {
    fn drop(&mut self) {
        // Failure to post leaves peers deadlocked; there is no better
        // recovery than making noise.
        if let Err(err) = self.buf.lock.post() {
            log::error!("[SharedBuffer] releasing lock failed: {err}");
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
    fn create_is_zero_filled_and_writable() {
        let name = unique_name("shm_zero");
        let buf = SharedBuffer::attach(&name, false, 256).unwrap();
        assert!(buf.is_owner());
        {
            let mut guard = buf.lock().unwrap();
            assert!(guard.iter().all(|&b| b == 0));
            guard[0] = 0xAB;
            guard[255] = 0xCD;
        }
        {
            let guard = buf.lock().unwrap();
            assert_eq!(guard[0], 0xAB);
            assert_eq!(guard[255], 0xCD);
        }
        buf.destroy().unwrap();
    }

    #[test]
    fn second_attach_adopts_existing_size() {
        let name = unique_name("shm_adopt");
        let creator = SharedBuffer::attach(&name, false, 128).unwrap();
        let attacher = SharedBuffer::attach(&name, false, 0).unwrap();
        assert_eq!(attacher.size(), 128);
        assert!(!attacher.is_owner());
        drop(attacher);
        creator.destroy().unwrap();
    }

    #[test]
    fn check_size_rejects_mismatch() {
        let name = unique_name("shm_mismatch");
        let creator = SharedBuffer::attach(&name, false, 64).unwrap();
        let err = SharedBuffer::attach(&name, true, 65).unwrap_err();
        assert!(matches!(err, OcmError::Resource(_)));
        creator.destroy().unwrap();
    }

    #[test]
    fn writes_are_visible_through_second_handle() {
        let name = unique_name("shm_visible");
        let a = SharedBuffer::attach(&name, false, 32).unwrap();
        let b = SharedBuffer::attach(&name, true, 32).unwrap();
        {
            let mut guard = a.lock().unwrap();
            guard[7] = 42;
        }
        {
            let guard = b.lock().unwrap();
            assert_eq!(guard[7], 42);
        }
        drop(b);
        a.destroy().unwrap();
    }

    #[test]
    fn guard_releases_lock_on_panic() {
        let name = unique_name("shm_panic");
        let buf = SharedBuffer::attach(&name, false, 16).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = buf.lock().unwrap();
            panic!("poisoned tick");
        }));
        assert!(result.is_err());

        // The lock must have been released during unwinding.
        let guard = buf.lock().unwrap();
        drop(guard);
        buf.destroy().unwrap();
    }

    #[test]
    fn zero_size_create_is_rejected() {
        let name = unique_name("shm_zero_size");
        let err = SharedBuffer::attach(&name, false, 0).unwrap_err();
        assert!(matches!(err, OcmError::InvalidInput(_)));
    }
}
