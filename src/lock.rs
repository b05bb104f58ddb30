//! Cross-process serialization for a segment.
//!
//! The sync block in the segment header reserves `SYN_VAR_PADDING`-aligned
//! storage; bootstrap installs a `PTHREAD_PROCESS_SHARED` rwlock there and
//! records its segment offset in `global_lock`. The allocator itself never
//! takes the lock. Callers serialize their segment operations by holding
//! one of the guards below; like everything else in the segment, the lock
//! is addressed by offset, so a handle works wherever the segment happens
//! to be mapped.

use std::io;

use crate::layout::{Word, SYN_VAR_PADDING};
use crate::view::SegView;

// The rwlock must fit in the aligned slot the sync block reserves; it is
// 56 bytes on x86_64 Linux and 200 bytes on macOS arm64.
const _: () = assert!(core::mem::size_of::<libc::pthread_rwlock_t>() <= 2 * SYN_VAR_PADDING);

fn rwlock_at(view: SegView, offset: Word) -> *mut libc::pthread_rwlock_t {
    view.ptr_at(offset) as *mut libc::pthread_rwlock_t
}

/// Install a fresh process-shared rwlock at `offset` inside the segment.
///
/// Called once per segment by the sync-block bootstrap, with the aligned
/// offset it just recorded in `global_lock`.
///
/// # Safety
///
/// `offset` must name at least `size_of::<pthread_rwlock_t>()` bytes of
/// zeroed or uninitialized storage inside the segment behind `view`, and
/// no other process may be using a lock there.
pub(crate) unsafe fn install_rwlock(view: SegView, offset: Word) -> io::Result<()> {
    debug_assert_eq!(offset % SYN_VAR_PADDING as Word, 0);

    let mut shared: libc::pthread_rwlockattr_t = std::mem::zeroed();
    let mut rc = libc::pthread_rwlockattr_init(&mut shared);
    if rc == 0 {
        rc = libc::pthread_rwlockattr_setpshared(&mut shared, libc::PTHREAD_PROCESS_SHARED);
        if rc == 0 {
            rc = libc::pthread_rwlock_init(rwlock_at(view, offset), &shared);
        }
        libc::pthread_rwlockattr_destroy(&mut shared);
    }
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

/// Handle to the rwlock a segment keeps in its sync block.
///
/// Obtained from [`crate::Segment::rwlock`]. The handle stores the lock's
/// segment offset and re-derives the host pointer on every use, so it
/// stays valid across re-mappings at different base addresses.
pub struct SegRwLock {
    view: SegView,
    offset: Word,
}

// All uses funnel into the process-shared pthread rwlock, which exists to
// be taken from many threads and processes at once.
unsafe impl Send for SegRwLock {}
unsafe impl Sync for SegRwLock {}

impl SegRwLock {
    pub(crate) fn new(view: SegView, offset: Word) -> Self {
        debug_assert_eq!(offset % SYN_VAR_PADDING as Word, 0);
        debug_assert!(
            offset + core::mem::size_of::<libc::pthread_rwlock_t>() as Word
                <= unsafe { (*view.header_ptr()).size }
        );
        SegRwLock { view, offset }
    }

    fn raw(&self) -> *mut libc::pthread_rwlock_t {
        rwlock_at(self.view, self.offset)
    }

    /// Take the lock shared. Blocks; released when the guard drops.
    pub fn read(&self) -> SegReadGuard<'_> {
        let rc = unsafe { libc::pthread_rwlock_rdlock(self.raw()) };
        debug_assert_eq!(rc, 0, "pthread_rwlock_rdlock failed: {rc}");
        SegReadGuard { lock: self }
    }

    /// Take the lock exclusive. Blocks; released when the guard drops.
    pub fn write(&self) -> SegWriteGuard<'_> {
        let rc = unsafe { libc::pthread_rwlock_wrlock(self.raw()) };
        debug_assert_eq!(rc, 0, "pthread_rwlock_wrlock failed: {rc}");
        SegWriteGuard { lock: self }
    }

    fn unlock(&self) {
        let rc = unsafe { libc::pthread_rwlock_unlock(self.raw()) };
        debug_assert_eq!(rc, 0, "pthread_rwlock_unlock failed: {rc}");
    }

    /// Tear the rwlock down. Only sound when no other process is using it.
    #[allow(dead_code)]
    pub unsafe fn destroy(&self) {
        libc::pthread_rwlock_destroy(self.raw());
    }
}

/// Shared hold on a segment's rwlock.
pub struct SegReadGuard<'a> {
    lock: &'a SegRwLock,
}

impl Drop for SegReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Exclusive hold on a segment's rwlock.
pub struct SegWriteGuard<'a> {
    lock: &'a SegRwLock,
}

impl Drop for SegWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
