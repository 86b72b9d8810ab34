use crate::error::{ForgeError, ForgeResult};
use crate::sys::{ProbeLock, Segment, SharedMemory};
use crate::types::SegmentKey;
use log::{debug, warn};
use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;

const SEGMENT_SIZE: libc::size_t = 1;
const SEGMENT_MODE: libc::c_int = 0o600;

/// System V shared memory backend.
///
/// A System V segment outlives a crashed creator, so a plain "create
/// exclusively" check would report a dead holder as alive. Every detach
/// therefore removes the segment once no process is attached to it anymore;
/// the kernel detaches a dying process on its own, which leaves the segment
/// at zero attachments for the next probe to clean up.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysvSharedMemory;

impl SharedMemory for SysvSharedMemory {
    fn lock(&self, key: &SegmentKey, lock_dir: &Path) -> ForgeResult<ProbeLock> {
        // The lock file is never unlinked: a process blocked on the old
        // inode would otherwise race one that created a new file.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_dir.join(key.lock_file_name()))?;

        loop {
            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
                break;
            }
            let errno = last_errno();
            if errno != libc::EINTR {
                return Err(ForgeError::SyscallError { call: "flock", errno });
            }
        }

        Ok(ProbeLock::from_file(file))
    }

    fn attach_detach(&self, key: &SegmentKey) -> ForgeResult<bool> {
        let id = unsafe { libc::shmget(key.sysv_key(), 0, 0) };
        if id < 0 {
            return match last_errno() {
                libc::ENOENT => Ok(false),
                errno => Err(ForgeError::SyscallError { call: "shmget", errno }),
            };
        }

        let addr = unsafe { libc::shmat(id, ptr::null(), libc::SHM_RDONLY) };
        if attach_failed(addr) {
            return Err(ForgeError::last_syscall("shmat"));
        }

        unsafe { detach(id, addr) }?;
        debug!("Probed existing segment for '{}' (shmid {})", key.token(), id);
        Ok(true)
    }

    fn create(&self, key: &SegmentKey) -> ForgeResult<Option<Box<dyn Segment>>> {
        let id = unsafe {
            libc::shmget(
                key.sysv_key(),
                SEGMENT_SIZE,
                libc::IPC_CREAT | libc::IPC_EXCL | SEGMENT_MODE,
            )
        };
        if id < 0 {
            return match last_errno() {
                libc::EEXIST => Ok(None),
                errno => Err(ForgeError::SyscallError { call: "shmget", errno }),
            };
        }

        let addr = unsafe { libc::shmat(id, ptr::null(), 0) };
        if attach_failed(addr) {
            let err = ForgeError::last_syscall("shmat");
            unsafe { libc::shmctl(id, libc::IPC_RMID, ptr::null_mut()) };
            return Err(err);
        }

        debug!("Created segment for '{}' (shmid {})", key.token(), id);
        Ok(Some(Box::new(SysvSegment { id, addr })))
    }
}

/// An attached System V segment owned by this process.
#[derive(Debug)]
pub struct SysvSegment {
    id: libc::c_int,
    addr: *mut libc::c_void,
}

// SAFETY: the mapping is never read or written through `addr`; it is only
// handed back to `shmdt`, which may be called from any thread.
unsafe impl Send for SysvSegment {}

impl Segment for SysvSegment {}

impl Drop for SysvSegment {
    fn drop(&mut self) {
        if let Err(e) = unsafe { detach(self.id, self.addr) } {
            warn!("Failed to release segment (shmid {}): {}", self.id, e);
        }
    }
}

// =========================================================================
// Helpers
// =========================================================================

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn attach_failed(addr: *mut libc::c_void) -> bool {
    addr as isize == -1
}

/// Detaches `addr` and removes the segment if nothing is attached anymore.
unsafe fn detach(id: libc::c_int, addr: *mut libc::c_void) -> ForgeResult<()> {
    if unsafe { libc::shmdt(addr) } < 0 {
        return Err(ForgeError::last_syscall("shmdt"));
    }

    let mut stat: libc::shmid_ds = unsafe { std::mem::zeroed() };
    if unsafe { libc::shmctl(id, libc::IPC_STAT, &mut stat) } < 0 {
        // Already removed by another detacher.
        return match last_errno() {
            libc::EINVAL | libc::EIDRM => Ok(()),
            errno => Err(ForgeError::SyscallError { call: "shmctl", errno }),
        };
    }

    if stat.shm_nattch == 0 {
        unsafe { libc::shmctl(id, libc::IPC_RMID, ptr::null_mut()) };
        debug!("Removed orphaned segment (shmid {})", id);
    }
    Ok(())
}
