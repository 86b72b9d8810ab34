//! Platform capability shim for named shared memory.
//!
//! [`SharedMemory`] is the narrow interface the instance guard needs from the
//! OS. Desktop and server targets get a real backend; targets without a named
//! shared memory facility (Android, iOS) get [`NullSharedMemory`], which never
//! blocks start-up.

use std::fmt;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use crate::error::{ForgeError, ForgeResult};
use crate::types::SegmentKey;

#[cfg(all(unix, not(any(target_os = "android", target_os = "ios"))))]
pub mod unix;

#[cfg(windows)]
pub mod windows;

/// A created segment. Dropping it detaches this process from the segment.
pub trait Segment: fmt::Debug + Send {}

/// Named shared memory as seen by the instance guard.
pub trait SharedMemory: fmt::Debug + Send + Sync {
    /// `false` means exclusivity cannot be enforced on this target.
    fn is_supported(&self) -> bool {
        true
    }

    /// Serializes probe-and-create sequences for `key` across threads and
    /// processes. Held until the returned lock is dropped.
    fn lock(&self, _key: &SegmentKey, _lock_dir: &Path) -> ForgeResult<ProbeLock> {
        Ok(ProbeLock::none())
    }

    /// Attaches read-only to an existing segment and detaches again.
    /// Returns whether a segment was found. A missing segment is not an error.
    fn attach_detach(&self, key: &SegmentKey) -> ForgeResult<bool>;

    /// Creates the segment exclusively. `Ok(None)` means it already exists.
    fn create(&self, key: &SegmentKey) -> ForgeResult<Option<Box<dyn Segment>>>;
}

/// Advisory lock returned by [`SharedMemory::lock`]. Unlocks on drop.
#[derive(Debug)]
pub struct ProbeLock {
    _file: Option<File>,
}

impl ProbeLock {
    pub fn none() -> Self {
        ProbeLock { _file: None }
    }

    /// Wraps a file whose descriptor holds an OS lock; closing it releases the lock.
    pub fn from_file(file: File) -> Self {
        ProbeLock { _file: Some(file) }
    }
}

// =========================================================================
// Null backend
// =========================================================================

/// Permissive backend for targets without named shared memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSharedMemory;

impl SharedMemory for NullSharedMemory {
    fn is_supported(&self) -> bool {
        false
    }

    fn attach_detach(&self, _key: &SegmentKey) -> ForgeResult<bool> {
        Ok(false)
    }

    fn create(&self, _key: &SegmentKey) -> ForgeResult<Option<Box<dyn Segment>>> {
        Err(ForgeError::Unsupported)
    }
}

/// The backend selected for the build target.
#[cfg(all(unix, not(any(target_os = "android", target_os = "ios"))))]
pub fn default_backend() -> Arc<dyn SharedMemory> {
    Arc::new(unix::SysvSharedMemory)
}

/// The backend selected for the build target.
#[cfg(windows)]
pub fn default_backend() -> Arc<dyn SharedMemory> {
    Arc::new(windows::FileMappingSharedMemory)
}

/// The backend selected for the build target.
#[cfg(not(any(all(unix, not(any(target_os = "android", target_os = "ios"))), windows)))]
pub fn default_backend() -> Arc<dyn SharedMemory> {
    Arc::new(NullSharedMemory)
}
