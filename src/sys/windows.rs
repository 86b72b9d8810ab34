use crate::error::{ForgeError, ForgeResult};
use crate::sys::{Segment, SharedMemory};
use crate::types::SegmentKey;
use log::debug;
use std::ffi::OsStr;
use std::io;
use std::os::windows::ffi::OsStrExt;

mod win_api {
    use std::ffi::c_void;

    #[link(name = "kernel32")]
    unsafe extern "system" {
        pub fn CreateFileMappingW(
            hFile: *mut c_void,
            lpFileMappingAttributes: *const c_void,
            flProtect: u32,
            dwMaximumSizeHigh: u32,
            dwMaximumSizeLow: u32,
            lpName: *const u16,
        ) -> *mut c_void;

        pub fn OpenFileMappingW(
            dwDesiredAccess: u32,
            bInheritHandle: i32,
            lpName: *const u16,
        ) -> *mut c_void;

        pub fn CloseHandle(hObject: *mut c_void) -> i32;
    }

    pub const INVALID_HANDLE_VALUE: *mut c_void = -1isize as *mut c_void;
    pub const PAGE_READWRITE: u32 = 0x04;
    pub const FILE_MAP_READ: u32 = 0x0004;
    pub const ERROR_FILE_NOT_FOUND: i32 = 2;
    pub const ERROR_ALREADY_EXISTS: i32 = 183;
}

const SEGMENT_SIZE: u32 = 1;

/// Named file mappings backed by the paging file.
///
/// Windows reference-counts mapping objects and closes every handle of a
/// dying process, so no leftover cleanup or probe lock is needed.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileMappingSharedMemory;

impl SharedMemory for FileMappingSharedMemory {
    fn attach_detach(&self, key: &SegmentKey) -> ForgeResult<bool> {
        let name = wide_name(key);
        unsafe {
            let handle = win_api::OpenFileMappingW(win_api::FILE_MAP_READ, 0, name.as_ptr());
            if handle.is_null() {
                let code = io::Error::last_os_error().raw_os_error().unwrap_or(0);
                if code == win_api::ERROR_FILE_NOT_FOUND {
                    return Ok(false);
                }
                return Err(ForgeError::Win32Error(code as u32));
            }
            win_api::CloseHandle(handle);
        }
        Ok(true)
    }

    fn create(&self, key: &SegmentKey) -> ForgeResult<Option<Box<dyn Segment>>> {
        let name = wide_name(key);
        unsafe {
            let handle = win_api::CreateFileMappingW(
                win_api::INVALID_HANDLE_VALUE,
                std::ptr::null(),
                win_api::PAGE_READWRITE,
                0,
                SEGMENT_SIZE,
                name.as_ptr(),
            );

            if handle.is_null() {
                return Err(ForgeError::Win32Error(
                    io::Error::last_os_error().raw_os_error().unwrap_or(0) as u32,
                ));
            }

            let last_err = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if last_err == win_api::ERROR_ALREADY_EXISTS {
                win_api::CloseHandle(handle);
                return Ok(None);
            }

            debug!("Created file mapping for '{}'", key.token());
            Ok(Some(Box::new(MappingHandle(handle))))
        }
    }
}

/// An owned file mapping handle. Closing the last one destroys the mapping.
#[derive(Debug)]
pub struct MappingHandle(*mut std::ffi::c_void);

// SAFETY: kernel handles are process-wide and may be closed from any thread.
unsafe impl Send for MappingHandle {}

impl Segment for MappingHandle {}

impl Drop for MappingHandle {
    fn drop(&mut self) {
        unsafe {
            if !self.0.is_null() {
                win_api::CloseHandle(self.0);
            }
        }
    }
}

fn wide_name(key: &SegmentKey) -> Vec<u16> {
    let unique_name = format!("Local\\{}", key.object_name());
    let mut wide: Vec<u16> = OsStr::new(&unique_name).encode_wide().collect();
    wide.push(0);
    wide
}
