// Named file mappings backed by the system paging file.

use std::ffi::OsStr;
use std::io;
use std::iter::once;
use std::os::windows::ffi::OsStrExt;
use windows::core::PCWSTR;
use windows::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, HANDLE, INVALID_HANDLE_VALUE,
};
use windows::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, FILE_MAP,
    FILE_MAP_ALL_ACCESS, FILE_MAP_READ, MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
};

fn to_wide(s: &str) -> Vec<u16> {
    OsStr::new(s).encode_wide().chain(once(0)).collect()
}

fn win32_error(e: windows::core::Error) -> io::Error {
    io::Error::other(e.message())
}

/// A mapped view plus the mapping handle keeping it alive.
struct MappedView {
    handle: HANDLE,
    view: MEMORY_MAPPED_VIEW_ADDRESS,
    len: usize,
}

impl MappedView {
    fn map(handle: HANDLE, access: FILE_MAP, len: usize) -> io::Result<Self> {
        let view = unsafe { MapViewOfFile(handle, access, 0, 0, len) };
        if view.Value.is_null() {
            let err = io::Error::last_os_error();
            unsafe {
                let _ = CloseHandle(handle);
            }
            return Err(err);
        }
        Ok(Self { handle, view, len })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.view.Value as *const u8, self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.view.Value as *mut u8, self.len) }
    }
}

impl Drop for MappedView {
    fn drop(&mut self) {
        unsafe {
            let _ = UnmapViewOfFile(self.view);
            let _ = CloseHandle(self.handle);
        }
    }
}

// The view is only touched by whichever thread owns the segment.
unsafe impl Send for MappedView {}
unsafe impl Sync for MappedView {}

/// A writable segment created by this process.
pub struct PlatformSegment {
    view: MappedView,
}

impl PlatformSegment {
    pub fn create(name: &str, len: usize) -> io::Result<Self> {
        let wide_name = to_wide(name);
        let size = len as u64;

        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE,
                (size >> 32) as u32,
                size as u32,
                PCWSTR(wide_name.as_ptr()),
            )
        }
        .map_err(win32_error)?;

        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            unsafe {
                let _ = CloseHandle(handle);
            }
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("shared memory '{}' already exists", name),
            ));
        }

        Ok(Self {
            view: MappedView::map(handle, FILE_MAP_ALL_ACCESS, len)?,
        })
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.view.as_mut_slice()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.view.as_slice()
    }
}

/// A read-only view of a segment created by another process.
pub struct PlatformView {
    view: MappedView,
}

impl PlatformView {
    pub fn open(name: &str, len: usize) -> io::Result<Self> {
        let wide_name = to_wide(name);
        let handle = unsafe {
            OpenFileMappingW(FILE_MAP_READ.0, false.into(), PCWSTR(wide_name.as_ptr()))
        }
        .map_err(win32_error)?;

        Ok(Self {
            view: MappedView::map(handle, FILE_MAP_READ, len)?,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        self.view.as_slice()
    }
}
