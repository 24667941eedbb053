use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::os::windows::io::AsRawHandle;
use std::path::Path;

use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::Storage::FileSystem::{
    LockFileEx, UnlockFile, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
};

use super::{sys, AcquireOutcome, FatalKind, LockMode};

pub(super) fn try_acquire(path: &Path, _mode: Option<u32>, lock_mode: LockMode) -> AcquireOutcome {
    let file = match OpenOptions::new().read(true).write(true).create(true).open(path) {
        Ok(f) => f,
        // Windows returns access-denied when another process actively holds the
        // file open in an incompatible sharing mode, which happens to be exactly
        // our contention signal here.
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => return AcquireOutcome::Contended,
        Err(e) => return AcquireOutcome::Fatal(FatalKind::Os, e),
    };

    match lock_byte(&file, lock_mode) {
        Ok(()) => AcquireOutcome::Acquired(file),
        Err(e) if sys::error_contended(&e) => AcquireOutcome::Contended,
        Err(e) if sys::error_unsupported(&e) => AcquireOutcome::Fatal(FatalKind::Unsupported, e),
        Err(e) => AcquireOutcome::Fatal(FatalKind::Os, e),
    }
}

fn lock_byte(file: &File, lock_mode: LockMode) -> io::Result<()> {
    let flags = match lock_mode {
        LockMode::Exclusive => LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
        LockMode::Shared => LOCKFILE_FAIL_IMMEDIATELY,
    };
    unsafe {
        let mut overlapped = mem::zeroed();
        let ret = LockFileEx(file.as_raw_handle() as HANDLE, flags, 0, 1, 0, &mut overlapped);
        if ret == 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

fn unlock_byte(file: &File) -> io::Result<()> {
    unsafe {
        let ret = UnlockFile(file.as_raw_handle() as HANDLE, 0, 0, 1, 0);
        if ret == 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

pub(super) fn release(file: File, path: &Path) {
    let _ = unlock_byte(&file);
    drop(file);
    let _ = std::fs::remove_file(path);
}
