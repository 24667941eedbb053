use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;

use fs4::fs_std::FileExt;

use super::{sys, AcquireOutcome, FatalKind, LockMode};

pub(super) fn try_acquire(path: &Path, mode: Option<u32>, lock_mode: LockMode) -> AcquireOutcome {
    let mut create_opts = OpenOptions::new();
    create_opts.read(true).write(true).create(true).truncate(true);
    apply_no_follow(&mut create_opts);
    if let Some(mode) = mode {
        create_opts.mode(mode);
    }

    let file = match create_opts.open(path) {
        Ok(f) => f,
        // Sticky-bit directories (e.g. /tmp) can deny O_CREAT on a file that
        // already exists even though the owner could still open it for writing.
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied && path.exists() => {
            let mut retry_opts = OpenOptions::new();
            retry_opts.read(true).write(true);
            apply_no_follow(&mut retry_opts);
            match retry_opts.open(path) {
                Ok(f) => f,
                Err(e) => return classify_open_error(e),
            }
        }
        Err(e) => return classify_open_error(e),
    };

    if let Some(mode) = mode {
        // Not necessarily our file; tolerate failure setting permissions.
        let _ = file.set_permissions(std::fs::Permissions::from_mode(mode));
    }

    let lock_result = match lock_mode {
        LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
        LockMode::Shared => FileExt::try_lock_shared(&file),
    };

    // fs4 0.13's `try_lock_{exclusive,shared}` return `Ok(false)` for
    // "would block", mirroring `std::fs::File::try_lock`: it never returns
    // `WouldBlock` as an `Err`. Only a genuine OS failure comes back as `Err`.
    match lock_result {
        Ok(true) => {}
        Ok(false) => return AcquireOutcome::Contended,
        Err(e) if sys::error_unsupported(&e) => {
            return AcquireOutcome::Fatal(FatalKind::Unsupported, e)
        }
        Err(e) => return AcquireOutcome::Fatal(FatalKind::Os, e),
    }

    // A concurrent releaser may have unlinked the path between our open and our
    // lock; we'd then be holding a lock on a dead inode nobody else can see.
    match file.metadata() {
        Ok(meta) if meta.nlink() == 0 => {
            let _ = FileExt::unlock(&file);
            AcquireOutcome::Contended
        }
        _ => AcquireOutcome::Acquired(file),
    }
}

fn apply_no_follow(opts: &mut OpenOptions) {
    #[cfg(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    {
        opts.custom_flags(libc::O_NOFOLLOW);
    }
}

fn classify_open_error(e: io::Error) -> AcquireOutcome {
    if e.kind() == io::ErrorKind::PermissionDenied {
        AcquireOutcome::Fatal(FatalKind::Permission, e)
    } else {
        AcquireOutcome::Fatal(FatalKind::Os, e)
    }
}

pub(super) fn release(file: File, path: &Path) {
    // Unlink before unlocking: a waiter that opens the path after the unlink
    // but before our unlock simply contends on a lock that's about to free up,
    // rather than racing to recreate a file we're about to delete under it.
    let _ = std::fs::remove_file(path);
    let _ = FileExt::unlock(&file);
    drop(file);
}
