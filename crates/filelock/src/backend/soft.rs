use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use super::{AcquireOutcome, FatalKind};

/// Soft locks never break on an mtime younger than this, even with `lifetime`
/// unset: a file that was just created a moment ago by a legitimate holder
/// shouldn't be mistaken for stale due to clock coarseness.
const STALE_FLOOR: Duration = Duration::from_secs(2);

/// Readers never trust more than this many bytes of holder metadata (spec.md §6).
const MAX_READ_BYTES: usize = 256;

pub(super) fn try_acquire(
    path: &Path,
    _mode: Option<u32>,
    lifetime: Option<Duration>,
) -> AcquireOutcome {
    let mut opts = OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    opts.custom_flags(libc::O_NOFOLLOW);

    match opts.open(path) {
        Ok(mut file) => {
            // Best-effort: spec.md §4.1.3/§6 require write errors to be suppressed.
            let _ = write_holder(&mut file);
            AcquireOutcome::Acquired(file)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            if is_stale(path, lifetime) {
                break_stale(path);
            }
            AcquireOutcome::Contended
        }
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            AcquireOutcome::Fatal(FatalKind::Permission, e)
        }
        #[cfg(unix)]
        Err(e) if e.raw_os_error() == Some(libc::EROFS) => {
            AcquireOutcome::Fatal(FatalKind::Permission, e)
        }
        Err(e) => AcquireOutcome::Fatal(FatalKind::Os, e),
    }
}

fn write_holder(file: &mut File) -> io::Result<()> {
    let pid = std::process::id();
    let hostname = gethostname::gethostname();
    write!(file, "{pid}\n{}\n", hostname.to_string_lossy())
}

fn is_stale(path: &Path, lifetime: Option<Duration>) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    let Ok(age) = SystemTime::now().duration_since(modified) else {
        return false;
    };
    if age < STALE_FLOOR {
        return false;
    }
    if let Some(lifetime) = lifetime {
        if age < lifetime {
            return false;
        }
    }

    let Some((pid, hostname)) = read_holder(path) else {
        // Not well-formed (spec.md §3): don't treat as stale on this basis alone.
        return false;
    };

    let local_hostname = gethostname::gethostname().to_string_lossy().into_owned();
    if hostname != local_hostname {
        return false;
    }

    !pid_alive(pid)
}

fn read_holder(path: &Path) -> Option<(i32, String)> {
    let mut file = std::fs::File::open(path).ok()?;
    let mut buf = [0u8; MAX_READ_BYTES];
    let n = file.read(&mut buf).ok()?;
    let text = std::str::from_utf8(&buf[..n]).ok()?;
    let mut lines = text.lines();
    let pid_line = lines.next()?;
    let host_line = lines.next()?;
    if pid_line.is_empty() || host_line.is_empty() {
        return None;
    }
    let pid: i32 = pid_line.parse().ok()?;
    Some((pid, host_line.to_string()))
}

#[cfg(unix)]
fn pid_alive(pid: i32) -> bool {
    // kill(pid, 0) sends no signal; ESRCH means the PID is gone, EPERM means it
    // exists but we can't signal it (still alive), anything else we treat as
    // alive too (conservative: never break a lock we can't be sure about).
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    !matches!(
        io::Error::last_os_error().raw_os_error(),
        Some(code) if code == libc::ESRCH
    )
}

#[cfg(windows)]
fn pid_alive(pid: i32) -> bool {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION};
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid as u32);
        if handle.is_null() {
            return false;
        }
        let _ = CloseHandle(handle);
        true
    }
}

/// Renames `path` aside (unique per our own pid) then unlinks the renamed file,
/// so a concurrent legitimate acquirer racing us sees either the original file
/// or nothing, never a half-broken lock (spec.md §6, "stale-break side file").
fn break_stale(path: &Path) {
    let mut aside = path.as_os_str().to_owned();
    aside.push(format!(".break.{}", std::process::id()));
    let aside = PathBuf::from(aside);
    if std::fs::rename(path, &aside).is_ok() {
        let _ = std::fs::remove_file(&aside);
    }
}

pub(super) fn release(file: File, path: &Path) {
    drop(file);
    let _ = std::fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn acquire_writes_two_line_pid_hostname_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        let outcome = try_acquire(&path, None, None);
        let AcquireOutcome::Acquired(file) = outcome else {
            panic!("expected Acquired");
        };
        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next().unwrap().parse::<u32>().unwrap(), std::process::id());
        assert!(!lines.next().unwrap().is_empty());
        assert!(lines.next().is_none());
        release(file, &path);
        assert!(!path.exists());
    }

    #[test]
    fn fresh_existing_lock_is_contended_not_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        let _outcome = try_acquire(&path, None, None);
        // A second attempt, immediately after, must never treat a
        // just-created lock as stale regardless of whether its holder
        // process is alive (the 2s floor in spec.md §4.1.3).
        let second = try_acquire(&path, None, None);
        assert_matches!(second, AcquireOutcome::Contended);
        assert!(path.exists());
    }

    #[test]
    fn dead_pid_past_floor_and_matching_host_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        // 2^22 + 1, per spec.md §8 S7: a PID astronomically unlikely to be
        // alive on any system under test.
        std::fs::write(&path, format!("{}\n{hostname}\n", (1u32 << 22) + 1)).unwrap();
        backdate(&path, Duration::from_secs(10));

        let outcome = try_acquire(&path, None, None);
        // Breaking a stale lock reports Contended so the acquire loop retries
        // immediately rather than surfacing an error.
        assert_matches!(outcome, AcquireOutcome::Contended);
        assert!(!path.exists(), "stale lock file should have been unlinked");
    }

    #[test]
    fn dead_pid_with_mismatched_hostname_is_not_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        std::fs::write(&path, format!("{}\nsome-other-host-entirely\n", (1u32 << 22) + 1)).unwrap();
        backdate(&path, Duration::from_secs(10));

        let outcome = try_acquire(&path, None, None);
        assert_matches!(outcome, AcquireOutcome::Contended);
        assert!(path.exists(), "lock on a different host must never be broken");
    }

    #[test]
    fn malformed_content_is_not_treated_as_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        std::fs::write(&path, "not-a-pid\n").unwrap();
        backdate(&path, Duration::from_secs(10));

        let outcome = try_acquire(&path, None, None);
        assert_matches!(outcome, AcquireOutcome::Contended);
        assert!(path.exists());
    }

    #[test]
    fn lifetime_extends_staleness_beyond_the_floor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        std::fs::write(&path, format!("{}\n{hostname}\n", (1u32 << 22) + 1)).unwrap();
        // Past the 2s floor but not past a configured 60s lifetime: must not
        // be broken yet.
        backdate(&path, Duration::from_secs(10));
        let outcome = try_acquire(&path, None, Some(Duration::from_secs(60)));
        assert_matches!(outcome, AcquireOutcome::Contended);
        assert!(path.exists());
    }

    fn backdate(path: &Path, age: Duration) {
        let mtime = filetime::FileTime::from_system_time(SystemTime::now() - age);
        filetime::set_file_mtime(path, mtime).unwrap();
    }
}
