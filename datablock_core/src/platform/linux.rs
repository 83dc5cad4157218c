//! Linux implementation of the platform primitives: POSIX shared-memory
//! mapping via `/dev/shm`, `kill(pid, 0)` liveness probing, and a
//! process-shared robust `pthread_mutex_t` for the header's rare control
//! path (§4.6, §5 "Shared-resource policy").

use datablock_common::error::{DataBlockError, DataBlockResult};
use memmap2::{MmapMut, MmapOptions};
use nix::sys::signal::kill;
use nix::unistd::{getpid, Pid};
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Canonical path for a named segment: `/dev/shm/<prefix>_<name>`,
/// without a per-pid suffix — channels are looked up by name alone, not
/// by creating process.
pub fn segment_path(name: &str) -> String {
    format!("/dev/shm/datablock_{name}")
}

/// Create (or truncate) and map a new segment of `size` bytes, mode 0600
/// (§4.1 step 2).
pub fn create_segment_mmap(name: &str, size: usize) -> DataBlockResult<MmapMut> {
    let path = segment_path(name);

    if std::path::Path::new(&path).exists() {
        return Err(DataBlockError::AlreadyExists {
            name: name.to_string(),
        });
    }

    let file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .mode(0o600)
        .open(&path)
        .map_err(|e| DataBlockError::MapFailed {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

    file.set_len(size as u64).map_err(|e| DataBlockError::MapFailed {
        name: name.to_string(),
        reason: e.to_string(),
    })?;

    let mmap = unsafe { MmapOptions::new().map_mut(&file) }.map_err(|e| {
        DataBlockError::MapFailed {
            name: name.to_string(),
            reason: e.to_string(),
        }
    })?;

    Ok(mmap)
}

/// Attach read-write to an existing segment by channel name.
pub fn attach_segment_mmap(name: &str) -> DataBlockResult<(MmapMut, usize)> {
    let path = segment_path(name);

    let file = OpenOptions::new().read(true).write(true).open(&path).map_err(|_| {
        DataBlockError::NotFound {
            name: name.to_string(),
        }
    })?;

    let observed_size = file
        .metadata()
        .map_err(|e| DataBlockError::MapFailed {
            name: name.to_string(),
            reason: e.to_string(),
        })?
        .len() as usize;

    let mmap = unsafe { MmapOptions::new().map_mut(&file) }.map_err(|e| {
        DataBlockError::MapFailed {
            name: name.to_string(),
            reason: e.to_string(),
        }
    })?;

    Ok((mmap, observed_size))
}

/// Unlink a segment's backing file. Idempotent: missing file is not an
/// error (the producer may be racing a previous cleanup).
pub fn unlink_segment(name: &str) -> DataBlockResult<()> {
    let path = segment_path(name);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DataBlockError::OsError { source: e }),
    }
}

/// List channel names of every `datablock_*` segment currently under
/// `/dev/shm` (used by discovery and the CLI's `cleanup` subcommand).
pub fn list_segments() -> Vec<String> {
    let Ok(entries) = std::fs::read_dir("/dev/shm") else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter_map(|n| n.strip_prefix("datablock_").map(str::to_string))
        .collect()
}

/// Check if `pid` is alive using a null signal (§4.5).
///
/// Best-effort: PID reuse is acknowledged and mitigated elsewhere by
/// `write_generation` monotonicity, not by this probe.
pub fn is_process_alive(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::Error::ESRCH) => false,
        Err(nix::Error::EPERM) => true,
        Err(_) => false,
    }
}

/// The calling process's pid.
pub fn current_pid() -> u32 {
    getpid().as_raw() as u32
}

/// Monotonic nanosecond timestamp, suitable for heartbeat and metrics
/// timestamps. Wall-clock based (`SystemTime`) rather than `Instant`
/// because timestamps must be comparable across processes, which
/// `Instant` does not guarantee.
pub fn monotonic_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos() as u64
}

/// Process-shared, robust control mutex guarding the header's rare
/// control operations (§5 "Shared-resource policy"): spinlock array
/// allocation/release and heartbeat-slot claiming.
///
/// Wraps a `pthread_mutex_t` constructed in place inside the header's
/// 64-byte `mutex_storage` field with `PTHREAD_PROCESS_SHARED` and
/// `PTHREAD_MUTEX_ROBUST` attributes, so a crash while holding it is
/// recoverable by the next locker rather than wedging the segment forever.
pub struct ControlMutex {
    raw: *mut libc::pthread_mutex_t,
}

// SAFETY: the underlying pthread_mutex_t is explicitly constructed with
// PTHREAD_PROCESS_SHARED and is designed to be used concurrently from
// multiple threads/processes; our wrapper only ever hands out `&self`
// methods that go through the mutex's own locking.
unsafe impl Send for ControlMutex {}
unsafe impl Sync for ControlMutex {}

/// RAII guard returned by [`ControlMutex::lock`]; unlocks on drop.
pub struct ControlMutexGuard<'a> {
    mutex: &'a ControlMutex,
}

impl Drop for ControlMutexGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.mutex.raw);
        }
    }
}

impl ControlMutex {
    /// Construct a robust, process-shared mutex in the given 64-byte
    /// storage. Called once by the producer during segment creation
    /// (§4.1 step 6, `init_state` transitions to `MutexReady` right
    /// after this returns).
    ///
    /// # Safety
    /// `storage` must point to at least `size_of::<pthread_mutex_t>()`
    /// writable bytes that no other thread or process is concurrently
    /// accessing.
    pub unsafe fn construct_in_place(storage: *mut u8) -> DataBlockResult<()> {
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            if libc::pthread_mutexattr_init(&mut attr) != 0 {
                return Err(DataBlockError::MutexPoisoned {
                    name: "<init>".to_string(),
                });
            }
            libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);

            let mutex_ptr = storage as *mut libc::pthread_mutex_t;
            let rc = libc::pthread_mutex_init(mutex_ptr, &attr);
            libc::pthread_mutexattr_destroy(&mut attr);

            if rc != 0 {
                return Err(DataBlockError::MutexPoisoned {
                    name: "<init>".to_string(),
                });
            }
            Ok(())
        }
    }

    /// Attach to an already-constructed mutex at `storage` (every
    /// subsequent process just reinterprets the bytes; pthread robust
    /// mutexes need no per-attacher setup).
    ///
    /// # Safety
    /// `storage` must point to a `pthread_mutex_t` previously initialised
    /// by [`ControlMutex::construct_in_place`] and must outlive `self`.
    pub unsafe fn from_storage(storage: *mut u8) -> Self {
        Self {
            raw: storage as *mut libc::pthread_mutex_t,
        }
    }

    /// Lock the mutex, recovering from a previous holder's death.
    ///
    /// On `EOWNERDEAD`, the lock is held but the mutex is marked
    /// inconsistent; callers must validate whatever invariant the mutex
    /// protects and then call [`ControlMutex::mark_consistent`], or the
    /// next lock attempt will fail with `ENOTRECOVERABLE`.
    pub fn lock(&self) -> Result<(ControlMutexGuard<'_>, bool), DataBlockError> {
        let rc = unsafe { libc::pthread_mutex_lock(self.raw) };
        match rc {
            0 => Ok((ControlMutexGuard { mutex: self }, false)),
            libc::EOWNERDEAD => Ok((ControlMutexGuard { mutex: self }, true)),
            _ => Err(DataBlockError::MutexPoisoned {
                name: "<lock>".to_string(),
            }),
        }
    }

    /// Mark the mutex consistent after validating the fields it protects,
    /// following an `EOWNERDEAD` recovery (§5).
    pub fn mark_consistent(&self) {
        unsafe {
            libc::pthread_mutex_consistent(self.raw);
        }
    }
}
