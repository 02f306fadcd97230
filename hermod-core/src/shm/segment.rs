//! Shared-memory segments with explicit ownership
//!
//! A segment is created by exactly one process (the owner) and attached by
//! any number of others. Dropping a handle only detaches; removing the
//! backing object is an explicit [`ShmSegment::destroy`] call that only the
//! owner may make, and only while nobody else is attached.
//!
//! Three backings are supported:
//! - **Path**: a file (normally under `/dev/shm`) mapped with `memmap2`.
//!   Every holder takes a shared `flock`; the owner probes for an exclusive
//!   lock before removing the file.
//! - **SysV**: `shmget`/`shmat`, interoperable with the C++ gateway. Attach
//!   counts come from `shm_nattch`.
//! - **Anonymous**: private mapping for single-process use and tests.

use crate::core::errors::ShmError;
use memmap2::{MmapMut, MmapOptions};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Address of a shared-memory segment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShmKey {
    /// System V IPC key
    SysV(i32),
    /// Filesystem path, normally `/dev/shm/<name>`
    Path(PathBuf),
}

impl ShmKey {
    /// `/dev/shm/<name>`
    pub fn dev_shm(name: &str) -> Self {
        ShmKey::Path(Path::new("/dev/shm").join(name))
    }
}

impl fmt::Display for ShmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShmKey::SysV(key) => write!(f, "sysv:{:#x}", key),
            ShmKey::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentRole {
    /// Created the segment; the only holder allowed to destroy it
    Owner,
    /// Non-owning view onto a segment created elsewhere
    Attached,
}

enum Backing {
    Path {
        // Field order matters: the mapping is dropped before the file that
        // holds the shared lock.
        _map: MmapMut,
        file: File,
        path: PathBuf,
    },
    SysV {
        id: i32,
    },
    Anonymous {
        _map: MmapMut,
    },
}

/// A mapped shared-memory region
pub struct ShmSegment {
    base: NonNull<u8>,
    len: usize,
    role: SegmentRole,
    name: String,
    backing: Backing,
    destroyed: AtomicBool,
}

// SAFETY: the segment is a plain byte region; all concurrent access to its
// contents goes through atomics in the ring buffer and client store.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create a new zero-filled segment, failing if it already exists
    pub fn create(key: &ShmKey, len: usize) -> Result<Self, ShmError> {
        let segment = match key {
            ShmKey::Path(path) => Self::create_path(path, len)?,
            ShmKey::SysV(k) => Self::create_sysv(*k, len)?,
        };
        info!(segment = %segment.name, len, "Created shared memory segment");
        Ok(segment)
    }

    /// Attach to an existing segment of at least `len` bytes
    pub fn attach(key: &ShmKey, len: usize) -> Result<Self, ShmError> {
        let segment = match key {
            ShmKey::Path(path) => Self::attach_path(path, len)?,
            ShmKey::SysV(k) => Self::attach_sysv(*k, len)?,
        };
        info!(segment = %segment.name, len, "Attached to shared memory segment");
        Ok(segment)
    }

    /// Create the segment, or attach if another process won the race
    pub fn create_or_attach(key: &ShmKey, len: usize) -> Result<Self, ShmError> {
        match Self::create(key, len) {
            Err(ShmError::AlreadyExists { .. }) => Self::attach(key, len),
            other => other,
        }
    }

    /// Private zero-filled mapping owned by this process
    pub fn anonymous(len: usize) -> Result<Self, ShmError> {
        let mut map =
            MmapMut::map_anon(len.max(1)).map_err(|e| ShmError::os("mmap", "anonymous", e))?;
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| ShmError::InvalidLayout("anonymous mapping returned null".into()))?;
        Ok(Self {
            base,
            len,
            role: SegmentRole::Owner,
            name: "anonymous".to_string(),
            backing: Backing::Anonymous { _map: map },
            destroyed: AtomicBool::new(false),
        })
    }

    fn create_path(path: &Path, len: usize) -> Result<Self, ShmError> {
        let name = path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => ShmError::AlreadyExists { key: name.clone() },
                _ => ShmError::os("open", name.clone(), e),
            })?;
        // set_len zero-fills the new file
        file.set_len(len as u64)
            .map_err(|e| ShmError::os("ftruncate", name.clone(), e))?;
        Self::map_path(file, path.to_path_buf(), name, len, SegmentRole::Owner)
    }

    fn attach_path(path: &Path, len: usize) -> Result<Self, ShmError> {
        let name = path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => ShmError::NotFound { key: name.clone() },
                _ => ShmError::os("open", name.clone(), e),
            })?;
        let found = file
            .metadata()
            .map_err(|e| ShmError::os("stat", name.clone(), e))?
            .len() as usize;
        if found < len {
            return Err(ShmError::SizeMismatch {
                key: name,
                expected: len,
                found,
            });
        }
        Self::map_path(file, path.to_path_buf(), name, len, SegmentRole::Attached)
    }

    fn map_path(
        file: File,
        path: PathBuf,
        name: String,
        len: usize,
        role: SegmentRole,
    ) -> Result<Self, ShmError> {
        flock(&file, libc::LOCK_SH).map_err(|e| ShmError::os("flock", name.clone(), e))?;
        // SAFETY: the file stays open for the lifetime of the mapping and is
        // only ever resized by its creator before any attacher maps it.
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(&file) }
            .map_err(|e| ShmError::os("mmap", name.clone(), e))?;
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| ShmError::InvalidLayout(format!("{} mapped at null", name)))?;
        Ok(Self {
            base,
            len,
            role,
            name,
            backing: Backing::Path {
                _map: map,
                file,
                path,
            },
            destroyed: AtomicBool::new(false),
        })
    }

    fn create_sysv(key: i32, len: usize) -> Result<Self, ShmError> {
        let name = format!("{:#x}", key);
        let size = page_align(len);
        // SAFETY: plain syscall, arguments validated by the kernel
        let id = unsafe { libc::shmget(key, size, libc::IPC_CREAT | libc::IPC_EXCL | 0o666) };
        if id < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EEXIST) => ShmError::AlreadyExists { key: name },
                _ => ShmError::os("shmget", name, err),
            });
        }
        // Fresh SysV segments are zero-filled by the kernel
        Self::map_sysv(id, name, len, SegmentRole::Owner)
    }

    fn attach_sysv(key: i32, len: usize) -> Result<Self, ShmError> {
        let name = format!("{:#x}", key);
        // SAFETY: plain syscall
        let id = unsafe { libc::shmget(key, 0, 0o666) };
        if id < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOENT) => ShmError::NotFound { key: name },
                _ => ShmError::os("shmget", name, err),
            });
        }
        let stat = sysv_stat(id).map_err(|e| ShmError::os("shmctl", name.clone(), e))?;
        let found = stat.shm_segsz as usize;
        if found < len {
            return Err(ShmError::SizeMismatch {
                key: name,
                expected: len,
                found,
            });
        }
        Self::map_sysv(id, name, len, SegmentRole::Attached)
    }

    fn map_sysv(id: i32, name: String, len: usize, role: SegmentRole) -> Result<Self, ShmError> {
        // SAFETY: id refers to a live segment; a null address lets the kernel choose
        let addr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(ShmError::os("shmat", name, io::Error::last_os_error()));
        }
        let base = NonNull::new(addr as *mut u8)
            .ok_or_else(|| ShmError::InvalidLayout(format!("{} attached at null", name)))?;
        Ok(Self {
            base,
            len,
            role,
            name,
            backing: Backing::SysV { id },
            destroyed: AtomicBool::new(false),
        })
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn role(&self) -> SegmentRole {
        self.role
    }

    pub fn is_owner(&self) -> bool {
        self.role == SegmentRole::Owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the backing object so no new process can attach
    ///
    /// Only the owner may destroy, and only once every other holder has
    /// detached; otherwise `StillAttached` is returned and nothing changes.
    /// The mapping itself stays valid until this handle is dropped.
    pub fn destroy(&self) -> Result<(), ShmError> {
        if !self.is_owner() {
            return Err(ShmError::NotOwner {
                key: self.name.clone(),
            });
        }
        if self.destroyed.load(Ordering::Acquire) {
            return Ok(());
        }

        match &self.backing {
            Backing::Anonymous { .. } => {}
            Backing::Path { file, path, .. } => {
                // Upgrade our shared lock; fails while any attacher holds theirs
                if let Err(e) = flock(file, libc::LOCK_EX | libc::LOCK_NB) {
                    // A failed conversion may drop the lock we held
                    let _ = flock(file, libc::LOCK_SH);
                    if e.raw_os_error() == Some(libc::EWOULDBLOCK) {
                        return Err(ShmError::StillAttached {
                            key: self.name.clone(),
                        });
                    }
                    return Err(ShmError::os("flock", self.name.clone(), e));
                }
                let removed = fs::remove_file(path);
                // Back to shared so the lock state matches the handle role again
                let _ = flock(file, libc::LOCK_SH);
                removed.map_err(|e| ShmError::os("unlink", self.name.clone(), e))?;
            }
            Backing::SysV { id } => {
                let stat = sysv_stat(*id).map_err(|e| ShmError::os("shmctl", self.name.clone(), e))?;
                if stat.shm_nattch > 1 {
                    warn!(
                        segment = %self.name,
                        attached = stat.shm_nattch,
                        "Refusing to destroy segment with live attachments"
                    );
                    return Err(ShmError::StillAttached {
                        key: self.name.clone(),
                    });
                }
                // SAFETY: id is a live segment; IPC_RMID takes no buffer
                let rc = unsafe { libc::shmctl(*id, libc::IPC_RMID, std::ptr::null_mut()) };
                if rc != 0 {
                    return Err(ShmError::os(
                        "shmctl(IPC_RMID)",
                        self.name.clone(),
                        io::Error::last_os_error(),
                    ));
                }
            }
        }

        self.destroyed.store(true, Ordering::Release);
        info!(segment = %self.name, "Destroyed shared memory segment");
        Ok(())
    }

    /// Number of processes attached (SysV only)
    pub fn attach_count(&self) -> Option<u64> {
        match &self.backing {
            Backing::SysV { id } => sysv_stat(*id).ok().map(|s| s.shm_nattch as u64),
            _ => None,
        }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        if let Backing::SysV { .. } = self.backing {
            // SAFETY: base was returned by shmat and is detached exactly once
            let rc = unsafe { libc::shmdt(self.base.as_ptr() as *const libc::c_void) };
            if rc != 0 {
                warn!(segment = %self.name, error = %io::Error::last_os_error(), "shmdt failed");
            }
        }
        debug!(segment = %self.name, role = ?self.role, "Detached shared memory segment");
    }
}

impl fmt::Debug for ShmSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmSegment")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("role", &self.role)
            .finish()
    }
}

fn flock(file: &File, op: libc::c_int) -> io::Result<()> {
    // SAFETY: fd is owned by `file` and valid for the duration of the call
    let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn sysv_stat(id: i32) -> io::Result<libc::shmid_ds> {
    // SAFETY: shmid_ds is plain old data; the kernel fills it on success
    unsafe {
        let mut ds: libc::shmid_ds = std::mem::zeroed();
        if libc::shmctl(id, libc::IPC_STAT, &mut ds) == 0 {
            Ok(ds)
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

fn page_align(len: usize) -> usize {
    // SAFETY: sysconf has no preconditions
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page = if page > 0 { page as usize } else { 4096 };
    len.div_ceil(page) * page
}
