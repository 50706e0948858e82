//! Memory-mapped access to individual cache files.
//!
//! Every backing cache file is reachable through a [`LazyFileAccessor`]: a
//! stable, path-keyed handle holding only a weak reference to the actual
//! mapping. `lock()` upgrades the weak reference or re-materializes the
//! mapping, so the process-wide cap on simultaneously mapped files can be
//! enforced without invalidating handles held by the virtual memory map.
//!
//! Files are mapped privately (copy-on-write): slide-info pointer writes
//! land in anonymous pages and never reach disk, and concurrent sessions on
//! the same cache observe independent contents.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};

use memmap2::{MmapMut, MmapOptions};
use tracing::debug;
use zerocopy::FromBytes;

use crate::error::{Error, Result};
use crate::util::memchr_null;

/// Default cap on simultaneously mapped files.
pub const DEFAULT_FILE_CAP: usize = 100;

/// How many recently released mappings each session keeps warm.
const REFERENCE_HOLDER_DEPTH: usize = 10;

/// Number of live mappings, for diagnostics.
static MMAP_COUNT: AtomicU64 = AtomicU64::new(0);

/// Returns the number of currently materialized file mappings.
pub fn mapped_file_count() -> u64 {
    MMAP_COUNT.load(Ordering::Relaxed)
}

// =============================================================================
// Counting Semaphore
// =============================================================================

/// A counting semaphore bounding the number of live mappings.
struct CountingSemaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl CountingSemaphore {
    fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cv: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cv.wait(count).unwrap();
        }
        *count -= 1;
    }

    fn release(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cv.notify_one();
    }
}

// =============================================================================
// Mapped File Accessor
// =============================================================================

/// A materialized, memory-mapped cache file.
///
/// The mapping is private and writable; see [`MappedFileAccessor::write_pointer`].
pub struct MappedFileAccessor {
    path: PathBuf,
    map: MmapMut,
    slide_applied: AtomicBool,
}

impl MappedFileAccessor {
    fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::MissingFile {
                path: path.to_path_buf(),
            });
        }
        let file = File::open(path).map_err(|_| Error::MissingFile {
            path: path.to_path_buf(),
        })?;
        // map_copy gives a private copy-on-write mapping: pointer rewrites
        // stay in memory and are never flushed to the cache file.
        let map = unsafe { MmapOptions::new().map_copy(&file) }.map_err(|e| Error::MemoryMap {
            path: path.to_path_buf(),
            source: e,
        })?;
        MMAP_COUNT.fetch_add(1, Ordering::Relaxed);
        Ok(Self {
            path: path.to_path_buf(),
            map,
            slide_applied: AtomicBool::new(false),
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    /// Returns true if the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Whether slide info has already been applied to this mapping.
    pub fn slide_applied(&self) -> bool {
        self.slide_applied.load(Ordering::Acquire)
    }

    /// Marks slide info as applied.
    pub fn set_slide_applied(&self, applied: bool) {
        self.slide_applied.store(applied, Ordering::Release);
    }

    fn check(&self, offset: u64, len: usize) -> Result<usize> {
        let end = offset.checked_add(len as u64);
        match end {
            Some(end) if end <= self.len() => Ok(offset as usize),
            _ => Err(Error::MappingRead {
                offset,
                len,
                mapped: self.len(),
            }),
        }
    }

    /// Borrows `len` bytes at `offset`. The slice is valid only while this
    /// strong reference is held.
    pub fn read_span(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let start = self.check(offset, len)?;
        Ok(&self.map[start..start + len])
    }

    /// Reads `len` bytes at `offset` into an owned buffer.
    pub fn read_buffer(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        Ok(self.read_span(offset, len)?.to_vec())
    }

    /// Copies bytes at `offset` into `dest`.
    pub fn read_into(&self, offset: u64, dest: &mut [u8]) -> Result<()> {
        dest.copy_from_slice(self.read_span(offset, dest.len())?);
        Ok(())
    }

    /// Reads a zerocopy structure at `offset`.
    pub fn read_obj<T: FromBytes>(&self, offset: u64) -> Result<T> {
        let span = self.read_span(offset, std::mem::size_of::<T>())?;
        T::read_from_bytes(span).map_err(|_| Error::malformed(offset, "misaligned structure read"))
    }

    /// Reads a u8 at `offset`.
    pub fn read_u8(&self, offset: u64) -> Result<u8> {
        Ok(self.read_span(offset, 1)?[0])
    }

    /// Reads a little-endian u16 at `offset`.
    pub fn read_u16(&self, offset: u64) -> Result<u16> {
        Ok(crate::util::read_u16_le(self.read_span(offset, 2)?))
    }

    /// Reads a little-endian u32 at `offset`.
    pub fn read_u32(&self, offset: u64) -> Result<u32> {
        Ok(crate::util::read_u32_le(self.read_span(offset, 4)?))
    }

    /// Reads a little-endian u64 at `offset`.
    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        Ok(crate::util::read_u64_le(self.read_span(offset, 8)?))
    }

    /// Reads a NUL-terminated string starting at `offset`.
    pub fn read_cstring(&self, offset: u64) -> Result<String> {
        if offset >= self.len() {
            return Err(Error::MappingRead {
                offset,
                len: 1,
                mapped: self.len(),
            });
        }
        let bytes = &self.map[offset as usize..];
        let end = memchr_null(bytes);
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// Writes a pointer-sized word in place.
    ///
    /// Used exclusively by the slide rewriter, which runs at most once per
    /// file under the per-view operation lock. The mapping is private, so
    /// the write is invisible to other sessions and to the file on disk.
    pub fn write_pointer(&self, offset: u64, value: u64) -> Result<()> {
        let start = self.check(offset, 8)?;
        // SAFETY: offset+8 is in bounds (checked above). The only writer is
        // the slide rewriter, serialized per file by `slide_applied` plus the
        // per-view operation lock; racing applications write identical
        // resolved values.
        unsafe {
            let ptr = self.map.as_ptr().add(start) as *mut u8;
            ptr.copy_from_nonoverlapping(value.to_le_bytes().as_ptr(), 8);
        }
        Ok(())
    }
}

impl Drop for MappedFileAccessor {
    fn drop(&mut self) {
        MMAP_COUNT.fetch_sub(1, Ordering::Relaxed);
        registry().semaphore.release();
        debug!(path = %self.path.display(), "unmapped cache file");
    }
}

impl std::fmt::Debug for MappedFileAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFileAccessor")
            .field("path", &self.path)
            .field("len", &self.len())
            .field("slide_applied", &self.slide_applied())
            .finish()
    }
}

// =============================================================================
// Lazy File Accessor
// =============================================================================

/// Routine invoked after a file is (re)materialized, before the mapping is
/// handed to the caller. The image loader uses this to request slide
/// rewriting lazily.
pub type PostAllocRoutine = Arc<dyn Fn(&Arc<MappedFileAccessor>) + Send + Sync>;

/// A stable handle to a cache file that may or may not be mapped.
///
/// Holds a weak reference to the mapping; [`LazyFileAccessor::lock`]
/// upgrades it or re-opens the file, blocking on the file-cap semaphore if
/// too many files are live.
pub struct LazyFileAccessor {
    path: PathBuf,
    session_id: u64,
    slot: Mutex<Weak<MappedFileAccessor>>,
    post_alloc: Mutex<Option<PostAllocRoutine>>,
}

impl LazyFileAccessor {
    fn new(path: PathBuf, session_id: u64) -> Self {
        Self {
            path,
            session_id,
            slot: Mutex::new(Weak::new()),
            post_alloc: Mutex::new(None),
        }
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Installs the post-materialization routine if one is not already set.
    pub fn set_post_alloc(&self, routine: PostAllocRoutine) {
        let mut slot = self.post_alloc.lock().unwrap();
        if slot.is_none() {
            *slot = Some(routine);
        }
    }

    /// Returns the mapping if it is currently materialized, without
    /// allocating a new one.
    pub fn lock_no_allocate(&self) -> Option<Arc<MappedFileAccessor>> {
        self.slot.lock().unwrap().upgrade()
    }

    /// Returns a strong reference to the mapping, materializing it if the
    /// weak reference has expired.
    pub fn lock(&self) -> Result<Arc<MappedFileAccessor>> {
        let mut slot = self.slot.lock().unwrap();
        if let Some(strong) = slot.upgrade() {
            return Ok(strong);
        }

        let reg = registry();
        reg.semaphore.acquire();
        let accessor = match MappedFileAccessor::open(&self.path) {
            Ok(a) => Arc::new(a),
            Err(e) => {
                reg.semaphore.release();
                return Err(e);
            }
        };
        *slot = Arc::downgrade(&accessor);
        drop(slot);

        reg.retain(self.session_id, Arc::clone(&accessor));

        let routine = self.post_alloc.lock().unwrap().clone();
        if let Some(routine) = routine {
            (routine.as_ref())(&accessor);
        }
        Ok(accessor)
    }
}

impl std::fmt::Debug for LazyFileAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyFileAccessor")
            .field("path", &self.path)
            .field("session_id", &self.session_id)
            .finish()
    }
}

// =============================================================================
// Process-wide Registry
// =============================================================================

struct AccessorRegistry {
    semaphore: CountingSemaphore,
    accessors: Mutex<HashMap<(u64, PathBuf), Arc<LazyFileAccessor>>>,
    // Recently materialized mappings, retained per session so rapid
    // acquire/release cycles do not thrash mmap.
    reference_holder: Mutex<HashMap<u64, VecDeque<Arc<MappedFileAccessor>>>>,
}

impl AccessorRegistry {
    fn retain(&self, session_id: u64, accessor: Arc<MappedFileAccessor>) {
        let mut holder = self.reference_holder.lock().unwrap();
        let deque = holder.entry(session_id).or_default();
        deque.push_back(accessor);
        while deque.len() > REFERENCE_HOLDER_DEPTH {
            deque.pop_front();
        }
    }
}

fn registry() -> &'static AccessorRegistry {
    static REGISTRY: OnceLock<AccessorRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| AccessorRegistry {
        semaphore: CountingSemaphore::new(DEFAULT_FILE_CAP),
        accessors: Mutex::new(HashMap::new()),
        reference_holder: Mutex::new(HashMap::new()),
    })
}

/// Returns the lazy accessor for `path` within `session_id`, creating one
/// if the path has not been opened before.
///
/// The path does not need to exist yet; materialization fails with
/// [`Error::MissingFile`] on `lock()` if it is absent.
pub fn open(session_id: u64, path: impl AsRef<Path>) -> Arc<LazyFileAccessor> {
    let path = path.as_ref().to_path_buf();
    let mut accessors = registry().accessors.lock().unwrap();
    Arc::clone(
        accessors
            .entry((session_id, path.clone()))
            .or_insert_with(|| Arc::new(LazyFileAccessor::new(path, session_id))),
    )
}

/// Drops all handles belonging to a session: warm mappings are released and
/// path-keyed accessors forgotten.
pub fn close_session(session_id: u64) {
    let reg = registry();
    reg.reference_holder.lock().unwrap().remove(&session_id);
    reg.accessors
        .lock()
        .unwrap()
        .retain(|(sid, _), _| *sid != session_id);
    debug!(session_id, "closed file accessor session");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(name: &str, contents: &[u8]) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("dscload-accessor-{}-{}", std::process::id(), name));
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn test_missing_file() {
        let handle = open(9001, "/nonexistent/dscload-test-file");
        assert!(matches!(handle.lock(), Err(Error::MissingFile { .. })));
        close_session(9001);
    }

    #[test]
    fn test_read_and_rematerialize() {
        let path = temp_file("rw", &[1, 2, 3, 4, 5, 6, 7, 8, 0x41, 0x42, 0]);
        let handle = open(9002, &path);

        {
            let strong = handle.lock().unwrap();
            assert_eq!(strong.read_u64(0).unwrap(), 0x0807060504030201);
            assert_eq!(strong.read_cstring(8).unwrap(), "AB");
            assert!(strong.read_u64(8).is_err());
        }

        // Weak handle may have expired (reference holder keeps it warm);
        // either way lock() must produce a usable mapping again.
        let strong = handle.lock().unwrap();
        assert_eq!(strong.read_u16(0).unwrap(), 0x0201);

        close_session(9002);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_write_pointer_is_private() {
        let path = temp_file("wp", &[0u8; 16]);
        let handle = open(9003, &path);
        let strong = handle.lock().unwrap();
        strong.write_pointer(8, 0x1122334455667788).unwrap();
        assert_eq!(strong.read_u64(8).unwrap(), 0x1122334455667788);

        // The file on disk is untouched.
        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk, vec![0u8; 16]);

        close_session(9003);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_slide_applied_flag() {
        let path = temp_file("flag", &[0u8; 8]);
        let handle = open(9004, &path);
        let strong = handle.lock().unwrap();
        assert!(!strong.slide_applied());
        strong.set_slide_applied(true);
        assert!(strong.slide_applied());
        close_session(9004);
        std::fs::remove_file(&path).ok();
    }
}
